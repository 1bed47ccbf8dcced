pub mod analysis;
pub mod manager;

pub use analysis::{analyse_sample, SampleAnalysis};
pub use manager::{MeasurementOutcome, MeasurementRecord, SampleManager};
