pub mod datapoint;
pub mod sample;
pub mod system_metrics;

pub use datapoint::{Datapoint, Marker};
pub use sample::{Sample, SampleResult, SampleStatus};
pub use system_metrics::SystemMetrics;
