pub mod datapoints;
pub mod directory;
pub mod monitoring;
pub mod records;
pub mod samples;

pub use records::Record;
