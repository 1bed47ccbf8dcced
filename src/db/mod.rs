mod connection;
mod helpers;
mod migrations;
pub mod models;
mod repositories;

pub use connection::Database;
pub use helpers::parse_device_timestamp;
pub use models::{Datapoint, Marker, Sample, SampleResult, SampleStatus, SystemMetrics};
pub use repositories::Record;
