use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One sample of the station's own resource usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub timestamp: DateTime<Utc>,
    pub cpu_usage: f32,
    pub cpu_temp: Option<f64>,
    pub ram_usage: f64,
    pub disk_usage: f64,
}
