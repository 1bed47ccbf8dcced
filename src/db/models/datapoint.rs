use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position of a datapoint inside its measurement cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Marker {
    Open,
    Mid,
    Close,
}

impl Marker {
    /// Integer encoding used on the wire and in `spectrum_datapoints.flag`.
    pub fn flag(&self) -> i64 {
        match self {
            Marker::Open => 1,
            Marker::Mid => 0,
            Marker::Close => -1,
        }
    }

    pub fn from_flag(flag: i64) -> Option<Self> {
        match flag {
            1 => Some(Marker::Open),
            0 => Some(Marker::Mid),
            -1 => Some(Marker::Close),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "open" => Some(Marker::Open),
            "mid" => Some(Marker::Mid),
            "close" => Some(Marker::Close),
            other => other.parse::<i64>().ok().and_then(Self::from_flag),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datapoint {
    pub id: Option<i64>,
    /// Sample open for the device when the reading arrived, if any.
    pub sample_id: Option<i64>,
    pub device_id: i64,
    pub channels: Vec<f64>,
    pub marker: Marker,
    pub timestamp: DateTime<Utc>,
}
