//! Sample data model.
//!
//! A sample is one measurement cycle of a device, bounded by the `open` and
//! `close` markers of its datapoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SampleStatus {
    Open,
    Closed,
}

impl SampleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleStatus::Open => "open",
            SampleStatus::Closed => "closed",
        }
    }
}

/// Classification computed by post-processing once a sample is closed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SampleResult {
    Hydrated,
    MildDehydration,
    Dehydrated,
    Inconclusive,
}

impl SampleResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleResult::Hydrated => "hydrated",
            SampleResult::MildDehydration => "mild_dehydration",
            SampleResult::Dehydrated => "dehydrated",
            SampleResult::Inconclusive => "inconclusive",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub id: i64,
    pub device_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SampleStatus,
    pub result: Option<SampleResult>,
    pub user_id: Option<i64>,
}
