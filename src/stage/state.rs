use std::{fmt, str::FromStr};

use anyhow::{anyhow, Error};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Idle,
    Welcome,
    Collecting,
    Processing,
    Results,
    History,
    Goodbye,
}

impl Default for StageName {
    fn default() -> Self {
        StageName::Idle
    }
}

impl StageName {
    pub const ALL: [StageName; 7] = [
        StageName::Idle,
        StageName::Welcome,
        StageName::Collecting,
        StageName::Processing,
        StageName::Results,
        StageName::History,
        StageName::Goodbye,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Idle => "idle",
            StageName::Welcome => "welcome",
            StageName::Collecting => "collecting",
            StageName::Processing => "processing",
            StageName::Results => "results",
            StageName::History => "history",
            StageName::Goodbye => "goodbye",
        }
    }

    /// Stages during which someone is expected to be standing at the station.
    pub fn watches_presence(&self) -> bool {
        matches!(self, StageName::Results | StageName::History)
    }

    pub fn starts_cycle(&self) -> bool {
        matches!(self, StageName::Idle | StageName::Collecting)
    }

    pub fn scans_tags(&self) -> bool {
        matches!(self, StageName::Results)
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        StageName::ALL
            .into_iter()
            .find(|stage| stage.as_str() == value)
            .ok_or_else(|| anyhow!("unknown stage: {value}"))
    }
}

/// What observers see: `{"stage": name, ...auxiliary fields}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageSnapshot {
    pub stage: StageName,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StageSnapshot {
    pub fn new(stage: StageName) -> Self {
        Self {
            stage,
            extra: Map::new(),
        }
    }

    /// Replaces the stage name and merges `extra` over the existing fields.
    /// Idle and collecting start a new cycle, so they drop whatever the
    /// previous sample and user left behind first.
    pub fn apply(&mut self, stage: StageName, extra: Map<String, Value>) {
        if stage.starts_cycle() {
            self.extra.clear();
        }
        self.stage = stage;
        for (key, value) in extra {
            // "stage" is the name itself, never an auxiliary field.
            if key != "stage" {
                self.extra.insert(key, value);
            }
        }
    }

    pub fn field_i64(&self, key: &str) -> Option<i64> {
        self.extra.get(key).and_then(Value::as_i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn names_round_trip_through_strings() {
        for stage in StageName::ALL {
            assert_eq!(stage.as_str().parse::<StageName>().unwrap(), stage);
        }
        assert!("finished".parse::<StageName>().is_err());
    }

    #[test]
    fn extra_fields_accumulate() {
        let mut snapshot = StageSnapshot::default();
        snapshot.apply(
            StageName::Results,
            json!({"sample_id": 7, "result": "hydrated"})
                .as_object()
                .cloned()
                .unwrap(),
        );
        snapshot.apply(
            StageName::History,
            json!({"user_id": 3, "stage": "idle"}).as_object().cloned().unwrap(),
        );

        assert_eq!(snapshot.stage, StageName::History);
        assert_eq!(snapshot.field_i64("sample_id"), Some(7));
        assert_eq!(snapshot.field_i64("user_id"), Some(3));
        assert!(!snapshot.extra.contains_key("stage"));
    }

    #[test]
    fn snapshot_serialises_flat() {
        let mut snapshot = StageSnapshot::new(StageName::History);
        snapshot.extra.insert("user_id".into(), json!(12));

        assert_eq!(
            serde_json::to_value(&snapshot).unwrap(),
            json!({"stage": "history", "user_id": 12})
        );
    }

    #[test]
    fn new_cycle_forgets_the_previous_user() {
        let mut snapshot = StageSnapshot::default();
        snapshot.apply(
            StageName::History,
            json!({"sample_id": 7, "user_id": 3, "tag_uid": "04A1B2C3"})
                .as_object()
                .cloned()
                .unwrap(),
        );
        snapshot.apply(
            StageName::Collecting,
            json!({"sample_id": 8}).as_object().cloned().unwrap(),
        );

        assert_eq!(snapshot.field_i64("sample_id"), Some(8));
        assert!(!snapshot.extra.contains_key("user_id"));
        assert!(!snapshot.extra.contains_key("tag_uid"));

        snapshot.apply(StageName::Idle, Map::new());
        assert!(snapshot.extra.is_empty());
    }
}
