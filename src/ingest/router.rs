use std::{collections::BTreeMap, sync::Arc};

use serde_json::Value;

use crate::{
    config::MqttConfig,
    db::{Database, Record},
    log_debug, log_error, log_warn,
    samples::{MeasurementRecord, SampleManager},
};

use super::{IngestError, IngestResult};

const ENABLE_LOGS: bool = true;

/// Names a device may use for the sample marker on the measurement topic.
const MARKER_FIELDS: &[&str] = &["flag", "marker"];

/// Where a validated message goes.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Measurement(MeasurementRecord),
    Insert { table: String, record: Record },
}

/// What happened to a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Datapoint { datapoint_id: i64, sample_id: Option<i64> },
    Inserted { row_id: i64 },
}

/// Validates inbound messages and hands them to their destination. One
/// call per message; nothing is retried.
pub struct MessageRouter {
    db: Database,
    samples: Arc<SampleManager>,
    topics: BTreeMap<String, Vec<String>>,
    measurement_topic: String,
    device_field: String,
}

impl MessageRouter {
    pub fn new(db: Database, samples: Arc<SampleManager>, config: &MqttConfig) -> Self {
        Self {
            db,
            samples,
            topics: config.topics.clone(),
            measurement_topic: config.measurement_topic.clone(),
            device_field: config.device_field.clone(),
        }
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    /// Parses, checks and resolves one message without delivering it.
    pub async fn route(&self, topic: &str, payload: &[u8]) -> IngestResult<Route> {
        let required = self
            .topics
            .get(topic)
            .ok_or_else(|| IngestError::UnknownTopic(topic.to_string()))?;

        let mut record = parse_payload(payload)?;
        let aliases: &[&str] = if topic == self.measurement_topic {
            MARKER_FIELDS
        } else {
            &[]
        };
        check_required(&record, required, aliases)?;

        let address = match record.remove(&self.device_field) {
            Some(Value::String(address)) => address,
            Some(other) => {
                return Err(IngestError::invalid(
                    &self.device_field,
                    format!("expected a string address, got {other}"),
                ))
            }
            None => return Err(IngestError::MissingFields(vec![self.device_field.clone()])),
        };

        let device_id = self
            .db
            .resolve_device(&address)
            .await?
            .ok_or(IngestError::UnknownDevice(address))?;

        if topic == self.measurement_topic {
            return Ok(Route::Measurement(MeasurementRecord::from_record(device_id, &record)?));
        }

        record.insert("device_id".into(), Value::from(device_id));
        Ok(Route::Insert {
            table: table_for_topic(topic).to_string(),
            record,
        })
    }

    /// Routes and delivers one message.
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) -> IngestResult<Delivery> {
        match self.route(topic, payload).await? {
            Route::Measurement(measurement) => {
                let outcome = self.samples.handle_measurement(measurement).await?;
                Ok(Delivery::Datapoint {
                    datapoint_id: outcome.datapoint_id,
                    sample_id: outcome.sample_id,
                })
            }
            Route::Insert { table, record } => {
                let row_id = self.db.insert_record(&table, &record).await?;
                Ok(Delivery::Inserted { row_id })
            }
        }
    }

    /// Delivery loop entry point: logs the outcome and never fails.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) {
        match self.dispatch(topic, payload).await {
            Ok(Delivery::Datapoint { datapoint_id, sample_id }) => {
                log_debug!("{topic}: datapoint {datapoint_id} (sample {sample_id:?})");
            }
            Ok(Delivery::Inserted { row_id }) => {
                log_debug!("{topic}: row {row_id}");
            }
            Err(err) if err.is_validation() => {
                log_warn!("Dropped message on {topic}: {err}");
            }
            Err(err) => {
                log_error!("Failed to store message on {topic}: {err}");
            }
        }
    }
}

pub fn parse_payload(payload: &[u8]) -> IngestResult<Record> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(record)) => Ok(record),
        Ok(other) => Err(IngestError::Malformed(format!(
            "expected an object, got {}",
            kind_of(&other)
        ))),
        Err(err) => Err(IngestError::Malformed(err.to_string())),
    }
}

/// A required field listed in `aliases` is satisfied by any of them.
fn check_required(record: &Record, required: &[String], aliases: &[&str]) -> IngestResult<()> {
    let present = |field: &str| record.get(field).is_some_and(|value| !value.is_null());

    let missing: Vec<String> = required
        .iter()
        .filter(|field| {
            if aliases.contains(&field.as_str()) {
                !aliases.iter().any(|alias| present(alias))
            } else {
                !present(field)
            }
        })
        .cloned()
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(IngestError::MissingFields(missing))
    }
}

/// `station/7/logs` → `logs`.
pub fn table_for_topic(topic: &str) -> &str {
    topic.rsplit('/').next().unwrap_or(topic)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
