use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use crate::{
    config::ProcessingConfig,
    db::{parse_device_timestamp, Database, Datapoint, Marker, Record, SampleResult},
    ingest::{IngestError, IngestResult},
    stage::{StageController, StageName},
};

use super::analysis::{analyse_sample, SampleAnalysis};

/// One validated reading from the measurement topic.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    pub device_id: i64,
    pub marker: Marker,
    pub channels: Vec<f64>,
    pub timestamp: DateTime<Utc>,
}

impl MeasurementRecord {
    pub fn from_record(device_id: i64, record: &Record) -> IngestResult<Self> {
        let (field, raw_marker) = match (record.get("flag"), record.get("marker")) {
            (Some(flag), _) => ("flag", flag),
            (None, Some(marker)) => ("marker", marker),
            (None, None) => return Err(IngestError::MissingFields(vec!["flag".into()])),
        };

        Ok(Self {
            device_id,
            marker: parse_marker(field, raw_marker)?,
            channels: parse_channels(record.get("channels"))?,
            timestamp: parse_timestamp(record.get("timestamp"))?,
        })
    }
}

fn parse_marker(field: &str, value: &Value) -> IngestResult<Marker> {
    let marker = match value {
        Value::Number(number) => number.as_i64().and_then(Marker::from_flag),
        Value::String(name) => Marker::from_name(name),
        _ => None,
    };
    marker.ok_or_else(|| IngestError::invalid(field, format!("{value} is not open, mid or close")))
}

fn parse_channels(value: Option<&Value>) -> IngestResult<Vec<f64>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_f64()
                    .ok_or_else(|| IngestError::invalid("channels", format!("{item} is not a number")))
            })
            .collect(),
        // Some firmware sends the array JSON-encoded inside a string.
        Some(Value::String(encoded)) => serde_json::from_str::<Vec<f64>>(encoded)
            .map_err(|err| IngestError::invalid("channels", err.to_string())),
        Some(other) => Err(IngestError::invalid(
            "channels",
            format!("expected an array, got {other}"),
        )),
    }
}

fn parse_timestamp(value: Option<&Value>) -> IngestResult<DateTime<Utc>> {
    match value {
        None | Some(Value::Null) => Ok(Utc::now()),
        Some(Value::String(text)) => parse_device_timestamp(text)
            .map_err(|err| IngestError::invalid("timestamp", err.to_string())),
        Some(Value::Number(number)) => number
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| IngestError::invalid("timestamp", format!("{number} is out of range"))),
        Some(other) => Err(IngestError::invalid(
            "timestamp",
            format!("expected a string, got {other}"),
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpenSample {
    id: i64,
    start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementOutcome {
    pub datapoint_id: i64,
    pub sample_id: Option<i64>,
}

type DeviceSlot = Arc<Mutex<Option<OpenSample>>>;

/// Tracks the open sample of every device and drives each one through
/// collecting, processing and results.
///
/// Each device has its own slot, held for the whole of a record's handling
/// (post-processing included), so records from one device are applied in
/// order while other devices proceed independently.
pub struct SampleManager {
    db: Database,
    stage: StageController,
    processing: ProcessingConfig,
    devices: StdMutex<HashMap<i64, DeviceSlot>>,
}

impl SampleManager {
    pub fn new(db: Database, stage: StageController, processing: ProcessingConfig) -> Self {
        Self {
            db,
            stage,
            processing,
            devices: StdMutex::new(HashMap::new()),
        }
    }

    fn device_slot(&self, device_id: i64) -> DeviceSlot {
        let mut devices = self
            .devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        devices.entry(device_id).or_default().clone()
    }

    pub async fn open_sample_for(&self, device_id: i64) -> Option<i64> {
        let slot = self.device_slot(device_id);
        let open = slot.lock().await;
        open.map(|sample| sample.id)
    }

    pub async fn handle_measurement(&self, measurement: MeasurementRecord) -> Result<MeasurementOutcome> {
        let device_id = measurement.device_id;
        let slot = self.device_slot(device_id);
        let mut open = slot.lock().await;

        if measurement.marker == Marker::Open {
            if let Some(stale) = *open {
                warn!(
                    "Device {device_id} opened a new sample while sample {} was still open; closing it",
                    stale.id
                );
                self.db
                    .close_sample(stale.id, measurement.timestamp.max(stale.start_time))
                    .await?;
                *open = None;
            }

            let sample_id = self.db.create_sample(device_id, measurement.timestamp).await?;
            *open = Some(OpenSample {
                id: sample_id,
                start_time: measurement.timestamp,
            });
            info!("Sample {sample_id} opened for device {device_id}");
            self.announce(
                StageName::Collecting,
                json!({"sample_id": sample_id, "device_id": device_id}),
            )
            .await;
        }

        let datapoint = Datapoint {
            id: None,
            sample_id: open.map(|sample| sample.id),
            device_id,
            channels: measurement.channels,
            marker: measurement.marker,
            timestamp: measurement.timestamp,
        };
        let datapoint_id = self.db.insert_datapoint(&datapoint).await?;

        if measurement.marker == Marker::Close {
            match *open {
                Some(sample) => {
                    let end_time = if measurement.timestamp < sample.start_time {
                        warn!(
                            "Sample {} closed before it started ({} < {}); clamping",
                            sample.id, measurement.timestamp, sample.start_time
                        );
                        sample.start_time
                    } else {
                        measurement.timestamp
                    };
                    // The slot keeps the sample until the close is stored.
                    self.db.close_sample(sample.id, end_time).await?;
                    *open = None;
                    info!("Sample {} closed for device {device_id}", sample.id);
                    self.finish_sample(sample.id).await;
                }
                None => warn!("Device {device_id} sent close with no open sample; datapoint {datapoint_id} kept unassigned"),
            }
        }

        Ok(MeasurementOutcome {
            datapoint_id,
            sample_id: datapoint.sample_id,
        })
    }

    /// Processing then results. A failed analysis still ends on results,
    /// as inconclusive, so the station never stalls in processing.
    async fn finish_sample(&self, sample_id: i64) {
        self.announce(StageName::Processing, json!({"sample_id": sample_id}))
            .await;

        let result = match self.post_process(sample_id).await {
            Ok(analysis) => {
                info!(
                    "Sample {sample_id} classified {} from {} readings",
                    analysis.result.as_str(),
                    analysis.readings
                );
                analysis.result
            }
            Err(err) => {
                error!("Post-processing of sample {sample_id} failed: {err:#}");
                SampleResult::Inconclusive
            }
        };

        self.announce(
            StageName::Results,
            json!({"sample_id": sample_id, "result": result.as_str()}),
        )
        .await;
    }

    async fn post_process(&self, sample_id: i64) -> Result<SampleAnalysis> {
        let datapoints = self
            .db
            .get_datapoints_for_sample(sample_id)
            .await
            .with_context(|| format!("failed to load datapoints of sample {sample_id}"))?;

        let analysis = analyse_sample(&datapoints, &self.processing);
        self.db.set_sample_result(sample_id, analysis.result).await?;

        if self.processing.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.processing.delay_ms)).await;
        }
        Ok(analysis)
    }

    async fn announce(&self, stage: StageName, extra: Value) {
        let extra = match extra {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Err(err) = self.stage.set_stage(stage, extra).await {
            error!("Stage change to {stage} failed: {err:#}");
        }
    }

    /// Closes samples a previous run left open. Returns how many were closed.
    pub async fn recover_open_samples(&self) -> Result<usize> {
        let stale = self.db.list_open_samples().await?;
        let now = Utc::now();

        for sample in &stale {
            self.db
                .close_sample(sample.id, now.max(sample.start_time))
                .await?;
            warn!(
                "Closed sample {} of device {} left open since {}",
                sample.id, sample.device_id, sample.start_time
            );
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SampleStatus;
    use crate::hardware::{SimulatedDistanceSensor, SimulatedTagReader};
    use crate::sensing::{PresencePoller, PresenceThresholds, TagPoller};
    use crate::stage::{StageObserver, StageSnapshot, StageTimings};
    use chrono::TimeZone;

    struct Recording(StdMutex<Vec<StageName>>);

    impl StageObserver for Recording {
        fn notify(&self, snapshot: &StageSnapshot) -> Result<()> {
            self.0.lock().unwrap().push(snapshot.stage);
            Ok(())
        }
    }

    async fn manager() -> (SampleManager, Database, Arc<Recording>) {
        let db = Database::open_in_memory().unwrap();
        let presence = PresencePoller::new(
            Arc::new(SimulatedDistanceSensor::scripted(vec![None])),
            PresenceThresholds {
                in_use_cm: 60,
                near_cm: 120,
            },
            Duration::from_millis(100),
        );
        let tags = TagPoller::new(Arc::new(SimulatedTagReader::empty(Duration::from_millis(5))));
        let stage = StageController::new(
            db.clone(),
            presence,
            tags,
            StageTimings {
                presence_interval: Duration::from_secs(60),
                nearby_grace: Duration::from_secs(3),
                scan_timeout: Duration::from_secs(60),
                tag_poll_interval: Duration::from_secs(1),
            },
        );
        let recording = Arc::new(Recording(StdMutex::new(Vec::new())));
        stage.register_observer(recording.clone());

        let processing = ProcessingConfig {
            delay_ms: 0,
            ..ProcessingConfig::default()
        };
        (SampleManager::new(db.clone(), stage, processing), db, recording)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn reading(device_id: i64, marker: Marker, secs: i64) -> MeasurementRecord {
        MeasurementRecord {
            device_id,
            marker,
            channels: vec![1_000.0, 2_000.0],
            timestamp: at(secs),
        }
    }

    #[test]
    fn record_parsing_accepts_names_and_flags() {
        let record = json!({"flag": -1, "channels": "[1.5, 2]", "timestamp": "2024-03-01 10:00:00"});
        let parsed = MeasurementRecord::from_record(4, record.as_object().unwrap()).unwrap();
        assert_eq!(parsed.marker, Marker::Close);
        assert_eq!(parsed.channels, vec![1.5, 2.0]);

        let record = json!({"marker": "open", "channels": [7]});
        let parsed = MeasurementRecord::from_record(4, record.as_object().unwrap()).unwrap();
        assert_eq!(parsed.marker, Marker::Open);

        let bad = json!({"flag": "maybe", "channels": []});
        assert!(matches!(
            MeasurementRecord::from_record(4, bad.as_object().unwrap()),
            Err(IngestError::InvalidField { .. })
        ));

        let bad_time = json!({"flag": 0, "channels": [], "timestamp": "yesterday"});
        assert!(MeasurementRecord::from_record(4, bad_time.as_object().unwrap()).is_err());
    }

    #[tokio::test]
    async fn full_cycle_closes_one_sample() {
        let (manager, db, recording) = manager().await;
        let device = db.register_device("AA:BB:CC:DD:EE:FF", None).await.unwrap();

        let first = manager.handle_measurement(reading(device, Marker::Open, 0)).await.unwrap();
        let sample_id = first.sample_id.unwrap();
        for (marker, secs) in [(Marker::Mid, 1), (Marker::Mid, 2), (Marker::Close, 3)] {
            let outcome = manager.handle_measurement(reading(device, marker, secs)).await.unwrap();
            assert_eq!(outcome.sample_id, Some(sample_id));
        }

        let sample = db.get_sample(sample_id).await.unwrap().unwrap();
        assert_eq!(sample.end_time, Some(at(3)));
        assert!(sample.result.is_some());
        assert_eq!(db.get_datapoints_for_sample(sample_id).await.unwrap().len(), 4);
        assert_eq!(manager.open_sample_for(device).await, None);
        assert_eq!(
            *recording.0.lock().unwrap(),
            vec![StageName::Collecting, StageName::Processing, StageName::Results]
        );

        manager.stage.shutdown().await;
    }

    #[tokio::test]
    async fn devices_do_not_share_samples() {
        let (manager, db, _recording) = manager().await;
        let left = db.register_device("AA:AA:AA:AA:AA:01", None).await.unwrap();
        let right = db.register_device("AA:AA:AA:AA:AA:02", None).await.unwrap();

        let left_sample = manager.handle_measurement(reading(left, Marker::Open, 0)).await.unwrap().sample_id;
        let right_sample = manager.handle_measurement(reading(right, Marker::Open, 1)).await.unwrap().sample_id;
        assert_ne!(left_sample, right_sample);

        let left_mid = manager.handle_measurement(reading(left, Marker::Mid, 2)).await.unwrap();
        assert_eq!(left_mid.sample_id, left_sample);
        let right_mid = manager.handle_measurement(reading(right, Marker::Mid, 3)).await.unwrap();
        assert_eq!(right_mid.sample_id, right_sample);

        manager.stage.shutdown().await;
    }

    #[tokio::test]
    async fn close_without_open_keeps_the_datapoint() {
        let (manager, db, recording) = manager().await;
        let device = db.register_device("AA:BB:CC:00:00:01", None).await.unwrap();

        let outcome = manager.handle_measurement(reading(device, Marker::Close, 0)).await.unwrap();

        assert_eq!(outcome.sample_id, None);
        assert_eq!(db.count_orphan_datapoints(device).await.unwrap(), 1);
        assert!(recording.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reopen_closes_the_stale_sample() {
        let (manager, db, _recording) = manager().await;
        let device = db.register_device("AA:BB:CC:00:00:02", None).await.unwrap();

        let stale = manager.handle_measurement(reading(device, Marker::Open, 0)).await.unwrap().sample_id.unwrap();
        let fresh = manager.handle_measurement(reading(device, Marker::Open, 10)).await.unwrap().sample_id.unwrap();

        let stale = db.get_sample(stale).await.unwrap().unwrap();
        assert_eq!(stale.end_time, Some(at(10)));
        assert_eq!(manager.open_sample_for(device).await, Some(fresh));
    }

    #[tokio::test]
    async fn early_close_is_clamped_to_start() {
        let (manager, db, _recording) = manager().await;
        let device = db.register_device("AA:BB:CC:00:00:03", None).await.unwrap();

        let sample_id = manager.handle_measurement(reading(device, Marker::Open, 50)).await.unwrap().sample_id.unwrap();
        manager.handle_measurement(reading(device, Marker::Close, 40)).await.unwrap();

        let sample = db.get_sample(sample_id).await.unwrap().unwrap();
        assert_eq!(sample.end_time, Some(sample.start_time));
        manager.stage.shutdown().await;
    }

    #[tokio::test]
    async fn recovery_closes_leftovers() {
        let (manager, db, _recording) = manager().await;
        let device = db.register_device("AA:BB:CC:00:00:04", None).await.unwrap();
        db.create_sample(device, at(0)).await.unwrap();
        db.create_sample(device, at(5)).await.unwrap();

        assert_eq!(manager.recover_open_samples().await.unwrap(), 2);
        assert!(db.list_open_samples().await.unwrap().is_empty());
    }

    async fn run_sql(db: &Database, sql: &'static str) {
        db.execute(move |conn| {
            conn.execute_batch(sql)?;
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn failed_close_keeps_the_sample_open() {
        let (manager, db, recording) = manager().await;
        let device = db.register_device("AA:BB:CC:00:00:02", None).await.unwrap();
        let sample_id = manager
            .handle_measurement(reading(device, Marker::Open, 0))
            .await
            .unwrap()
            .sample_id
            .unwrap();

        run_sql(
            &db,
            "CREATE TRIGGER reject_close BEFORE UPDATE OF status ON samples
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .await;
        assert!(manager.handle_measurement(reading(device, Marker::Close, 1)).await.is_err());
        assert_eq!(manager.open_sample_for(device).await, Some(sample_id));

        let mid = manager.handle_measurement(reading(device, Marker::Mid, 2)).await.unwrap();
        assert_eq!(mid.sample_id, Some(sample_id));

        run_sql(&db, "DROP TRIGGER reject_close;").await;
        manager.handle_measurement(reading(device, Marker::Close, 3)).await.unwrap();
        let sample = db.get_sample(sample_id).await.unwrap().unwrap();
        assert_eq!(sample.status, SampleStatus::Closed);
        assert_eq!(manager.open_sample_for(device).await, None);
        assert_eq!(
            *recording.0.lock().unwrap(),
            vec![StageName::Collecting, StageName::Processing, StageName::Results]
        );

        manager.stage.shutdown().await;
    }

    #[tokio::test]
    async fn failed_analysis_still_reaches_results() {
        let (manager, db, recording) = manager().await;
        let device = db.register_device("AA:BB:CC:00:00:03", None).await.unwrap();
        run_sql(
            &db,
            "CREATE TRIGGER reject_result BEFORE UPDATE OF result ON samples
             BEGIN SELECT RAISE(ABORT, 'read-only'); END;",
        )
        .await;

        manager.handle_measurement(reading(device, Marker::Open, 0)).await.unwrap();
        let closed = manager.handle_measurement(reading(device, Marker::Close, 1)).await.unwrap();

        assert!(closed.sample_id.is_some());
        assert_eq!(
            *recording.0.lock().unwrap(),
            vec![StageName::Collecting, StageName::Processing, StageName::Results]
        );
        let results = manager.stage.current().await;
        assert_eq!(results.extra["result"], json!("inconclusive"));

        manager.stage.shutdown().await;
    }
}
