//! Capability interfaces for the two sensors the pollers drive, plus the
//! implementations behind them. The implementation is picked once, when the
//! station is built, from the configured backend.

pub mod ld2410;
pub mod pn532;
pub mod simulated;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::config::{PresenceBackend, PresenceConfig, TagBackend, TagReaderConfig};

pub use ld2410::Ld2410Radar;
pub use pn532::Pn532Reader;
pub use simulated::{SimulatedDistanceSensor, SimulatedTagReader};

/// Distances reported by a presence radar in one frame, in centimetres.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistanceReport {
    pub moving_cm: Option<u16>,
    pub static_cm: Option<u16>,
    pub detection_cm: Option<u16>,
}

impl DistanceReport {
    pub fn new(moving_cm: Option<u16>, static_cm: Option<u16>, detection_cm: Option<u16>) -> Self {
        Self {
            moving_cm,
            static_cm,
            detection_cm,
        }
    }

    /// Every usable distance in the report. Zero means "no reading".
    pub fn distances(&self) -> Vec<u16> {
        [self.static_cm, self.moving_cm, self.detection_cm]
            .into_iter()
            .flatten()
            .filter(|distance| *distance > 0)
            .collect()
    }
}

/// A proximity sensor. `read_report` blocks until one report is available or
/// the driver gives up; callers bound it with their own deadline as well.
pub trait DistanceSensor: Send + Sync {
    fn read_report(&self) -> Result<DistanceReport>;
}

/// A short-range tag reader. One call is one activation attempt; `Ok(None)`
/// means no tag was in the field.
pub trait TagReader: Send + Sync {
    fn read_passive_target(&self) -> Result<Option<Vec<u8>>>;
}

pub fn build_distance_sensor(config: &PresenceConfig) -> Result<Arc<dyn DistanceSensor>> {
    match config.backend {
        PresenceBackend::Simulated => {
            info!("Presence sensor: simulated random walk");
            Ok(Arc::new(SimulatedDistanceSensor::random_walk(
                Duration::from_millis(50),
            )))
        }
        PresenceBackend::Ld2410 => {
            let radar = Ld2410Radar::open(&config.device_path, config.baud_rate, config.read_timeout())
                .with_context(|| format!("failed to open LD2410 on {}", config.device_path))?;
            info!("Presence sensor: LD2410 on {}", config.device_path);
            Ok(Arc::new(radar))
        }
    }
}

pub fn build_tag_reader(config: &TagReaderConfig) -> Result<Arc<dyn TagReader>> {
    match config.backend {
        TagBackend::Simulated => {
            info!(
                "Tag reader: simulated (uid={:?}, latency={}ms)",
                config.simulated_uid, config.simulated_latency_ms
            );
            let latency = Duration::from_millis(config.simulated_latency_ms);
            let reader = match config.simulated_uid.as_deref() {
                Some(uid) => SimulatedTagReader::with_hex_uid(uid, latency)?,
                None => SimulatedTagReader::empty(latency),
            };
            Ok(Arc::new(reader))
        }
        TagBackend::Pn532 => {
            let reader = Pn532Reader::open(&config.device_path, config.baud_rate)
                .with_context(|| format!("failed to open PN532 on {}", config.device_path))?;
            info!("Tag reader: PN532 on {}", config.device_path);
            Ok(Arc::new(reader))
        }
    }
}

/// Upper-case hex without separators, the form tag UIDs are stored in.
pub fn uid_to_hex(uid: &[u8]) -> String {
    uid.iter().map(|byte| format!("{byte:02X}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distances_are_not_readings() {
        let report = DistanceReport::new(Some(0), Some(85), None);
        assert_eq!(report.distances(), vec![85]);
        assert!(DistanceReport::default().distances().is_empty());
    }

    #[test]
    fn uid_hex_is_upper_case() {
        assert_eq!(uid_to_hex(&[0x04, 0xa1, 0xb2, 0x0c]), "04A1B20C");
    }
}
