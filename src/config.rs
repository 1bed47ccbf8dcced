use anyhow::{bail, Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const CONFIG_ENV: &str = "UROGUARDIAN_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/uroguardian.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostSystem {
    Linux,
    Windows,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceBackend {
    Simulated,
    Ld2410,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TagBackend {
    Simulated,
    Pn532,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub keepalive_secs: u64,
    pub qos: u8,
    pub client_id: Option<String>,
    /// Topic name → fields a payload must carry to be accepted.
    pub topics: BTreeMap<String, Vec<String>>,
    pub measurement_topic: String,
    pub device_field: String,
    pub reconnect_delay_ms: u64,
    /// Retained topic display clients follow for stage changes; `None` keeps
    /// stage updates local.
    pub stage_topic: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        let mut topics = BTreeMap::new();
        topics.insert(
            "spectrum_datapoints".to_string(),
            vec!["mac_address".into(), "flag".into()],
        );
        topics.insert(
            "logs".to_string(),
            vec![
                "mac_address".into(),
                "timestamp".into(),
                "level".into(),
                "message".into(),
            ],
        );
        topics.insert(
            "telemetry".to_string(),
            vec![
                "mac_address".into(),
                "timestamp".into(),
                "metric".into(),
                "value".into(),
            ],
        );

        Self {
            host: "localhost".into(),
            port: 1883,
            keepalive_secs: 60,
            qos: 1,
            client_id: None,
            topics,
            measurement_topic: "spectrum_datapoints".into(),
            device_field: "mac_address".into(),
            reconnect_delay_ms: 2000,
            stage_topic: Some("uroguardian/stage".into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub process_names: Vec<String>,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub system: HostSystem,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            command: "mosquitto".into(),
            args: vec!["-v".into()],
            process_names: vec!["mosquitto".into(), "mosquitto.exe".into()],
            max_retries: 3,
            retry_delay_ms: 2000,
            system: if cfg!(windows) {
                HostSystem::Windows
            } else {
                HostSystem::Linux
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub backend: PresenceBackend,
    pub device_path: String,
    pub baud_rate: u32,
    pub in_use_threshold_cm: u16,
    pub near_threshold_cm: u16,
    pub interval_ms: u64,
    pub read_timeout_ms: u64,
    pub nearby_grace_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            backend: PresenceBackend::Simulated,
            device_path: "/dev/ttyS0".into(),
            baud_rate: 256_000,
            in_use_threshold_cm: 60,
            near_threshold_cm: 120,
            interval_ms: 1000,
            read_timeout_ms: 1200,
            nearby_grace_ms: 3000,
        }
    }
}

impl PresenceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn nearby_grace(&self) -> Duration {
        Duration::from_millis(self.nearby_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TagReaderConfig {
    pub backend: TagBackend,
    pub device_path: String,
    pub baud_rate: u32,
    pub scan_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// UID the simulated reader reports; `None` means no tag is ever presented.
    pub simulated_uid: Option<String>,
    pub simulated_latency_ms: u64,
}

impl Default for TagReaderConfig {
    fn default() -> Self {
        Self {
            backend: TagBackend::Simulated,
            device_path: "/dev/ttyAMA0".into(),
            baud_rate: 115_200,
            scan_timeout_ms: 20_000,
            poll_interval_ms: 1000,
            simulated_uid: Some("0123456789ABCDEF".into()),
            simulated_latency_ms: 5000,
        }
    }
}

impl TagReaderConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub delay_ms: u64,
    /// Full-scale value of a spectral channel reading.
    pub channel_full_scale: f64,
    /// Mean normalised intensity at or below which a sample counts as hydrated.
    pub hydrated_max: f64,
    /// Mean normalised intensity at or below which dehydration is mild.
    pub mild_max: f64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            delay_ms: 2000,
            channel_full_scale: 65_535.0,
            hydrated_max: 0.35,
            mild_max: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub mqtt: MqttConfig,
    pub broker: BrokerConfig,
    pub presence: PresenceConfig,
    pub tag_reader: TagReaderConfig,
    pub processing: ProcessingConfig,
    pub monitoring: MonitoringConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/uroguardian.sqlite3"),
            mqtt: MqttConfig::default(),
            broker: BrokerConfig::default(),
            presence: PresenceConfig::default(),
            tag_reader: TagReaderConfig::default(),
            processing: ProcessingConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl AppConfig {
    /// Path from `UROGUARDIAN_CONFIG`, falling back to `config/uroguardian.json`.
    pub fn default_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Missing file means defaults. A file that fails to parse is reported and
    /// replaced by defaults so the station still comes up.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            match serde_json::from_str::<AppConfig>(&contents) {
                Ok(config) => {
                    info!("Loaded configuration from {}", path.display());
                    config
                }
                Err(err) => {
                    warn!(
                        "Ignoring malformed config {} ({err}); using defaults",
                        path.display()
                    );
                    AppConfig::default()
                }
            }
        } else {
            info!("No config at {}; using defaults", path.display());
            AppConfig::default()
        };

        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.presence.in_use_threshold_cm >= self.presence.near_threshold_cm {
            bail!(
                "presence.in_use_threshold_cm ({}) must be below presence.near_threshold_cm ({})",
                self.presence.in_use_threshold_cm,
                self.presence.near_threshold_cm
            );
        }
        if !self.mqtt.topics.contains_key(&self.mqtt.measurement_topic) {
            bail!(
                "measurement topic '{}' is not listed in mqtt.topics",
                self.mqtt.measurement_topic
            );
        }
        if self.presence.interval_ms == 0 || self.tag_reader.poll_interval_ms == 0 {
            bail!("poll intervals must be greater than zero");
        }
        if self.monitoring.enabled && self.monitoring.interval_secs == 0 {
            bail!("monitoring.interval_secs must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.presence.in_use_threshold_cm, 60);
        assert_eq!(config.presence.near_threshold_cm, 120);
        assert_eq!(config.mqtt.measurement_topic, "spectrum_datapoints");
    }

    #[test]
    fn partial_file_keeps_defaults_for_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uroguardian.json");
        fs::write(
            &path,
            r#"{ "mqtt": { "port": 1884 }, "presence": { "backend": "ld2410" } }"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.mqtt.port, 1884);
        assert_eq!(config.mqtt.host, "localhost");
        assert_eq!(config.presence.backend, PresenceBackend::Ld2410);
        assert_eq!(config.tag_reader.backend, TagBackend::Simulated);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uroguardian.json");
        fs::write(&path, "{ not json").unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.broker.max_retries, 3);
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let mut config = AppConfig::default();
        config.presence.in_use_threshold_cm = 150;
        assert!(config.validate().is_err());
    }

    #[test]
    fn measurement_topic_must_be_subscribed() {
        let mut config = AppConfig::default();
        config.mqtt.measurement_topic = "spectrum/v2".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_then_load_preserves_topics() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("uroguardian.json");
        let mut config = AppConfig::default();
        config
            .mqtt
            .topics
            .insert("events".into(), vec!["mac_address".into()]);
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.mqtt.topics.get("events").unwrap(), &vec!["mac_address"]);
    }
}
