use crate::detectors::{RealarmPolicy, SensorCatalog, SensorDescriptor};
use crate::detectors::inactivity::DEFAULT_INACTIVITY_MULTIPLIER;
use crate::detectors::moving_average::DEFAULT_WINDOW_SIZE;
use crate::time_codec::TimeCodec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

pub const CONFIG_PATH_VAR: &str = "SENSORWATCH_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "kernel.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    InvalidOverride { var: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default)]
    pub mqtt: MqttConf,
    #[serde(default)]
    pub graphite: GraphiteConf,
    #[serde(default)]
    pub detection: DetectionConf,
    #[serde(default)]
    pub health: HealthConf,
    #[serde(default = "default_ingest_queue")]
    pub ingest_queue: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConf {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphiteConf {
    #[serde(default = "default_graphite_host")]
    pub host: String,
    #[serde(default = "default_graphite_port")]
    pub port: u16,
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Fixed UTC offset for wire timestamps; unset means host local time.
    #[serde(default)]
    pub utc_offset_secs: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConf {
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_multiplier")]
    pub inactivity_multiplier: u32,
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    #[serde(default)]
    pub realarm: RealarmPolicy,
    #[serde(default)]
    pub idle_eviction_secs: Option<u64>,
    /// Merged over the built-in humidity/temperature table.
    #[serde(default)]
    pub sensors: HashMap<String, SensorDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConf {
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_health_topic")]
    pub topic: String,
}

fn default_mqtt_host() -> String { "localhost".into() }
fn default_mqtt_port() -> u16 { 1883 }
fn default_client_id() -> String { "sensorwatch-kernel".into() }
fn default_topic() -> String { "/sensors/#".into() }
fn default_keep_alive() -> u64 { 20 }
fn default_graphite_host() -> String { "graphite".into() }
fn default_graphite_port() -> u16 { 2003 }
fn default_timeout_ms() -> u64 { 2000 }
fn default_window_size() -> usize { DEFAULT_WINDOW_SIZE }
fn default_multiplier() -> u32 { DEFAULT_INACTIVITY_MULTIPLIER }
fn default_scan_interval_ms() -> u64 { 1000 }
fn default_health_interval() -> u64 { 30 }
fn default_health_topic() -> String { "sensorwatch/kernel/health".into() }
fn default_ingest_queue() -> usize { 1024 }
fn default_log_level() -> String { "info".into() }

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            topic: default_topic(),
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl Default for GraphiteConf {
    fn default() -> Self {
        Self {
            host: default_graphite_host(),
            port: default_graphite_port(),
            connect_timeout_ms: default_timeout_ms(),
            write_timeout_ms: default_timeout_ms(),
            utc_offset_secs: None,
        }
    }
}

impl Default for DetectionConf {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            inactivity_multiplier: default_multiplier(),
            scan_interval_ms: default_scan_interval_ms(),
            realarm: RealarmPolicy::default(),
            idle_eviction_secs: None,
            sensors: HashMap::new(),
        }
    }
}

impl Default for HealthConf {
    fn default() -> Self {
        Self { interval_secs: default_health_interval(), topic: default_health_topic() }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConf::default(),
            graphite: GraphiteConf::default(),
            detection: DetectionConf::default(),
            health: HealthConf::default(),
            ingest_queue: default_ingest_queue(),
            log_level: default_log_level(),
        }
    }
}

impl GraphiteConf {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn time_codec(&self) -> TimeCodec {
        TimeCodec::from_offset_secs(self.utc_offset_secs).unwrap_or_default()
    }
}

impl DetectionConf {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn idle_eviction(&self) -> Option<Duration> {
        self.idle_eviction_secs.map(Duration::from_secs)
    }

    pub fn catalog(&self) -> SensorCatalog {
        SensorCatalog::with_overrides(&self.sensors)
    }
}

impl KernelConfig {
    pub fn from_yaml(path: &Path, txt: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(txt).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `SENSORWATCH_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(host) = var("SENSORWATCH_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = var("SENSORWATCH_MQTT_PORT") {
            self.mqtt.port = parse_port("SENSORWATCH_MQTT_PORT", port)?;
        }
        if let Some(host) = var("SENSORWATCH_GRAPHITE_HOST") {
            self.graphite.host = host;
        }
        if let Some(port) = var("SENSORWATCH_GRAPHITE_PORT") {
            self.graphite.port = parse_port("SENSORWATCH_GRAPHITE_PORT", port)?;
        }
        if let Some(level) = var("SENSORWATCH_LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::Invalid("mqtt.host must not be empty".into()));
        }
        if self.mqtt.topic.trim().is_empty() {
            return Err(ConfigError::Invalid("mqtt.topic must not be empty".into()));
        }
        if self.graphite.host.trim().is_empty() {
            return Err(ConfigError::Invalid("graphite.host must not be empty".into()));
        }
        if self.detection.window_size == 0 {
            return Err(ConfigError::Invalid("detection.window_size must be >= 1".into()));
        }
        if self.detection.inactivity_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "detection.inactivity_multiplier must be >= 1".into(),
            ));
        }
        if self.detection.scan_interval_ms == 0 {
            return Err(ConfigError::Invalid("detection.scan_interval_ms must be > 0".into()));
        }
        if self.ingest_queue == 0 {
            return Err(ConfigError::Invalid("ingest_queue must be > 0".into()));
        }
        if self.health.interval_secs == 0 {
            return Err(ConfigError::Invalid("health.interval_secs must be > 0".into()));
        }
        if let Some(offset) = self.graphite.utc_offset_secs {
            if TimeCodec::from_offset_secs(Some(offset)).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "graphite.utc_offset_secs {offset} is out of range"
                )));
            }
        }
        for (sensor, descriptor) in &self.detection.sensors {
            if !descriptor.threshold.is_finite() {
                return Err(ConfigError::Invalid(format!(
                    "detection.sensors.{sensor}.threshold must be finite"
                )));
            }
        }
        Ok(())
    }
}

fn parse_port(var: &'static str, value: String) -> Result<u16, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidOverride { var, value })
}

pub async fn load_from_path(path: &Path) -> Result<KernelConfig, ConfigError> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(KernelConfig::default());
    }
    let txt = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
    let config = KernelConfig::from_yaml(path, &txt)?;
    info!(path = %path.display(), "config loaded");
    Ok(config)
}

/// Loads the kernel config from `SENSORWATCH_CONFIG` (default `kernel.yaml`),
/// applies environment overrides and validates the result.
pub async fn load_config() -> Result<KernelConfig, ConfigError> {
    let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut config = load_from_path(Path::new(&path)).await?;
    config.apply_overrides(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}
