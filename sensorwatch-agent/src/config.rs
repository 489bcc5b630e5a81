//! Agent configuration: TOML file in the OS config dir, then CLI overrides.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_broker_host")]
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    /// Defaults to `sensor-monitor-<machine_id>`.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Overrides the host name as machine id.
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default = "default_announce_interval")]
    pub announce_interval_secs: u64,
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_sensors")]
    pub sensors: Vec<String>,
}

fn default_log_level() -> String { "info".into() }
fn default_broker_host() -> String { "localhost".into() }
fn default_broker_port() -> u16 { 1883 }
fn default_keep_alive() -> u64 { 20 }
fn default_announce_interval() -> u64 { 30 }
fn default_sample_interval() -> u64 { 1000 }
fn default_sensors() -> Vec<String> { vec!["cpu".into(), "ram".into()] }

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: default_broker_host(),
            broker_port: default_broker_port(),
            client_id: None,
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            machine_id: None,
            announce_interval_secs: default_announce_interval(),
            sample_interval_ms: default_sample_interval(),
            sensors: default_sensors(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            monitor: MonitorConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl MonitorConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

impl AgentConfig {
    /// Loads `path`, or the OS-specific default location. A missing file yields defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_file_path()?,
        };

        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("reading {}", config_path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", config_path.display()))
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().ok_or_else(|| anyhow!("could not find config directory"))?;
        path.push("sensorwatch-agent");
        path.push("config.toml");
        Ok(path)
    }

    /// Accepts `host` or `host:port`. On error the config is left as it was.
    pub fn set_broker(&mut self, broker: &str) -> Result<()> {
        let (host, port) = match broker.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .with_context(|| format!("invalid broker port in {broker:?}"))?;
                (host, Some(port))
            }
            None => (broker, None),
        };
        if host.is_empty() {
            return Err(anyhow!("broker host must not be empty"));
        }

        self.mqtt.broker_host = host.to_string();
        if let Some(port) = port {
            self.mqtt.broker_port = port;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitor.announce_interval_secs == 0 {
            return Err(anyhow!("monitor.announce_interval_secs must be > 0"));
        }
        if self.monitor.sample_interval_ms == 0 {
            return Err(anyhow!("monitor.sample_interval_ms must be > 0"));
        }
        if self.monitor.sensors.is_empty() {
            return Err(anyhow!("monitor.sensors must list at least one sensor"));
        }
        Ok(())
    }
}
