use crate::engine::{EngineStats, IngestionEngine};
use crate::forwarder::{CarbonForwarder, ForwarderStats};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MqttStatus {
    #[default]
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for MqttStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MqttStatus::Connecting => "connecting",
            MqttStatus::Connected => "connected",
            MqttStatus::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub mqtt_status: MqttStatus,
    pub mqtt_reconnects: u32,
    pub engine: EngineStats,
    pub inactivity_keys: usize,
    pub moving_average_keys: usize,
    pub forwarder: ForwarderStats,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<MqttStatus>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new(MqttStatus::Connecting)),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = MqttStatus::Connected;
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = MqttStatus::Disconnected;
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_status(&self) -> MqttStatus {
        *self.mqtt_status.lock()
    }

    pub fn mqtt_reconnects(&self) -> u32 {
        self.mqtt_reconnects.load(Ordering::Relaxed)
    }

    pub fn get_health(&self, engine: &IngestionEngine<CarbonForwarder>) -> KernelHealth {
        let (inactivity_keys, moving_average_keys) = engine.detectors().tracked_keys();
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            mqtt_status: self.mqtt_status(),
            mqtt_reconnects: self.mqtt_reconnects(),
            engine: engine.stats(),
            inactivity_keys,
            moving_average_keys,
            forwarder: engine.sink().stats(),
        }
    }
}

/// Logs and publishes a [`KernelHealth`] snapshot every `every` until shutdown.
pub fn spawn_health_reporter(
    tracker: HealthTracker,
    engine: Arc<IngestionEngine<CarbonForwarder>>,
    client: AsyncClient,
    topic: String,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    task::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // the first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let health = tracker.get_health(&engine);
                    info!(
                        uptime_secs = health.uptime_seconds,
                        mqtt = %health.mqtt_status,
                        ingested = health.engine.ingested,
                        dropped = health.engine.dropped,
                        alarms = health.engine.alarms,
                        forward_failures = health.engine.forward_failures,
                        keys = health.inactivity_keys,
                        "kernel health"
                    );
                    match serde_json::to_vec(&health) {
                        Ok(payload) => {
                            if let Err(e) = client.try_publish(topic.as_str(), QoS::AtMostOnce, false, payload) {
                                warn!(error = %e, "failed to publish kernel health");
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to encode kernel health"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
