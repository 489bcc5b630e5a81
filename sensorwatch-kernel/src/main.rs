/**
 * SENSORWATCH KERNEL - process entry point
 *
 * ROLE: wires config, MQTT transport, ingest worker, inactivity ticker,
 * Graphite forwarder and health reporting, then waits for Ctrl-C.
 *
 * FLOW: MQTT publish -> bounded queue -> ingest worker -> engine -> carbon.
 */
use anyhow::{Context, Result};
use sensorwatch_kernel::config::{load_config, KernelConfig};
use sensorwatch_kernel::detectors::{InactivityDetector, MovingAverageDetector};
use sensorwatch_kernel::engine::{spawn_ingest_worker, spawn_ticker, IngestionEngine};
use sensorwatch_kernel::forwarder::CarbonForwarder;
use sensorwatch_kernel::health::{spawn_health_reporter, HealthTracker};
use sensorwatch_kernel::mqtt::{create_client, spawn_mqtt_listener};
use sensorwatch_kernel::state::DetectorState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MQTT_REQUEST_CAPACITY: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    let config = load_config().await.context("loading kernel config")?;
    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mqtt = %format!("{}:{}", config.mqtt.host, config.mqtt.port),
        graphite = %format!("{}:{}", config.graphite.host, config.graphite.port),
        "starting sensorwatch kernel"
    );

    run(config).await
}

fn init_logging(config: &KernelConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(config: KernelConfig) -> Result<()> {
    let codec = config.graphite.time_codec();
    let forwarder = CarbonForwarder::new(&config.graphite.host, config.graphite.port, codec)
        .with_timeouts(config.graphite.connect_timeout(), config.graphite.write_timeout());

    let detection = &config.detection;
    let detectors = DetectorState::new(
        InactivityDetector::new(detection.inactivity_multiplier, detection.realarm),
        MovingAverageDetector::new(detection.window_size, detection.catalog()),
    );
    let engine = Arc::new(
        IngestionEngine::new(forwarder, detectors, codec).with_idle_eviction(detection.idle_eviction()),
    );

    let health = HealthTracker::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (tx, rx) = mpsc::channel(config.ingest_queue);

    let (client, eventloop) = create_client(&config.mqtt, MQTT_REQUEST_CAPACITY);
    let listener = spawn_mqtt_listener(
        eventloop,
        client.clone(),
        config.mqtt.topic.clone(),
        tx,
        health.clone(),
        shutdown_rx.clone(),
    );
    let worker = spawn_ingest_worker(engine.clone(), rx, shutdown_rx.clone());
    let ticker = spawn_ticker(engine.clone(), detection.scan_interval(), shutdown_rx.clone());
    let reporter = spawn_health_reporter(
        health,
        engine.clone(),
        client,
        config.health.topic.clone(),
        Duration::from_secs(config.health.interval_secs),
        shutdown_rx,
    );

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");
    shutdown_tx.send(true).ok();

    for (name, handle) in [
        ("mqtt listener", listener),
        ("ingest worker", worker),
        ("ticker", ticker),
        ("health reporter", reporter),
    ] {
        match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task = name, error = %e, "task ended abnormally"),
            Err(_) => warn!(task = name, "task did not stop in time"),
        }
    }

    engine.sink().close().await;
    let stats = engine.stats();
    info!(
        ingested = stats.ingested,
        dropped = stats.dropped,
        alarms = stats.alarms,
        forward_failures = stats.forward_failures,
        "sensorwatch kernel stopped"
    );
    Ok(())
}
