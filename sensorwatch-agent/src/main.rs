//! SensorWatch Agent - host sensor monitor
//!
//! Samples local sensors and feeds the SensorWatch kernel over MQTT:
//! - one reading per sensor every sample interval on `/sensors/<machine>/<sensor>`
//! - a self-description on `/sensor_monitors` every announce interval

mod config;
mod messages;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use config::AgentConfig;
use messages::{local_timestamp, reading_topic, Announcement, SensorReading, ANNOUNCE_TOPIC};
use metrics::{parse_sensors, SensorKind, SensorProbe};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const MQTT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "sensorwatch-agent", about = "Publishes host sensor readings to the SensorWatch kernel")]
struct Cli {
    /// Path to the TOML config (default: OS config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds between announcements on /sensor_monitors
    #[arg(long)]
    announce_interval: Option<u64>,

    /// Milliseconds between two samples of a sensor
    #[arg(long)]
    sample_interval_ms: Option<u64>,

    /// Broker as host or host:port
    #[arg(long)]
    broker: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut AgentConfig) -> Result<()> {
        if let Some(secs) = self.announce_interval {
            config.monitor.announce_interval_secs = secs;
        }
        if let Some(ms) = self.sample_interval_ms {
            config.monitor.sample_interval_ms = ms;
        }
        if let Some(broker) = &self.broker {
            config.set_broker(broker)?;
        }
        Ok(())
    }
}

/// Main agent state
struct Agent {
    config: AgentConfig,
    machine_id: String,
    sensors: Vec<SensorKind>,
    mqtt_client: AsyncClient,
}

impl Agent {
    fn new(config: AgentConfig) -> Result<(Self, EventLoop)> {
        let machine_id = config
            .monitor
            .machine_id
            .clone()
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned());
        let sensors = parse_sensors(&config.monitor.sensors).context("invalid sensor list")?;

        let client_id = config
            .mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("sensor-monitor-{machine_id}"));
        let mut mqtt_options =
            MqttOptions::new(client_id, config.mqtt.broker_host.as_str(), config.mqtt.broker_port);
        mqtt_options.set_keep_alive(Duration::from_secs(config.mqtt.keep_alive_secs.max(5)));
        mqtt_options.set_clean_session(true);

        let (mqtt_client, eventloop) = AsyncClient::new(mqtt_options, 32);

        info!(machine_id = %machine_id, sensors = ?sensors, "agent initialized");
        Ok((Agent { config, machine_id, sensors, mqtt_client }, eventloop))
    }

    fn announcement(&self) -> Announcement {
        Announcement::new(&self.machine_id, &self.sensors, self.config.monitor.sample_interval())
    }

    async fn announce(&self) -> Result<()> {
        let payload = serde_json::to_vec(&self.announcement()).context("serializing announcement")?;
        self.mqtt_client
            .publish(ANNOUNCE_TOPIC, QoS::AtLeastOnce, false, payload)
            .await
            .context("publishing announcement")?;
        debug!("announcement sent");
        Ok(())
    }

    /// Runs until Ctrl-C.
    async fn run(self, eventloop: EventLoop) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = spawn_event_loop(eventloop, shutdown_rx.clone());

        let samplers: Vec<JoinHandle<()>> = self
            .sensors
            .iter()
            .map(|&kind| {
                spawn_sampler(
                    self.mqtt_client.clone(),
                    self.machine_id.clone(),
                    kind,
                    self.config.monitor.sample_interval(),
                    shutdown_rx.clone(),
                )
            })
            .collect();

        let mut announce_timer = interval(self.config.monitor.announce_interval());
        announce_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = announce_timer.tick() => {
                    if let Err(e) = self.announce().await {
                        error!(error = %e, "failed to announce sensors");
                    }
                }
                res = &mut ctrl_c => {
                    res.context("waiting for ctrl-c")?;
                    info!("shutdown requested");
                    break;
                }
            }
        }

        shutdown_tx.send(true).ok();
        join_samplers(samplers).await;
        if let Err(e) = self.mqtt_client.disconnect().await {
            debug!(error = %e, "mqtt disconnect failed");
        }
        match tokio::time::timeout(Duration::from_secs(2), poller).await {
            Ok(Err(e)) => warn!(error = %e, "mqtt event loop task failed"),
            Err(_) => warn!("mqtt event loop did not stop in time"),
            Ok(Ok(())) => {}
        }
        Ok(())
    }
}

/// Waits for every sampler and logs the ones that panicked. Returns how many did.
async fn join_samplers(samplers: Vec<JoinHandle<()>>) -> usize {
    let mut failed = 0;
    for handle in samplers {
        if let Err(e) = handle.await {
            warn!(error = %e, "sampler task failed");
            failed += 1;
        }
    }
    failed
}

fn spawn_event_loop(mut eventloop: EventLoop, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = eventloop.poll() => event,
                _ = shutdown.changed() => break,
            };
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => info!("connected to the broker"),
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "MQTT connection error");
                    tokio::time::sleep(MQTT_RETRY_DELAY).await;
                }
            }
        }
    })
}

fn spawn_sampler(
    client: AsyncClient,
    machine_id: String,
    kind: SensorKind,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let topic = reading_topic(&machine_id, kind);
        let mut probe = SensorProbe::new(kind);
        let mut timer = interval(every);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = shutdown.changed() => break,
            }
            let reading = SensorReading { timestamp: local_timestamp(), value: probe.sample() };
            let payload = match serde_json::to_vec(&reading) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(sensor = %kind, error = %e, "failed to encode reading");
                    continue;
                }
            };
            if let Err(e) = client.publish(topic.as_str(), QoS::AtLeastOnce, false, payload).await {
                warn!(sensor = %kind, error = %e, "failed to publish reading");
            }
        }
        debug!(sensor = %kind, "sampler stopped");
    })
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AgentConfig::load(cli.config.as_deref())
        .await
        .context("loading agent config")?;
    cli.apply(&mut config)?;
    config.validate()?;

    init_logging(&config.log_level);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        broker = %format!("{}:{}", config.mqtt.broker_host, config.mqtt.broker_port),
        "sensorwatch agent starting"
    );

    let (agent, eventloop) = Agent::new(config).context("failed to create agent")?;
    agent.run(eventloop).await.context("agent execution failed")
}
