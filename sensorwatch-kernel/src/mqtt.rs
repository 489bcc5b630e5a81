use crate::config::MqttConf;
use crate::engine::InboundMessage;
use crate::health::HealthTracker;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::fmt::Display;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const MIN_KEEP_ALIVE_SECS: u64 = 5;

pub fn create_client(conf: &MqttConf, capacity: usize) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(conf.client_id.as_str(), conf.host.as_str(), conf.port);
    opts.set_keep_alive(Duration::from_secs(conf.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS)));
    opts.set_clean_session(true);
    AsyncClient::new(opts, capacity)
}

/// Subscription owed to the broker since the last ConnAck.
///
/// The request channel is drained by the listener loop itself, so a subscribe
/// is queued with `try_subscribe` and retried after later events when the
/// channel was full.
#[derive(Debug)]
struct Subscription {
    topic: String,
    pending: bool,
}

impl Subscription {
    fn new(topic: String) -> Self {
        Self { topic, pending: false }
    }

    fn on_connected(&mut self) {
        self.pending = true;
    }

    fn on_disconnected(&mut self) {
        self.pending = false;
    }

    /// Queues the subscribe if one is owed. Returns true once it was queued.
    fn ensure<E, F>(&mut self, subscribe: F) -> bool
    where
        E: Display,
        F: FnOnce(&str) -> Result<(), E>,
    {
        if !self.pending {
            return false;
        }
        match subscribe(&self.topic) {
            Ok(()) => {
                self.pending = false;
                debug!(topic = %self.topic, "mqtt subscribe queued");
                true
            }
            Err(e) => {
                warn!(error = %e, topic = %self.topic, "mqtt subscribe failed, retrying on next event");
                false
            }
        }
    }
}

/// Drives the MQTT event loop: subscribes after every ConnAck and hands
/// publishes to the ingest worker through `tx`.
pub fn spawn_mqtt_listener(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topic: String,
    tx: mpsc::Sender<InboundMessage>,
    health: HealthTracker,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    task::spawn(async move {
        let mut subscription = Subscription::new(topic);
        loop {
            let event = tokio::select! {
                event = eventloop.poll() => event,
                _ = shutdown.changed() => break,
            };

            match event {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    health.mark_mqtt_connected();
                    info!(code = ?ack.code, topic = %subscription.topic, "mqtt connected, subscribing");
                    subscription.on_connected();
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    let msg = InboundMessage {
                        topic: p.topic,
                        payload: p.payload.to_vec(),
                        received_at: Instant::now(),
                    };
                    if tx.send(msg).await.is_err() {
                        debug!("ingest queue closed, stopping mqtt listener");
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    subscription.on_disconnected();
                    health.mark_mqtt_disconnected();
                    health.increment_reconnects();
                    warn!(error = %e, retry_in_secs = RECONNECT_DELAY.as_secs(), "mqtt connection error");
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }

            subscription.ensure(|topic| client.try_subscribe(topic, QoS::AtLeastOnce));
        }

        if let Err(e) = client.try_disconnect() {
            debug!(error = %e, "mqtt disconnect request failed");
        }
        info!("mqtt listener stopped");
    })
}
