//! Ingestion engine: routes decoded readings through forwarding and detection.

use crate::decoder::decode;
use crate::forwarder::MetricSink;
use crate::models::AnomalyEvent;
use crate::state::DetectorState;
use crate::time_codec::TimeCodec;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// One publish handed from the transport to the ingest worker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: Instant,
}

#[derive(Debug, Default)]
struct EngineCounters {
    ingested: AtomicU64,
    dropped: AtomicU64,
    forward_failures: AtomicU64,
    alarms: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub ingested: u64,
    pub dropped: u64,
    pub forward_failures: u64,
    pub alarms: u64,
}

pub struct IngestionEngine<S> {
    sink: S,
    codec: TimeCodec,
    detectors: DetectorState,
    last_tick: Mutex<Instant>,
    idle_eviction: Option<Duration>,
    counters: EngineCounters,
}

impl<S: MetricSink> IngestionEngine<S> {
    pub fn new(sink: S, detectors: DetectorState, codec: TimeCodec) -> Self {
        Self {
            sink,
            codec,
            detectors,
            last_tick: Mutex::new(Instant::now()),
            idle_eviction: None,
            counters: EngineCounters::default(),
        }
    }

    /// Instant the first tick measures its elapsed time from.
    pub fn starting_at(self, started: Instant) -> Self {
        *self.last_tick.lock() = started;
        self
    }

    pub fn with_idle_eviction(mut self, idle: Option<Duration>) -> Self {
        self.idle_eviction = idle;
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn detectors(&self) -> &DetectorState {
        &self.detectors
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            ingested: self.counters.ingested.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            forward_failures: self.counters.forward_failures.load(Ordering::Relaxed),
            alarms: self.counters.alarms.load(Ordering::Relaxed),
        }
    }

    /// Handles one inbound publish. Malformed messages are logged and dropped.
    pub async fn on_message(&self, topic: &str, payload: &[u8], now: Instant) {
        let reading = match decode(topic, payload) {
            Ok(reading) => reading,
            Err(err) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(topic, error = %err, "dropping undecodable message");
                return;
            }
        };
        self.counters.ingested.fetch_add(1, Ordering::Relaxed);
        debug!(
            machine_id = %reading.machine_id,
            sensor_id = %reading.sensor_id,
            timestamp = %reading.timestamp,
            value = reading.value,
            "reading received"
        );

        if let Err(err) = self
            .sink
            .forward(&reading.machine_id, &reading.sensor_id, &reading.timestamp, reading.value)
            .await
        {
            self.counters.forward_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                machine_id = %reading.machine_id,
                sensor_id = %reading.sensor_id,
                error = %err,
                "failed to forward reading"
            );
        }

        let key = reading.key();
        self.detectors.inactivity.lock().touch(key.clone(), now);
        let alarm = self
            .detectors
            .moving_average
            .lock()
            .evaluate(&key, reading.value, &reading.timestamp);

        if let Some(event) = alarm {
            self.emit(event).await;
        }
    }

    /// Periodic tick: measures the time since the previous tick and scans for silent keys.
    pub async fn on_tick(&self, now: Instant) -> usize {
        let elapsed = {
            let mut last = self.last_tick.lock();
            let elapsed = now.saturating_duration_since(*last);
            *last = now;
            elapsed
        };

        let emitted = self.scan_inactivity(now, elapsed).await;

        if let Some(idle) = self.idle_eviction {
            self.evict_idle(now, idle);
        }
        emitted
    }

    /// Forwards an inactivity alarm for every key silent beyond the adaptive threshold.
    pub async fn scan_inactivity(&self, now: Instant, elapsed_since_last_scan: Duration) -> usize {
        let timestamp = self.codec.now();
        let events: Vec<AnomalyEvent> = self
            .detectors
            .inactivity
            .lock()
            .scan(now, elapsed_since_last_scan, &timestamp)
            .collect();

        let count = events.len();
        for event in events {
            self.emit(event).await;
        }
        count
    }

    fn evict_idle(&self, now: Instant, idle: Duration) {
        let evicted = self.detectors.evict_idle(now, idle);
        if evicted.is_empty() {
            return;
        }
        info!(count = evicted.len(), idle_secs = idle.as_secs(), "evicted idle sensor keys");
    }

    async fn emit(&self, event: AnomalyEvent) {
        match self
            .sink
            .forward(&event.machine_id, &event.metric_name, &event.timestamp, event.value)
            .await
        {
            Ok(()) => {
                self.counters.alarms.fetch_add(1, Ordering::Relaxed);
                info!(
                    machine_id = %event.machine_id,
                    metric = %event.metric_name,
                    kind = %event.kind,
                    "anomaly forwarded"
                );
            }
            Err(err) => {
                self.counters.forward_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    machine_id = %event.machine_id,
                    metric = %event.metric_name,
                    error = %err,
                    "failed to forward anomaly"
                );
            }
        }
    }
}

/// Drains `rx` into [`IngestionEngine::on_message`] until shutdown or channel close.
pub fn spawn_ingest_worker<S>(
    engine: Arc<IngestionEngine<S>>,
    mut rx: mpsc::Receiver<InboundMessage>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    S: MetricSink + 'static,
{
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                msg = rx.recv() => msg,
                _ = shutdown.changed() => break,
            };
            let Some(msg) = msg else { break };
            engine.on_message(&msg.topic, &msg.payload, msg.received_at).await;
        }
        debug!("ingest worker stopped");
    })
}

/// Calls [`IngestionEngine::on_tick`] every `period`; late ticks are delayed, not bunched.
pub fn spawn_ticker<S>(
    engine: Arc<IngestionEngine<S>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    S: MetricSink + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            let now = tokio::select! {
                at = interval.tick() => at.into_std(),
                _ = shutdown.changed() => break,
            };
            engine.on_tick(now).await;
        }
        debug!("inactivity ticker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::{CarbonForwarder, ForwardError};
    use crate::models::SensorKey;
    use chrono::FixedOffset;
    use sensorwatch_devkit::{init_test_tracing, MockCarbonServer, ReadingBuilder};
    use std::collections::VecDeque;
    use std::io;

    #[derive(Debug, Clone, PartialEq)]
    struct Forwarded {
        machine_id: String,
        metric_name: String,
        timestamp: String,
        value: f64,
    }

    /// Records every forward; fails the calls whose index is listed in `fail_on`.
    #[derive(Default)]
    struct RecordingSink {
        forwarded: parking_lot::Mutex<Vec<Forwarded>>,
        calls: AtomicU64,
        fail_on: parking_lot::Mutex<VecDeque<u64>>,
    }

    impl RecordingSink {
        fn failing_on(calls: &[u64]) -> Self {
            let sink = Self::default();
            sink.fail_on.lock().extend(calls.iter().copied());
            sink
        }

        fn metric_names(&self) -> Vec<String> {
            self.forwarded.lock().iter().map(|f| f.metric_name.clone()).collect()
        }
    }

    impl MetricSink for RecordingSink {
        async fn forward(
            &self,
            machine_id: &str,
            metric_name: &str,
            timestamp: &str,
            value: f64,
        ) -> Result<(), ForwardError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let should_fail = {
                let mut fail_on = self.fail_on.lock();
                if fail_on.front() == Some(&call) {
                    fail_on.pop_front();
                    true
                } else {
                    false
                }
            };
            if should_fail {
                return Err(ForwardError::Write {
                    addr: "test".into(),
                    source: io::Error::new(io::ErrorKind::BrokenPipe, "injected"),
                });
            }
            self.forwarded.lock().push(Forwarded {
                machine_id: machine_id.to_string(),
                metric_name: metric_name.to_string(),
                timestamp: timestamp.to_string(),
                value,
            });
            Ok(())
        }
    }

    fn engine(sink: RecordingSink) -> IngestionEngine<RecordingSink> {
        init_test_tracing();
        IngestionEngine::new(sink, DetectorState::default(), TimeCodec::local())
    }

    async fn send(engine: &IngestionEngine<RecordingSink>, reading: ReadingBuilder, now: Instant) {
        engine.on_message(&reading.topic(), &reading.payload(), now).await;
    }

    #[tokio::test]
    async fn test_reading_is_forwarded_and_tracked() {
        let engine = engine(RecordingSink::default());
        let now = Instant::now();
        send(
            &engine,
            ReadingBuilder::new("pi-garage", "humidity").value(72.0).timestamp("2024-03-01T12:00:00"),
            now,
        )
        .await;

        assert_eq!(
            engine.sink().forwarded.lock().clone(),
            vec![Forwarded {
                machine_id: "pi-garage".into(),
                metric_name: "humidity".into(),
                timestamp: "2024-03-01T12:00:00".into(),
                value: 72.0,
            }]
        );
        let key = SensorKey::new("pi-garage", "humidity");
        assert_eq!(engine.detectors().inactivity.lock().last_seen(&key), Some(now));
        assert_eq!(engine.detectors().moving_average.lock().average(&key), Some(72.0));
        assert_eq!(engine.stats().ingested, 1);
    }

    #[tokio::test]
    async fn test_malformed_messages_leave_state_untouched() {
        let engine = engine(RecordingSink::default());
        let now = Instant::now();
        engine.on_message("/sensors/pi-garage", br#"{"timestamp":"2024-03-01T12:00:00","value":1}"#, now).await;
        engine.on_message("/sensors/pi-garage/cpu", b"{oops", now).await;
        engine.on_message("/sensors/pi-garage/cpu", br#"{"value":1}"#, now).await;

        assert!(engine.sink().forwarded.lock().is_empty());
        assert_eq!(engine.detectors().tracked_keys(), (0, 0));
        assert_eq!(engine.stats(), EngineStats { dropped: 3, ..EngineStats::default() });
    }

    #[tokio::test]
    async fn test_moving_average_alarm_is_forwarded() {
        let engine = engine(RecordingSink::default());
        let now = Instant::now();
        for (i, value) in [30.0, 30.0, 30.0, 30.0, 10.0, 10.0].into_iter().enumerate() {
            let ts = format!("2024-03-01T12:00:0{i}");
            send(&engine, ReadingBuilder::new("pi-garage", "temperature").value(value).timestamp(&ts), now).await;
        }

        assert_eq!(
            engine.sink().metric_names(),
            vec![
                "temperature",
                "temperature",
                "temperature",
                "temperature",
                "temperature",
                "temperature",
                "alarms.move_average.temperature",
            ]
        );
        let alarm = engine.sink().forwarded.lock().last().cloned().unwrap();
        assert_eq!(alarm.machine_id, "pi-garage");
        assert_eq!(alarm.timestamp, "2024-03-01T12:00:05");
        assert_eq!(alarm.value, 1.0);
        assert_eq!(engine.stats().alarms, 1);
    }

    #[tokio::test]
    async fn test_forward_failure_does_not_block_detection() {
        // first forward (the raw reading) fails
        let engine = engine(RecordingSink::failing_on(&[0]));
        let t0 = Instant::now();
        send(&engine, ReadingBuilder::new("host-1", "temperature").value(10.0), t0).await;

        let key = SensorKey::new("host-1", "temperature");
        assert_eq!(engine.detectors().inactivity.lock().last_seen(&key), Some(t0));
        // the alarm still went out after the raw value was lost
        assert_eq!(engine.sink().metric_names(), vec!["alarms.move_average.temperature"]);

        let t1 = t0 + Duration::from_secs(1);
        send(&engine, ReadingBuilder::new("host-1", "temperature").value(40.0), t1).await;
        assert_eq!(engine.detectors().inactivity.lock().last_seen(&key), Some(t1));
        assert_eq!(engine.detectors().moving_average.lock().average(&key), Some(25.0));
        assert_eq!(
            engine.sink().metric_names(),
            vec!["alarms.move_average.temperature", "temperature"]
        );
        assert_eq!(engine.stats().forward_failures, 1);
    }

    #[tokio::test]
    async fn test_tick_derives_elapsed_from_previous_tick() {
        let t0 = Instant::now();
        let engine = engine(RecordingSink::default()).starting_at(t0);
        send(&engine, ReadingBuilder::new("host-1", "cpu").value(5.0), t0).await;

        // 10s since start: threshold 100s, silence 10s
        assert_eq!(engine.on_tick(t0 + Duration::from_secs(10)).await, 0);
        // 1s since previous tick: threshold 10s, silence 11s
        assert_eq!(engine.on_tick(t0 + Duration::from_secs(11)).await, 1);
        assert_eq!(engine.on_tick(t0 + Duration::from_secs(12)).await, 1);

        let names = engine.sink().metric_names();
        assert_eq!(names, vec!["cpu", "alarms.inactivecpu", "alarms.inactivecpu"]);
        let alarm = engine.sink().forwarded.lock()[1].clone();
        assert!(TimeCodec::local().to_epoch(&alarm.timestamp).is_ok());

        // a fresh reading silences the key
        send(&engine, ReadingBuilder::new("host-1", "cpu").value(6.0), t0 + Duration::from_secs(12)).await;
        assert_eq!(engine.on_tick(t0 + Duration::from_secs(13)).await, 0);
    }

    #[tokio::test]
    async fn test_scan_inactivity_with_explicit_elapsed() {
        let engine = engine(RecordingSink::default());
        let t1 = Instant::now();
        send(&engine, ReadingBuilder::new("host-1", "ram").value(1024.0), t1).await;

        let second = Duration::from_secs(1);
        assert_eq!(engine.scan_inactivity(t1 + Duration::from_secs(10), second).await, 0);
        assert_eq!(engine.scan_inactivity(t1 + Duration::from_millis(10_500), second).await, 1);
    }

    #[tokio::test]
    async fn test_idle_eviction_clears_both_detectors() {
        let t0 = Instant::now();
        let engine = engine(RecordingSink::default())
            .starting_at(t0)
            .with_idle_eviction(Some(Duration::from_secs(60)));
        send(&engine, ReadingBuilder::new("host-1", "temperature").value(30.0), t0).await;
        send(
            &engine,
            ReadingBuilder::new("host-2", "temperature").value(30.0),
            t0 + Duration::from_secs(50),
        )
        .await;
        assert_eq!(engine.detectors().tracked_keys(), (2, 2));

        engine.on_tick(t0 + Duration::from_secs(61)).await;
        assert_eq!(engine.detectors().tracked_keys(), (1, 1));
        let remaining = SensorKey::new("host-2", "temperature");
        assert!(engine.detectors().moving_average.lock().window(&remaining).is_some());
    }

    #[tokio::test]
    async fn test_worker_drains_channel_and_stops_on_shutdown() {
        let engine = Arc::new(engine(RecordingSink::default()));
        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = spawn_ingest_worker(engine.clone(), rx, shutdown_rx);

        let reading = ReadingBuilder::new("host-1", "cpu").value(3.5);
        for _ in 0..3 {
            tx.send(InboundMessage {
                topic: reading.topic(),
                payload: reading.payload(),
                received_at: Instant::now(),
            })
            .await
            .unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.stats().ingested < 3 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(engine.stats().ingested, 3);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_scans_on_interval() {
        let engine = Arc::new(engine(RecordingSink::default()));
        let start = tokio::time::Instant::now().into_std();
        engine
            .on_message(
                &ReadingBuilder::new("host-1", "cpu").topic(),
                &ReadingBuilder::new("host-1", "cpu").value(1.0).payload(),
                start,
            )
            .await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ticker = spawn_ticker(engine.clone(), Duration::from_secs(1), shutdown_rx);
        tokio::time::sleep(Duration::from_millis(15_500)).await;
        shutdown_tx.send(true).unwrap();
        ticker.await.unwrap();

        // ticks at 1s cadence flag the key once silence passes 10s
        let alarms = engine
            .sink()
            .metric_names()
            .into_iter()
            .filter(|m| m == "alarms.inactivecpu")
            .count();
        assert!((4..=6).contains(&alarms), "got {alarms} alarms");
    }

    #[tokio::test]
    async fn test_engine_against_carbon_backend() {
        let server = MockCarbonServer::start().await.unwrap();
        let addr = server.addr();
        let codec = TimeCodec::fixed(FixedOffset::east_opt(0).unwrap());
        let forwarder = CarbonForwarder::new(&addr.ip().to_string(), addr.port(), codec);
        let engine = IngestionEngine::new(forwarder, DetectorState::default(), codec);

        let reading = ReadingBuilder::new("pi-garage", "humidity")
            .value(40.0)
            .timestamp("2023-11-14T22:13:20");
        engine.on_message(&reading.topic(), &reading.payload(), Instant::now()).await;

        let lines = server.wait_for_lines(2, Duration::from_secs(2)).await;
        assert_eq!(lines[0].raw, "pi-garage.humidity 40 1700000000");
        assert_eq!(lines[1].raw, "pi-garage.alarms.move_average.humidity 1 1700000000");
        assert_eq!(server.connection_count(), 1);

        engine.sink().close().await;
    }
}
