//! Metric forwarding to a Graphite (carbon plaintext) backend.
//!
//! Keeps one outbound TCP connection open across metrics:
//! - connects lazily on the first metric
//! - drops the connection on any failure and reconnects on the next metric
//! - checks a kept connection for EOF before reusing it
//! - retries a failed write once when the connection was a reused one
//! - bounds every connect and write with a timeout

use crate::time_codec::{TimeCodec, TimeCodecError};
use serde::Serialize;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error(transparent)]
    InvalidTimestamp(#[from] TimeCodecError),
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("write to {addr} failed: {source}")]
    Write {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("write to {addr} timed out after {timeout:?}")]
    WriteTimeout { addr: String, timeout: Duration },
}

/// Destination for metric lines. The engine is generic over it.
pub trait MetricSink: Send + Sync {
    fn forward(
        &self,
        machine_id: &str,
        metric_name: &str,
        timestamp: &str,
        value: f64,
    ) -> impl Future<Output = Result<(), ForwardError>> + Send;
}

/// `<machine_id>.<metric_name> <value> <epoch_seconds>\n`
pub fn format_line(machine_id: &str, metric_name: &str, value: f64, epoch_seconds: i64) -> String {
    format!("{machine_id}.{metric_name} {value} {epoch_seconds}\n")
}

#[derive(Debug, Default)]
struct ForwarderCounters {
    sent: AtomicU64,
    failed: AtomicU64,
    connections: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ForwarderStats {
    pub sent: u64,
    pub failed: u64,
    pub connections: u64,
}

pub struct CarbonForwarder {
    addr: String,
    codec: TimeCodec,
    connect_timeout: Duration,
    write_timeout: Duration,
    conn: Mutex<Option<TcpStream>>,
    counters: ForwarderCounters,
}

impl CarbonForwarder {
    pub fn new(host: &str, port: u16, codec: TimeCodec) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            codec,
            connect_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
            conn: Mutex::new(None),
            counters: ForwarderCounters::default(),
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, write: Duration) -> Self {
        self.connect_timeout = connect;
        self.write_timeout = write;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn stats(&self) -> ForwarderStats {
        ForwarderStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            connections: self.counters.connections.load(Ordering::Relaxed),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// Shuts the backend connection down. The next forward reconnects.
    pub async fn close(&self) {
        if let Some(mut stream) = self.conn.lock().await.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(addr = %self.addr, error = %e, "backend connection shutdown failed");
            }
            info!(addr = %self.addr, "backend connection closed");
        }
    }

    /// Sends one pre-formatted line.
    pub async fn send_line(&self, line: &str) -> Result<(), ForwardError> {
        let mut slot = self.conn.lock().await;
        if (*slot).as_ref().is_some_and(peer_closed) {
            debug!(addr = %self.addr, "backend closed the connection, reconnecting");
            *slot = None;
        }
        let reused = slot.is_some();

        let result = match self.write_once(&mut slot, line.as_bytes()).await {
            Err(err) if reused => {
                debug!(addr = %self.addr, error = %err, "stale backend connection, reconnecting");
                self.write_once(&mut slot, line.as_bytes()).await
            }
            other => other,
        };

        match &result {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    async fn write_once(&self, slot: &mut Option<TcpStream>, bytes: &[u8]) -> Result<(), ForwardError> {
        let mut stream = match slot.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        match timeout(self.write_timeout, stream.write_all(bytes)).await {
            Ok(Ok(())) => {
                *slot = Some(stream);
                Ok(())
            }
            Ok(Err(source)) => Err(ForwardError::Write {
                addr: self.addr.clone(),
                source,
            }),
            Err(_) => Err(ForwardError::WriteTimeout {
                addr: self.addr.clone(),
                timeout: self.write_timeout,
            }),
        }
    }

    async fn connect(&self) -> Result<TcpStream, ForwardError> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ForwardError::Connect {
                    addr: self.addr.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(ForwardError::ConnectTimeout {
                    addr: self.addr.clone(),
                    timeout: self.connect_timeout,
                })
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!(addr = %self.addr, error = %e, "failed to set TCP_NODELAY");
        }
        self.counters.connections.fetch_add(1, Ordering::Relaxed);
        debug!(addr = %self.addr, "backend connection established");
        Ok(stream)
    }
}

/// Carbon never writes back, so a readable stream means EOF or a reset.
fn peer_closed(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match stream.try_read(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => e.kind() != io::ErrorKind::WouldBlock,
    }
}

impl MetricSink for CarbonForwarder {
    async fn forward(
        &self,
        machine_id: &str,
        metric_name: &str,
        timestamp: &str,
        value: f64,
    ) -> Result<(), ForwardError> {
        let epoch = match self.codec.to_epoch(timestamp) {
            Ok(epoch) => epoch,
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                return Err(err.into());
            }
        };
        let line = format_line(machine_id, metric_name, value, epoch);
        self.send_line(&line).await
    }
}
