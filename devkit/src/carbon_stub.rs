/*!
In-process carbon plaintext backend.

Accepts any number of TCP connections on a loopback port and records every
newline-terminated line it receives, in arrival order.
*/

use anyhow::Result;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// One received line, split into its carbon fields when well-formed.
#[derive(Debug, Clone, PartialEq)]
pub struct CarbonLine {
    /// Line without the trailing newline.
    pub raw: String,
    pub path: String,
    pub value: Option<f64>,
    pub epoch: Option<i64>,
}

impl CarbonLine {
    pub fn parse(raw: &str) -> Self {
        let mut fields = raw.split_whitespace();
        let path = fields.next().unwrap_or_default().to_string();
        let value = fields.next().and_then(|v| v.parse().ok());
        let epoch = fields.next().and_then(|e| e.parse().ok());
        Self { raw: raw.to_string(), path, value, epoch }
    }
}

#[derive(Default)]
struct Shared {
    lines: Mutex<Vec<CarbonLine>>,
    connections: AtomicUsize,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

pub struct MockCarbonServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    acceptor: JoinHandle<()>,
}

impl MockCarbonServer {
    /// Binds `127.0.0.1:0` and starts accepting.
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared::default());

        let state = shared.clone();
        let acceptor = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else { break };
                state.connections.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(%peer, "carbon stub accepted connection");
                let reader = tokio::spawn(read_lines(stream, state.clone()));
                state.readers.lock().push(reader);
            }
        });

        Ok(Self { addr, shared, acceptor })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn lines(&self) -> Vec<CarbonLine> {
        self.shared.lines.lock().clone()
    }

    /// Connections accepted so far, including closed ones.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` lines arrived or `within` elapsed, then
    /// returns everything received.
    pub async fn wait_for_lines(&self, count: usize, within: Duration) -> Vec<CarbonLine> {
        let deadline = Instant::now() + within;
        while self.shared.lines.lock().len() < count && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.lines()
    }

    /// Closes every open connection from the server side; the listener stays up.
    pub async fn drop_connections(&self) {
        let readers: Vec<JoinHandle<()>> = self.shared.readers.lock().drain(..).collect();
        for reader in readers {
            reader.abort();
            let _ = reader.await;
        }
    }
}

impl Drop for MockCarbonServer {
    fn drop(&mut self) {
        self.acceptor.abort();
        for reader in self.shared.readers.lock().drain(..) {
            reader.abort();
        }
    }
}

async fn read_lines(stream: TcpStream, shared: Arc<Shared>) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        shared.lines.lock().push(CarbonLine::parse(&line));
    }
}
