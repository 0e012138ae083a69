//! Node log receiver.
//!
//! Nodes forward their log records over TCP as newline-delimited JSON
//! (`{"node_id": .., "level": .., "message": ..}`). Each record is
//! re-emitted as a `tracing` event carrying the Node's id.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use warden_core::WorkerResult;

/// One log line forwarded by a Node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeLogRecord {
    pub node_id: String,
    #[serde(default = "default_level")]
    pub level: String,
    pub message: String,
}

fn default_level() -> String {
    "info".to_string()
}

impl NodeLogRecord {
    fn emit(&self) {
        let node_id = self.node_id.as_str();
        let message = self.message.as_str();
        match self.level.to_ascii_lowercase().as_str() {
            "error" | "critical" => error!(target: "warden::node", node_id, "{message}"),
            "warn" | "warning" => warn!(target: "warden::node", node_id, "{message}"),
            "debug" => debug!(target: "warden::node", node_id, "{message}"),
            "trace" => trace!(target: "warden::node", node_id, "{message}"),
            _ => info!(target: "warden::node", node_id, "{message}"),
        }
    }
}

/// TCP listener collecting Node log records.
pub struct LogReceiver {
    addr: SocketAddr,
    received: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LogReceiver {
    /// Bind on `host` with an ephemeral port and start accepting Nodes.
    pub async fn bind(host: &str) -> WorkerResult<Self> {
        let listener = TcpListener::bind((host, 0)).await?;
        let addr = listener.local_addr()?;
        let received = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let counter = received.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "node log connection accepted");
                            tokio::spawn(read_records(stream, counter.clone()));
                        }
                        Err(e) => {
                            warn!(error = %e, "node log accept failed");
                        }
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        debug!(%addr, "node log receiver listening");
        Ok(Self {
            addr,
            received,
            shutdown_tx,
            handle,
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Number of records re-emitted so far.
    pub fn records_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Stop accepting connections. Open connections drain on their own.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

async fn read_records<R>(stream: R, counter: Arc<AtomicU64>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match serde_json::from_str::<NodeLogRecord>(&line) {
                Ok(record) => {
                    record.emit();
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => debug!(error = %e, "malformed node log record"),
            },
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "node log connection failed");
                break;
            }
        }
    }
}
