//! Fan-out of Worker signals to every connected Node.

use tokio::sync::broadcast;
use tracing::debug;

use warden_core::WorkerSignal;

const DEFAULT_CAPACITY: usize = 64;

/// Broadcasts [`WorkerSignal`]s to all subscribed Nodes.
///
/// Delivery is fire-and-forget: a signal sent while no Node is listening
/// is dropped, and nothing waits for Nodes to act on it.
#[derive(Clone)]
pub struct SignalHub {
    tx: broadcast::Sender<WorkerSignal>,
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl SignalHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Send `signal` to every current subscriber; returns how many got it.
    pub fn send(&self, signal: WorkerSignal) -> usize {
        let event = signal.event_name();
        match self.tx.send(signal) {
            Ok(n) => {
                debug!(%event, subscribers = n, "signal broadcast");
                n
            }
            Err(_) => {
                debug!(%event, "signal broadcast with no subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerSignal> {
        self.tx.subscribe()
    }

    pub fn subscribers(&self) -> usize {
        self.tx.receiver_count()
    }
}
