//! The loop thread and the blocking bridge onto it.
//!
//! All control-plane tasks run on one tokio `current_thread` runtime
//! owned by a dedicated OS thread. Callers on any other thread hand it
//! futures through [`EventLoop::run`] and block until the result is
//! back or a deadline passes.

use std::future::Future;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use warden_core::{WorkerError, WorkerResult};

const RUNTIME_DRAIN: Duration = Duration::from_secs(1);

pub struct EventLoop {
    handle: Handle,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    /// Start the loop thread, named `<name>-loop`.
    pub fn start(name: &str) -> WorkerResult<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(format!("{name}-loop"))
            .spawn(move || {
                runtime.block_on(async {
                    let _ = stop_rx.await;
                });
                runtime.shutdown_timeout(RUNTIME_DRAIN);
                debug!("event loop stopped");
            })?;

        Ok(Self {
            handle,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `fut` on the loop and block the calling thread for its output.
    ///
    /// Must not be called from the loop thread itself. If `timeout`
    /// elapses the task keeps running on the loop; only the wait ends.
    pub fn run<F, T>(&self, fut: F, timeout: Duration) -> WorkerResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        self.handle.spawn(async move {
            let _ = tx.send(fut.await);
        });

        rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => WorkerError::BridgeTimeout(timeout),
            RecvTimeoutError::Disconnected => WorkerError::LoopUnavailable,
        })
    }

    /// Schedule `fut` on the loop without waiting for it.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(fut);
    }

    /// Stop the runtime and join the loop thread.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("event loop thread panicked");
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
    }
}
