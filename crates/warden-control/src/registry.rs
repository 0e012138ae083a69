//! The single writer of worker and node state.
//!
//! An actor task owns the [`WorkerState`], the per-node gather slots and
//! the file transfer records. Every mutation is a command applied in
//! arrival order, and each applied command publishes a fresh
//! [`Snapshot`] on a `watch` channel. Waiters never poll: they observe
//! snapshots until a predicate holds or a deadline passes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use warden_core::*;

/// A file delivered to the Worker's control server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub path: PathBuf,
    pub complete: bool,
}

/// Point-in-time view of everything the registry owns.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub worker: WorkerState,
    /// Gather payloads received since the last [`Registry::reset_gather`].
    pub gathered: BTreeMap<NodeId, DataChunk>,
    pub transfers: BTreeMap<String, Transfer>,
    /// Loaded package archives, in load order.
    pub package_path: Vec<PathBuf>,
}

impl Snapshot {
    pub fn node(&self, id: &str) -> Option<&NodeState> {
        self.worker.nodes.get(id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.worker.nodes.keys().cloned().collect()
    }
}

enum Command {
    SetAddress {
        host: String,
        port: u16,
    },
    BeginIncarnation {
        id: NodeId,
        name: String,
        reply: oneshot::Sender<u32>,
    },
    Report {
        report: NodeReport,
        reply: oneshot::Sender<Option<NodeState>>,
    },
    ResetGather,
    RecordTransfer {
        name: String,
        transfer: Transfer,
    },
    AddPackage(PathBuf),
    Clear,
}

/// Handle to the registry actor. Cheap to clone.
#[derive(Clone)]
pub struct Registry {
    commands: mpsc::UnboundedSender<(Command, oneshot::Sender<()>)>,
    snapshots: watch::Receiver<Arc<Snapshot>>,
}

impl Registry {
    /// Spawn the actor on the current tokio runtime.
    ///
    /// The actor stops once every handle has been dropped.
    pub fn spawn(worker: WorkerState) -> Self {
        let snapshot = Snapshot {
            worker,
            gathered: BTreeMap::new(),
            transfers: BTreeMap::new(),
            package_path: Vec::new(),
        };
        let (snap_tx, snap_rx) = watch::channel(Arc::new(snapshot.clone()));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_actor(snapshot, cmd_rx, snap_tx));

        Self {
            commands: cmd_tx,
            snapshots: snap_rx,
        }
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn worker_state(&self) -> WorkerState {
        self.snapshot().worker.clone()
    }

    /// Send a command and wait until it has been applied and published.
    async fn apply(&self, command: Command) -> WorkerResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send((command, done_tx))
            .map_err(|_| WorkerError::LoopUnavailable)?;
        done_rx.await.map_err(|_| WorkerError::LoopUnavailable)
    }

    /// Record the address the control server is reachable on.
    pub async fn set_address(&self, host: impl Into<String>, port: u16) -> WorkerResult<()> {
        self.apply(Command::SetAddress {
            host: host.into(),
            port,
        })
        .await
    }

    /// Start a new incarnation of `id`, registering the node if needed.
    ///
    /// Clears the lifecycle flags and any pending gather payload, and
    /// returns the incarnation number the Node must report with.
    pub async fn begin_incarnation(&self, id: &str, name: &str) -> WorkerResult<u32> {
        let (reply, rx) = oneshot::channel();
        self.apply(Command::BeginIncarnation {
            id: id.to_string(),
            name: name.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| WorkerError::LoopUnavailable)
    }

    /// Fold a Node's report into the registry.
    ///
    /// Returns the merged state, or `None` when the report was dropped
    /// because the node is unknown or the report belongs to an older
    /// incarnation.
    pub async fn report(&self, report: NodeReport) -> WorkerResult<Option<NodeState>> {
        let (reply, rx) = oneshot::channel();
        self.apply(Command::Report { report, reply }).await?;
        rx.await.map_err(|_| WorkerError::LoopUnavailable)
    }

    /// Forget every gather payload received so far.
    pub async fn reset_gather(&self) -> WorkerResult<()> {
        self.apply(Command::ResetGather).await
    }

    pub async fn record_transfer(
        &self,
        name: impl Into<String>,
        path: PathBuf,
        complete: bool,
    ) -> WorkerResult<()> {
        self.apply(Command::RecordTransfer {
            name: name.into(),
            transfer: Transfer { path, complete },
        })
        .await
    }

    /// Append a loaded package archive to the search path.
    pub async fn add_package(&self, path: PathBuf) -> WorkerResult<()> {
        self.apply(Command::AddPackage(path)).await
    }

    /// Drop every node record. Used once the Worker has shut down.
    pub async fn clear(&self) -> WorkerResult<()> {
        self.apply(Command::Clear).await
    }

    /// Wait until `pred` holds for a published snapshot.
    ///
    /// Returns `false` if `timeout` elapses first or the actor is gone.
    pub async fn wait_until<F>(&self, timeout: Duration, mut pred: F) -> bool
    where
        F: FnMut(&Snapshot) -> bool + Send,
    {
        let mut rx = self.snapshots.clone();
        let wait = async move {
            loop {
                let done = {
                    let snapshot = rx.borrow_and_update();
                    pred(&snapshot)
                };
                if done {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    /// Wait until node `id` satisfies `pred`.
    pub async fn wait_for_node<F>(&self, id: &str, timeout: Duration, pred: F) -> bool
    where
        F: Fn(&NodeState) -> bool + Send + Sync,
    {
        self.wait_until(timeout, |s| s.node(id).is_some_and(&pred))
            .await
    }
}

async fn run_actor(
    mut state: Snapshot,
    mut commands: mpsc::UnboundedReceiver<(Command, oneshot::Sender<()>)>,
    snapshots: watch::Sender<Arc<Snapshot>>,
) {
    while let Some((command, done)) = commands.recv().await {
        apply_command(&mut state, command);
        snapshots.send_replace(Arc::new(state.clone()));
        let _ = done.send(());
    }
    debug!("registry stopped");
}

fn apply_command(state: &mut Snapshot, command: Command) {
    match command {
        Command::SetAddress { host, port } => {
            state.worker.host = host;
            state.worker.port = port;
        }
        Command::BeginIncarnation { id, name, reply } => {
            let previous = state.worker.nodes.get(&id).map_or(0, |n| n.incarnation);
            let mut node = NodeState::new(id.clone());
            node.name = name;
            node.incarnation = previous + 1;
            debug!(node_id = %id, incarnation = node.incarnation, "node incarnation started");

            state.gathered.remove(&id);
            state.worker.nodes.insert(id, node);
            let _ = reply.send(previous + 1);
        }
        Command::Report { report, reply } => {
            let _ = reply.send(apply_report(state, report));
        }
        Command::ResetGather => state.gathered.clear(),
        Command::RecordTransfer { name, transfer } => {
            debug!(%name, complete = transfer.complete, "file transfer recorded");
            state.transfers.insert(name, transfer);
        }
        Command::AddPackage(path) => {
            if !state.package_path.contains(&path) {
                state.package_path.push(path);
            }
        }
        Command::Clear => {
            state.worker.nodes.clear();
            state.gathered.clear();
        }
    }
}

fn apply_report(state: &mut Snapshot, report: NodeReport) -> Option<NodeState> {
    let update = match &report {
        NodeReport::Status(update) => update,
        NodeReport::Gather { state: update, .. } => update,
    };

    let Some(node) = state.worker.nodes.get_mut(&update.id) else {
        warn!(node_id = %update.id, "report from unregistered node dropped");
        return None;
    };

    // Incarnation 0 means the Node did not say which attempt it belongs to.
    if update.incarnation != 0 && update.incarnation != node.incarnation {
        debug!(
            node_id = %update.id,
            reported = update.incarnation,
            current = node.incarnation,
            "report from stale incarnation dropped"
        );
        return None;
    }

    node.merge(update);
    let merged = node.clone();

    if let NodeReport::Gather { payload, .. } = report {
        state.gathered.insert(merged.id.clone(), payload);
    }
    Some(merged)
}
