//! Node creation handshake and process teardown.
//!
//! Creating a node is an all-or-nothing retry unit: launch, configure,
//! start, wait for `init`, wait for `ready`. A failure anywhere discards
//! the attempt (shutdown, then terminate) and the whole sequence runs
//! again under a fresh incarnation, up to `allowed-failures` times.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use warden_control::Registry;
use warden_core::*;
use warden_node::{NodeConfig, NodeExit, NodeHandle, NodeLauncher, NodeTopology};

/// How long a discarded attempt gets to exit before its handle is dropped.
const DISCARD_JOIN: Duration = Duration::from_millis(500);

/// Deadlines of one creation handshake.
#[derive(Debug, Clone, Copy)]
pub struct Handshake {
    pub attempts: u32,
    pub init_timeout: Duration,
    pub ready_timeout: Duration,
}

impl Handshake {
    pub fn from_config(config: &WorkerConfig) -> Self {
        let timeouts = config.timeouts();
        Self {
            attempts: config.allowed_failures(),
            init_timeout: timeouts.node_creation,
            ready_timeout: timeouts.info_request,
        }
    }

    /// Upper bound on how long a full creation may take.
    pub fn budget(&self) -> Duration {
        self.init_timeout
            .saturating_add(self.ready_timeout)
            .saturating_add(DISCARD_JOIN)
            .saturating_mul(self.attempts)
    }
}

/// Owns the process handle of every node.
pub struct NodeSupervisor {
    launcher: Arc<dyn NodeLauncher>,
    registry: Registry,
    handles: Mutex<BTreeMap<NodeId, Box<dyn NodeHandle>>>,
}

impl NodeSupervisor {
    pub fn new(launcher: Arc<dyn NodeLauncher>, registry: Registry) -> Self {
        Self {
            launcher,
            registry,
            handles: Mutex::new(BTreeMap::new()),
        }
    }

    /// Create `spec`'s node, retrying the whole handshake on failure.
    ///
    /// `base` carries the Worker-wide part of the node configuration;
    /// topology and incarnation are filled in per attempt.
    pub async fn create(&self, spec: &NodeSpec, base: &NodeConfig, handshake: Handshake) -> bool {
        let checked = spec
            .validate()
            .and_then(|()| self.launcher.check(spec).map_err(WorkerError::from));
        if let Err(e) = checked {
            warn!(node_id = %spec.id, error = %e, "rejecting node spec");
            return false;
        }

        for attempt in 1..=handshake.attempts {
            match self.attempt(spec, base, handshake).await {
                Ok(()) => {
                    info!(node_id = %spec.id, attempt, "node ready");
                    return true;
                }
                Err(e) => {
                    debug!(node_id = %spec.id, attempt, error = %e, "node creation attempt failed");
                }
            }
        }

        error!(node_id = %spec.id, attempts = handshake.attempts, "node failed to create");
        false
    }

    async fn attempt(&self, spec: &NodeSpec, base: &NodeConfig, handshake: Handshake) -> WorkerResult<()> {
        let incarnation = self
            .registry
            .begin_incarnation(&spec.id, spec.display_name())
            .await?;

        let mut handle = self.launcher.launch(spec)?;
        handle.configure(NodeConfig {
            topology: NodeTopology::from(spec),
            incarnation,
            ..base.clone()
        })?;
        self.install(&spec.id, handle).await;

        let started = match self.handles.lock().await.get_mut(&spec.id) {
            Some(handle) => handle.start().await,
            None => return Err(WorkerError::LoopUnavailable),
        };
        if let Err(e) = started {
            self.discard(&spec.id).await;
            return Err(e.into());
        }
        debug!(node_id = %spec.id, incarnation, "node started");

        let phases = [
            (HandshakePhase::Init, handshake.init_timeout),
            (HandshakePhase::Ready, handshake.ready_timeout),
        ];
        for (phase, timeout) in phases {
            let reached = self
                .registry
                .wait_for_node(&spec.id, timeout, |n| match phase {
                    HandshakePhase::Init => n.init,
                    HandshakePhase::Ready => n.ready,
                })
                .await;
            if reached {
                debug!(node_id = %spec.id, %phase, "handshake phase reached");
                continue;
            }

            return Err(match self.discard(&spec.id).await {
                NodeExit::Exited(code) if code != 0 => WorkerError::ProcessAbnormalExit {
                    node_id: spec.id.clone(),
                    code: Some(code),
                },
                _ => WorkerError::HandshakeTimeout {
                    node_id: spec.id.clone(),
                    phase,
                },
            });
        }
        Ok(())
    }

    /// Record `handle` under `id`, tearing down whatever it replaces.
    async fn install(&self, id: &str, handle: Box<dyn NodeHandle>) {
        let previous = self.handles.lock().await.insert(id.to_string(), handle);
        if let Some(mut previous) = previous {
            teardown(id, previous.as_mut()).await;
        }
    }

    /// Remove and tear down the handle of `id`; returns its exit state.
    async fn discard(&self, id: &str) -> NodeExit {
        let removed = self.handles.lock().await.remove(id);
        match removed {
            Some(mut handle) => teardown(id, handle.as_mut()).await,
            None => NodeExit::NotStarted,
        }
    }

    /// Ids of nodes with a live handle.
    pub async fn node_ids(&self) -> Vec<NodeId> {
        self.handles.lock().await.keys().cloned().collect()
    }

    /// Non-blocking exit check of one node.
    pub async fn exit_status(&self, id: &str) -> Option<NodeExit> {
        let mut handles = self.handles.lock().await;
        let handle = handles.get_mut(id)?;
        handle.try_exit().map_err(WorkerError::from).or_log("node exit check")
    }

    /// Ask every node to finish, join each within `timeout`, and kill the
    /// ones that are still running or exited abnormally.
    pub async fn shutdown_all(&self, timeout: Duration) {
        let mut handles = self.handles.lock().await;

        for (id, handle) in handles.iter_mut() {
            debug!(node_id = %id, "requesting node shutdown");
            handle
                .shutdown()
                .await
                .map_err(WorkerError::from)
                .or_log("node shutdown");
        }

        for (id, handle) in handles.iter_mut() {
            let exit = handle
                .join(timeout)
                .await
                .map_err(WorkerError::from)
                .or_log("node join")
                .unwrap_or(NodeExit::Running);

            if !exit.is_clean() {
                warn!(node_id = %id, ?exit, "forcing node shutdown");
                handle
                    .terminate()
                    .await
                    .map_err(WorkerError::from)
                    .or_log("node terminate");
                let _ = handle.join(DISCARD_JOIN).await;
            }
            debug!(node_id = %id, "node joined");
        }

        handles.clear();
    }
}

async fn teardown(id: &str, handle: &mut dyn NodeHandle) -> NodeExit {
    handle
        .shutdown()
        .await
        .map_err(WorkerError::from)
        .or_log("discarding node attempt");
    handle
        .terminate()
        .await
        .map_err(WorkerError::from)
        .or_log("discarding node attempt");

    let exit = handle.join(DISCARD_JOIN).await.unwrap_or(NodeExit::Running);
    debug!(node_id = %id, ?exit, "node attempt discarded");
    exit
}
