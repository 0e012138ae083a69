//! Broadcast-and-wait operations over all registered nodes.
//!
//! Each operation broadcasts one signal and then waits on every node in
//! turn, giving each up to `attempts` windows of `window`. A node that
//! never answers is logged and skipped; it never fails the operation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use warden_control::{Registry, SignalHub, Snapshot};
use warden_core::*;

/// Per-node wait budget shared by gather, saving and server data.
#[derive(Debug, Clone, Copy)]
pub struct Patience {
    pub attempts: u32,
    pub window: Duration,
}

impl Patience {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            attempts: config.allowed_failures(),
            window: config.timeouts().info_request,
        }
    }
}

/// Wait for `pred` on node `id`, one window per attempt.
async fn wait_node<F>(registry: &Registry, id: &str, patience: Patience, what: &str, pred: F) -> bool
where
    F: Fn(&Snapshot) -> bool + Send + Sync,
{
    for attempt in 1..=patience.attempts {
        if registry.wait_until(patience.window, &pred).await {
            debug!(node_id = %id, %what, attempt, "node responded");
            return true;
        }
        debug!(node_id = %id, %what, attempt, "node did not respond");
    }
    false
}

/// Collect one [`DataChunk`] per registered node.
///
/// Nodes that do not report in time get [`DataChunk::default`].
pub async fn gather(registry: &Registry, hub: &SignalHub, patience: Patience) -> GatherResult {
    registry.reset_gather().await.or_log("resetting gather slots");

    let node_ids = registry.snapshot().node_ids();
    hub.send(WorkerSignal::RequestGather);

    let mut missing = 0;
    for id in &node_ids {
        let answered = wait_node(registry, id, patience, "gather", |s| {
            s.gathered.contains_key(id.as_str())
        })
        .await;
        if !answered {
            warn!(node_id = %id, "node did not report gather, using default chunk");
            missing += 1;
        }
    }
    if missing > 0 {
        error!(missing, "nodes failed to report to gather");
    }

    let snapshot = registry.snapshot();
    let node_data: BTreeMap<NodeId, DataChunk> = node_ids
        .into_iter()
        .map(|id| {
            let chunk = snapshot.gathered.get(&id).cloned().unwrap_or_default();
            (id, chunk)
        })
        .collect();

    GatherResult {
        id: snapshot.worker.id,
        node_data,
    }
}

/// Ask every node to save and wait for each to report `finished`.
///
/// Returns `true` once the request went out; stragglers are only logged.
pub async fn request_saving(registry: &Registry, hub: &SignalHub, patience: Patience) -> bool {
    hub.send(WorkerSignal::RequestSaving);

    let mut failed = Vec::new();
    for id in registry.snapshot().node_ids() {
        let finished = wait_node(registry, &id, patience, "saving", |s| {
            s.node(&id).is_some_and(|n| n.finished)
        })
        .await;
        if !finished {
            failed.push(id);
        }
    }

    if !failed.is_empty() {
        error!(nodes = ?failed, "nodes failed to report to saving");
    }
    true
}

/// Relay the Manager's peer map to every node and wait for each to
/// report `connected`.
pub async fn distribute_server_data(
    registry: &Registry,
    hub: &SignalHub,
    patience: Patience,
    data: NodeServerData,
) -> bool {
    debug!(nodes = data.nodes.len(), "distributing node server data");
    hub.send(WorkerSignal::ServerData(data));

    let mut failed = Vec::new();
    for id in registry.snapshot().node_ids() {
        let connected = wait_node(registry, &id, patience, "connect", |s| {
            s.node(&id).is_some_and(|n| n.connected)
        })
        .await;
        if !connected {
            failed.push(id);
        }
    }

    if !failed.is_empty() {
        error!(nodes = ?failed, "nodes failed to establish peer connections");
    }
    true
}

/// Wait for each `<name>.zip` to be delivered and complete, then put
/// it on the package path given to nodes created afterwards.
pub async fn load_packages(registry: &Registry, packages: &[String], timeout: Duration) -> bool {
    let started = Instant::now();
    let mut loaded: Vec<PathBuf> = Vec::with_capacity(packages.len());

    for name in packages {
        let file = format!("{name}.zip");
        let remaining = timeout.saturating_sub(started.elapsed());
        let delivered = registry
            .wait_until(remaining, |s| {
                s.transfers.get(&file).is_some_and(|t| t.complete)
            })
            .await;

        if !delivered {
            error!(package = %name, ?timeout, "package was not delivered in time");
            return false;
        }
        if let Some(transfer) = registry.snapshot().transfers.get(&file) {
            loaded.push(transfer.path.clone());
        }
    }

    for path in loaded {
        if registry.add_package(path).await.or_log("adding package").is_none() {
            return false;
        }
    }
    info!(count = packages.len(), "packages loaded");
    true
}
