//! The contract every supervised Node implements.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use warden_core::{NodeId, NodeSpec};

use crate::error::NodeResult;

/// Everything a Node needs to know about its place in the Worker.
///
/// Handed to [`NodeHandle::configure`] exactly once per creation attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    /// `host:port` of the Worker's control server.
    pub worker_address: String,
    /// Directory the Node writes its artifacts into.
    pub temp_dir: PathBuf,
    pub topology: NodeTopology,
    /// Log level the Worker runs at (`tracing` level name).
    pub logging_level: String,
    /// Port of the Worker's node log receiver.
    pub logging_port: u16,
    /// Creation attempt this configuration belongs to.
    pub incarnation: u32,
    /// Package archives loaded by the Manager, searched in order.
    #[serde(default)]
    pub package_path: Vec<PathBuf>,
}

/// Graph position and parameters of a Node, taken from its spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeTopology {
    #[serde(default)]
    pub in_bound: Vec<NodeId>,
    #[serde(default)]
    pub in_bound_by_name: Vec<String>,
    #[serde(default)]
    pub out_bound: Vec<NodeId>,
    #[serde(default)]
    pub follow: Option<NodeId>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl From<&NodeSpec> for NodeTopology {
    fn from(spec: &NodeSpec) -> Self {
        Self {
            in_bound: spec.in_bound.clone(),
            in_bound_by_name: spec.in_bound_by_name.clone(),
            out_bound: spec.out_bound.clone(),
            follow: spec.follow.clone(),
            payload: spec.payload.clone(),
        }
    }
}

/// Last known exit state of a Node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeExit {
    /// `start` was never called.
    NotStarted,
    /// Still alive when the join deadline passed.
    Running,
    /// Exited with this code; deaths by signal report -1.
    Exited(i32),
}

impl NodeExit {
    /// Nothing is left running and nothing went wrong.
    pub fn is_clean(&self) -> bool {
        matches!(self, NodeExit::NotStarted | NodeExit::Exited(0))
    }
}

/// Lifecycle operations on a single Node.
///
/// Starting is asynchronous from the Worker's point of view: `start`
/// returning only means the Node was launched. Its progress is observed
/// through the status reports it pushes to the control plane.
#[async_trait]
pub trait NodeHandle: Send {
    fn id(&self) -> &str;

    /// Must be called exactly once, before [`start`](Self::start).
    fn configure(&mut self, config: NodeConfig) -> NodeResult<()>;

    async fn start(&mut self) -> NodeResult<()>;

    /// Ask the Node to finish and exit on its own.
    async fn shutdown(&mut self) -> NodeResult<()>;

    /// Kill the Node without waiting for it to cooperate.
    async fn terminate(&mut self) -> NodeResult<()>;

    /// Wait up to `timeout` for the Node to exit.
    async fn join(&mut self, timeout: Duration) -> NodeResult<NodeExit>;

    /// Non-blocking exit check.
    fn try_exit(&mut self) -> NodeResult<NodeExit>;
}

/// Produces a fresh, unconfigured handle for a creation attempt.
pub trait NodeLauncher: Send + Sync {
    /// Reject specs this launcher can never bring up, before any attempt.
    fn check(&self, _spec: &NodeSpec) -> NodeResult<()> {
        Ok(())
    }

    fn launch(&self, spec: &NodeSpec) -> NodeResult<Box<dyn NodeHandle>>;
}
