//! State records shared between the Worker, its Nodes, and the Manager.
//!
//! All types serialize to JSON; they are what the Worker reports upstream
//! and what Nodes push back over the control plane.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{WorkerError, WorkerResult};

/// Identifier a Node is registered under on its Worker.
pub type NodeId = String;

/// Name of the entry a default [`DataChunk`] carries.
pub const DEFAULT_CHUNK_ENTRY: &str = "default";

// ── Worker ────────────────────────────────────────────────────────

/// Identity and node table of a Worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerState {
    pub id: Uuid,
    pub name: String,
    /// Advertised host of the Worker's control server.
    pub host: String,
    /// Bound port of the Worker's control server.
    pub port: u16,
    #[serde(default)]
    pub nodes: BTreeMap<NodeId, NodeState>,
}

impl WorkerState {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            host: "0.0.0.0".to_string(),
            port: 0,
            nodes: BTreeMap::new(),
        }
    }

    /// `host:port` of the control server.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Peer map handed to Nodes so they can reach each other.
    pub fn server_data(&self) -> NodeServerData {
        let nodes = self
            .nodes
            .iter()
            .map(|(id, node)| {
                (
                    id.clone(),
                    NodeAddress {
                        host: self.host.clone(),
                        port: node.port,
                    },
                )
            })
            .collect();

        NodeServerData { id: self.id, nodes }
    }
}

// ── Node ──────────────────────────────────────────────────────────

/// Health and identity of a single Node as reported by the Node itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeState {
    pub id: NodeId,
    #[serde(default)]
    pub name: String,
    /// Port of the Node's own data server (0 until reported).
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub init: bool,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub finished: bool,
    /// Creation attempt this record belongs to. Bumped by the Worker on
    /// every (re)spawn of the node id.
    #[serde(default)]
    pub incarnation: u32,
}

impl NodeState {
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Fold a pushed status into this record.
    ///
    /// Lifecycle flags latch: a push can raise them but never clear them.
    /// Empty names and zero ports in the push leave the current values.
    pub fn merge(&mut self, update: &NodeState) {
        if !update.name.is_empty() {
            self.name = update.name.clone();
        }
        if update.port != 0 {
            self.port = update.port;
        }
        self.init |= update.init;
        self.ready |= update.ready;
        self.connected |= update.connected;
        self.finished |= update.finished;
    }
}

/// Where a Node's data server can be reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

/// Peer addressing information for every Node of a Worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeServerData {
    pub id: Uuid,
    #[serde(default)]
    pub nodes: BTreeMap<NodeId, NodeAddress>,
}

// ── Node creation ─────────────────────────────────────────────────

/// Creation request for a Node, as sent by the Manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSpec {
    pub id: NodeId,
    #[serde(default)]
    pub name: String,
    /// Program and arguments launched for this Node.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub in_bound: Vec<NodeId>,
    #[serde(default)]
    pub in_bound_by_name: Vec<String>,
    #[serde(default)]
    pub out_bound: Vec<NodeId>,
    /// Upstream node whose output drives this node's steps.
    #[serde(default)]
    pub follow: Option<NodeId>,
    /// Opaque node-specific parameters.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl NodeSpec {
    pub fn new(id: impl Into<NodeId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            command: Vec::new(),
            in_bound: Vec::new(),
            in_bound_by_name: Vec::new(),
            out_bound: Vec::new(),
            follow: None,
            payload: serde_json::Value::Null,
        }
    }

    /// Name the Node is known by, falling back to its id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }

    /// Reject specs the supervisor cannot act on.
    pub fn validate(&self) -> WorkerResult<()> {
        if self.id.trim().is_empty() {
            return Err(WorkerError::InvalidNodeSpec("node id is empty".to_string()));
        }
        if self.in_bound.contains(&self.id) || self.out_bound.contains(&self.id) {
            return Err(WorkerError::InvalidNodeSpec(format!(
                "node {} has an edge to itself",
                self.id
            )));
        }
        if self.follow.as_ref().is_some_and(|f| !self.in_bound.contains(f)) {
            return Err(WorkerError::InvalidNodeSpec(format!(
                "node {} follows a node that is not one of its inputs",
                self.id
            )));
        }
        Ok(())
    }
}

// ── Gather results ────────────────────────────────────────────────

/// Named payload produced by a Node's gather operation.
///
/// The default chunk holds a single [`DEFAULT_CHUNK_ENTRY`] entry with a
/// null value, which is what a Node that never reports contributes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct DataChunk {
    entries: BTreeMap<String, serde_json::Value>,
}

impl Default for DataChunk {
    fn default() -> Self {
        Self::empty().with(DEFAULT_CHUNK_ENTRY, serde_json::Value::Null)
    }
}

impl DataChunk {
    /// A chunk with no entries at all.
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.add(name, value);
        self
    }

    pub fn add(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.entries.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_latches_flags() {
        let mut state = NodeState::new("n1");
        state.merge(&NodeState {
            id: "n1".into(),
            init: true,
            ready: true,
            ..Default::default()
        });
        assert!(state.init && state.ready);

        // A later push with the flags down leaves them raised.
        state.merge(&NodeState::new("n1"));
        assert!(state.init);
        assert!(state.ready);
    }

    #[test]
    fn merge_keeps_name_and_port_on_empty_push() {
        let mut state = NodeState::new("n1");
        state.merge(&NodeState {
            id: "n1".into(),
            name: "camera".into(),
            port: 9100,
            ..Default::default()
        });
        state.merge(&NodeState::new("n1"));
        assert_eq!(state.name, "camera");
        assert_eq!(state.port, 9100);
    }

    #[test]
    fn node_state_accepts_sparse_json() {
        let state: NodeState = serde_json::from_value(json!({"id": "n1", "init": true})).unwrap();
        assert!(state.init);
        assert!(!state.ready);
        assert_eq!(state.incarnation, 0);
    }

    #[test]
    fn default_chunk_has_one_null_entry() {
        let chunk = DataChunk::default();
        assert_eq!(chunk.len(), 1);
        assert_eq!(chunk.get(DEFAULT_CHUNK_ENTRY), Some(&serde_json::Value::Null));
    }

    #[test]
    fn chunk_serializes_as_plain_object() {
        let chunk = DataChunk::empty().with("x", json!(5));
        assert_eq!(serde_json::to_value(&chunk).unwrap(), json!({"x": 5}));
    }

    #[test]
    fn server_data_uses_worker_host() {
        let mut worker = WorkerState::new(Uuid::new_v4(), "w");
        worker.host = "10.0.0.7".into();
        let mut node = NodeState::new("n1");
        node.port = 9000;
        worker.nodes.insert("n1".into(), node);

        let data = worker.server_data();
        assert_eq!(data.id, worker.id);
        assert_eq!(
            data.nodes["n1"],
            NodeAddress {
                host: "10.0.0.7".into(),
                port: 9000
            }
        );
    }

    #[test]
    fn spec_validation() {
        assert!(NodeSpec::new("", "x").validate().is_err());
        assert!(NodeSpec::new("n1", "").validate().is_ok());

        let mut looped = NodeSpec::new("n1", "a");
        looped.out_bound.push("n1".into());
        assert!(looped.validate().is_err());

        let mut follower = NodeSpec::new("n2", "b");
        follower.follow = Some("n1".into());
        assert!(follower.validate().is_err());
        follower.in_bound.push("n1".into());
        assert!(follower.validate().is_ok());
    }

    #[test]
    fn display_name_falls_back_to_id() {
        assert_eq!(NodeSpec::new("n1", "").display_name(), "n1");
        assert_eq!(NodeSpec::new("n1", "cam").display_name(), "cam");
    }
}
