//! Control-plane messages.
//!
//! Each direction of the control plane is a closed, tagged enum; the
//! transport only decides how a variant is carried, never what it means.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::*;

/// Requests the Manager sends to a Worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ControlRequest {
    CreateNode(NodeSpec),
    ReportServerData,
    ServerDataBroadcast(NodeServerData),
    Step,
    StartNodes,
    StopNodes,
    LoadPackages { packages: Vec<String> },
    RequestSaving,
    RequestGather,
    Collect { path: PathBuf },
    Shutdown,
}

/// Reports a Node pushes to its Worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum NodeReport {
    Status(NodeState),
    Gather { state: NodeState, payload: DataChunk },
}

impl NodeReport {
    pub fn node_id(&self) -> &str {
        match self {
            NodeReport::Status(state) => &state.id,
            NodeReport::Gather { state, .. } => &state.id,
        }
    }
}

/// Body of a gather report pushed by a Node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeGatherReport {
    pub state: NodeState,
    pub payload: DataChunk,
}

impl From<NodeGatherReport> for NodeReport {
    fn from(report: NodeGatherReport) -> Self {
        NodeReport::Gather {
            state: report.state,
            payload: report.payload,
        }
    }
}

/// Fire-and-forget signals a Worker broadcasts to all of its Nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WorkerSignal {
    ServerData(NodeServerData),
    Step,
    StartNodes,
    StopNodes,
    RequestSaving,
    RequestGather,
    Shutdown,
}

impl WorkerSignal {
    /// Event name used when the signal is framed on a stream.
    pub fn event_name(&self) -> &'static str {
        match self {
            WorkerSignal::ServerData(_) => "server_data",
            WorkerSignal::Step => "step",
            WorkerSignal::StartNodes => "start_nodes",
            WorkerSignal::StopNodes => "stop_nodes",
            WorkerSignal::RequestSaving => "request_saving",
            WorkerSignal::RequestGather => "request_gather",
            WorkerSignal::Shutdown => "shutdown",
        }
    }
}

/// Aggregated gather payloads, one entry per registered Node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatherResult {
    pub id: Uuid,
    pub node_data: BTreeMap<NodeId, DataChunk>,
}

/// Replies of the Worker to a [`ControlRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ControlReply {
    /// The request was accepted; nothing further to report.
    Ack,
    NodeCreated {
        success: bool,
        node_state: NodeState,
    },
    ServerData {
        success: bool,
        node_server_data: NodeServerData,
    },
    ServerDataDistributed {
        success: bool,
        worker_state: WorkerState,
    },
    PackagesLoaded {
        success: bool,
    },
    Saved {
        success: bool,
    },
    Gathered(GatherResult),
    Collected {
        id: Uuid,
        success: bool,
    },
}

/// Node status forwarded to the Manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeStatusUpdate {
    pub worker_id: Uuid,
    pub node: NodeState,
}

/// Body of a package load request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadPackagesRequest {
    pub packages: Vec<String>,
}

/// Body of a collect request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectRequest {
    pub path: PathBuf,
}
