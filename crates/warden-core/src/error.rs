//! Error taxonomy of the Worker.
//!
//! Handshake and network failures are recovered or degraded where they
//! occur; the only error allowed to reach a caller as a hard failure is
//! [`WorkerError::ArchiveMoveTimeout`].

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, warn};

use crate::types::NodeId;

/// Result type alias for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Which half of the creation handshake a Node was waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Init,
    Ready,
}

impl fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakePhase::Init => f.write_str("init"),
            HandshakePhase::Ready => f.write_str("ready"),
        }
    }
}

/// Errors that can occur while orchestrating Nodes.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("node {node_id} did not report {phase} in time")]
    HandshakeTimeout {
        node_id: NodeId,
        phase: HandshakePhase,
    },

    #[error("manager unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("node {node_id} exited abnormally (code {code:?})")]
    ProcessAbnormalExit { node_id: NodeId, code: Option<i32> },

    #[error("moving archive to {} did not complete within {waited:?}", path.display())]
    ArchiveMoveTimeout { path: PathBuf, waited: Duration },

    #[error("invalid node spec: {0}")]
    InvalidNodeSpec(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker event loop is not running")]
    LoopUnavailable,

    #[error("worker event loop did not answer within {0:?}")]
    BridgeTimeout(Duration),
}

impl WorkerError {
    /// Whether this error must propagate instead of being logged and dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WorkerError::ArchiveMoveTimeout { .. })
    }
}

/// Logged-but-ignored handling for the shutdown and network paths.
pub trait ResultExt<T> {
    /// Log the error (fatal ones at `error`, the rest at `warn`) and
    /// continue with `None`.
    fn or_log(self, context: &str) -> Option<T>;
}

impl<T> ResultExt<T> for WorkerResult<T> {
    fn or_log(self, context: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) if e.is_fatal() => {
                error!(%context, error = %e, "unrecoverable failure ignored");
                None
            }
            Err(e) => {
                warn!(%context, error = %e, "operation failed, continuing");
                None
            }
        }
    }
}
