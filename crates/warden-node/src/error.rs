//! Node handle errors.

use thiserror::Error;
use warden_core::WorkerError;

pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node {0} has no command to run")]
    EmptyCommand(String),

    #[error("node {0} was already configured")]
    AlreadyConfigured(String),

    #[error("node {0} must be configured before it is started")]
    NotConfigured(String),

    #[error("node {0} was already started")]
    AlreadyStarted(String),

    #[error("failed to spawn node {id}: {source}")]
    Spawn {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("missing or invalid node environment variable {0}")]
    Environment(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<NodeError> for WorkerError {
    fn from(e: NodeError) -> Self {
        match e {
            NodeError::EmptyCommand(_) | NodeError::Environment(_) => {
                WorkerError::InvalidNodeSpec(e.to_string())
            }
            NodeError::Io(io) => WorkerError::Io(io),
            NodeError::Spawn { source, .. } => WorkerError::Io(source),
            other => WorkerError::Config(other.to_string()),
        }
    }
}
