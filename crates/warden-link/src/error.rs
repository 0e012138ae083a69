//! Link errors.

use std::time::Duration;

use thiserror::Error;
use warden_core::WorkerError;

pub type LinkResult<T> = Result<T, LinkError>;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] http::Error),

    #[error("{path} answered {status}: {body}")]
    Status {
        path: String,
        status: http::StatusCode,
        body: String,
    },

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("request to {path} timed out after {after:?}")]
    Timeout { path: String, after: Duration },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LinkError> for WorkerError {
    fn from(e: LinkError) -> Self {
        WorkerError::NetworkUnavailable(e.to_string())
    }
}
