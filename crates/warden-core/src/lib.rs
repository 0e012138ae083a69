//! warden-core — shared vocabulary of the Warden worker.
//!
//! Everything that crosses a crate or process boundary lives here: the
//! serializable state records the Worker keeps about itself and its
//! Nodes, the closed set of control-plane messages, the worker
//! configuration surface, and the error taxonomy.

pub mod config;
pub mod error;
pub mod messages;
pub mod types;

pub use config::WorkerConfig;
pub use error::{HandshakePhase, ResultExt, WorkerError, WorkerResult};
pub use messages::*;
pub use types::*;
