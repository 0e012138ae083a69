//! warden-node — the boundary between a Worker and the Nodes it runs.
//!
//! A Node is driven through a [`NodeHandle`]: configured exactly once,
//! started, asked to shut down, forcibly terminated, and joined with a
//! deadline. [`NodeLauncher`] turns a Manager's [`NodeSpec`] into a fresh
//! handle for every creation attempt.
//!
//! # Architecture
//!
//! ```text
//! NodeSupervisor (wardend)
//!   └── NodeLauncher::launch(spec) → Box<dyn NodeHandle>
//!         └── ProcessNode
//!               ├── configure() → environment for the child
//!               ├── start()     → tokio::process::Child
//!               ├── shutdown()  → SIGTERM
//!               ├── terminate() → SIGKILL
//!               └── join(t)     → NodeExit
//! ```
//!
//! The Node side reads its configuration back with [`NodeEnv::from_env`].
//!
//! [`NodeSpec`]: warden_core::NodeSpec

pub mod env;
pub mod error;
pub mod handle;
pub mod process;

pub use env::NodeEnv;
pub use error::{NodeError, NodeResult};
pub use handle::{NodeConfig, NodeExit, NodeHandle, NodeLauncher, NodeTopology};
pub use process::{ProcessLauncher, ProcessNode};
