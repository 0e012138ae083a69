//! warden-control — the Worker's control plane.
//!
//! All worker and node state lives in a [`Registry`] actor; Manager
//! requests and Node reports arrive over HTTP and are handed to a
//! [`Dispatcher`]; signals to Nodes fan out through a [`SignalHub`].
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/nodes/create` | Create a node from a `NodeSpec` |
//! | GET | `/nodes/server_data` | Report node data-server addresses |
//! | POST | `/nodes/server_data` | Relay peer addresses to all nodes |
//! | POST | `/nodes/step` | Broadcast a step |
//! | POST | `/nodes/start` | Broadcast start |
//! | POST | `/nodes/stop` | Broadcast stop |
//! | POST | `/nodes/save` | Ask nodes to save and wait for them |
//! | GET | `/nodes/gather` | Gather one payload per node |
//! | POST | `/nodes/collect` | Ship results to a destination |
//! | POST | `/packages/load` | Wait for delivered packages |
//! | POST | `/shutdown` | Shut the worker down |
//! | PUT | `/files/{name}` | Deliver a file |
//! | POST | `/nodes/status` | Node status push |
//! | POST | `/nodes/gather/report` | Node gather payload |
//! | GET | `/nodes/signals` | Server-sent worker signals |

pub mod dispatch;
pub mod hub;
pub mod logs;
pub mod registry;
pub mod server;

pub use dispatch::Dispatcher;
pub use hub::SignalHub;
pub use logs::{LogReceiver, NodeLogRecord};
pub use registry::{Registry, Snapshot, Transfer};
pub use server::{ControlServer, ControlState, build_router};
