//! wardend — the Warden worker.
//!
//! A Worker supervises a set of Node processes on one machine on behalf
//! of a remote Manager. It creates Nodes through an init/ready handshake
//! with whole-cycle retries, broadcasts control signals to them, gathers
//! their results and hands their output directory back to the Manager.
//!
//! The control plane runs on a single-threaded tokio runtime owned by a
//! dedicated thread; [`Worker`] is the blocking facade callers use from
//! any other thread.

pub mod archive;
pub mod event_loop;
pub mod gather;
pub mod supervisor;
pub mod worker;
pub mod worker_core;

pub use archive::Delivery;
pub use event_loop::EventLoop;
pub use supervisor::{Handshake, NodeSupervisor};
pub use worker::{Worker, WorkerBuilder};
pub use worker_core::{WorkerCore, WorkerOptions};
