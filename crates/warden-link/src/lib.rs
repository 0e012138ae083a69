//! warden-link — HTTP links between Warden processes.
//!
//! - [`ManagerLink`]: Worker → Manager (register, deregister, node
//!   status, archive upload).
//! - [`NodeClient`]: Node → Worker (status, gather reports, and the
//!   signal stream).
//!
//! Both ride on [`HttpClient`], a one-connection-per-request hyper
//! client. Every failure is a [`LinkError`], which the Worker treats as
//! `WorkerError::NetworkUnavailable`.

pub mod client;
pub mod error;
pub mod manager;
pub mod node;

pub use client::HttpClient;
pub use error::{LinkError, LinkResult};
pub use manager::ManagerLink;
pub use node::{NodeClient, SignalStream};
