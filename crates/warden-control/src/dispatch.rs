//! The seam between the control server and whatever acts on requests.

use async_trait::async_trait;

use warden_core::{ControlReply, ControlRequest, NodeReport};

/// Handles decoded control-plane traffic.
///
/// The server only translates between HTTP and these calls; all state
/// changes happen behind this trait.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    /// Handle a request from the Manager.
    async fn dispatch(&self, request: ControlRequest) -> ControlReply;

    /// Handle a report pushed by a Node. Returns `false` when the report
    /// was dropped (unknown node or stale incarnation).
    async fn report(&self, report: NodeReport) -> bool;
}
