//! The Node side of the control plane.
//!
//! A Node program uses [`NodeClient`] to push status and gather
//! reports to its Worker and to follow the Worker's signal stream.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use tracing::{debug, warn};

use warden_core::*;

use crate::error::LinkResult;
use crate::client::HttpClient;

/// Client a Node uses to talk to its Worker.
#[derive(Debug, Clone)]
pub struct NodeClient {
    http: HttpClient,
    node_id: NodeId,
    incarnation: u32,
}

impl NodeClient {
    /// `worker_address` is the `host:port` handed to the Node.
    pub fn new(worker_address: &str, node_id: impl Into<NodeId>, incarnation: u32) -> Self {
        let (host, port) = split_address(worker_address);
        Self {
            http: HttpClient::new(host, port, Duration::from_secs(10)),
            node_id: node_id.into(),
            incarnation,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// A status record for this node and incarnation with no flags set.
    pub fn state(&self) -> NodeState {
        let mut state = NodeState::new(self.node_id.clone());
        state.incarnation = self.incarnation;
        state
    }

    /// Push a status update; fields of `state` other than the flags,
    /// name and port are overwritten with this client's identity.
    pub async fn report_status(&self, mut state: NodeState) -> LinkResult<()> {
        state.id = self.node_id.clone();
        state.incarnation = self.incarnation;
        self.http.post("/nodes/status", &state).await
    }

    pub async fn report_init(&self) -> LinkResult<()> {
        let mut state = self.state();
        state.init = true;
        self.report_status(state).await
    }

    pub async fn report_ready(&self) -> LinkResult<()> {
        let mut state = self.state();
        state.init = true;
        state.ready = true;
        self.report_status(state).await
    }

    pub async fn report_gather(&self, payload: DataChunk) -> LinkResult<()> {
        let report = NodeGatherReport {
            state: self.state(),
            payload,
        };
        self.http.post("/nodes/gather/report", &report).await
    }

    /// Subscribe to the Worker's signal stream.
    ///
    /// Once this returns, every signal the Worker sends is delivered.
    pub async fn signals(&self) -> LinkResult<SignalStream> {
        let body = self.http.open_stream("/nodes/signals").await?;
        Ok(SignalStream {
            body,
            buf: BytesMut::new(),
        })
    }
}

fn split_address(address: &str) -> (&str, u16) {
    match address.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().unwrap_or(0)),
        None => (address, 0),
    }
}

/// Server-sent event stream of [`WorkerSignal`]s.
pub struct SignalStream {
    body: Incoming,
    buf: BytesMut,
}

impl SignalStream {
    /// Next signal, or `None` once the Worker closes the stream.
    pub async fn next(&mut self) -> Option<WorkerSignal> {
        loop {
            while let Some(event) = self.take_event() {
                if let Some(signal) = parse_event(&event) {
                    return Some(signal);
                }
            }

            match self.body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        self.buf.extend_from_slice(&data);
                    }
                }
                Some(Err(e)) => {
                    debug!(error = %e, "signal stream failed");
                    return None;
                }
                None => return None,
            }
        }
    }

    /// Split one complete event (terminated by a blank line) off the buffer.
    fn take_event(&mut self) -> Option<String> {
        let text = std::str::from_utf8(&self.buf).ok()?;
        let normalized_end = text
            .find("\n\n")
            .map(|i| (i, 2))
            .or_else(|| text.find("\r\n\r\n").map(|i| (i, 4)))?;
        let (end, sep) = normalized_end;
        let event = text[..end].to_string();
        self.buf.advance(end + sep);
        Some(event)
    }
}

/// Decode the `data:` lines of one event; comments and keep-alives yield `None`.
fn parse_event(event: &str) -> Option<WorkerSignal> {
    let data: Vec<&str> = event
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|d| d.strip_prefix(' ').unwrap_or(d))
        .collect();
    if data.is_empty() {
        return None;
    }
    match serde_json::from_str(&data.join("\n")) {
        Ok(signal) => Some(signal),
        Err(e) => {
            warn!(error = %e, "undecodable worker signal");
            None
        }
    }
}
