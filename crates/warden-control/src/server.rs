//! Axum routes for Manager requests and Node reports.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Component, Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use warden_core::*;

use crate::dispatch::Dispatcher;
use crate::hub::SignalHub;
use crate::registry::Registry;

/// Shared state for control handlers.
#[derive(Clone)]
pub struct ControlState {
    pub dispatcher: Arc<dyn Dispatcher>,
    pub registry: Registry,
    pub hub: SignalHub,
    /// Where files delivered over `PUT /files/{name}` are written.
    pub files_dir: PathBuf,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ControlState {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        registry: Registry,
        hub: SignalHub,
        files_dir: PathBuf,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            dispatcher,
            registry,
            hub,
            files_dir,
            shutdown: Arc::new(shutdown),
        }
    }
}

/// Build the control router.
pub fn build_router(state: ControlState) -> Router {
    Router::new()
        .route("/nodes/create", post(create_node))
        .route("/nodes/server_data", get(report_server_data).post(server_data_broadcast))
        .route("/nodes/step", post(step))
        .route("/nodes/start", post(start_nodes))
        .route("/nodes/stop", post(stop_nodes))
        .route("/nodes/save", post(request_saving))
        .route("/nodes/gather", get(request_gather))
        .route("/nodes/collect", post(collect))
        .route("/packages/load", post(load_packages))
        .route("/shutdown", post(shutdown))
        .route("/nodes/status", post(node_status))
        .route("/nodes/gather/report", post(node_gather_report))
        .route("/nodes/signals", get(node_signals))
        .route(
            "/files/{name}",
            put(receive_file).layer(DefaultBodyLimit::disable()),
        )
        .with_state(state)
}

/// A running control server.
pub struct ControlServer {
    addr: SocketAddr,
    state: ControlState,
    handle: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Bind on `host:port` (port 0 picks a free port) and start serving.
    pub async fn bind(host: &str, port: u16, state: ControlState) -> WorkerResult<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        let addr = listener.local_addr()?;
        let router = build_router(state.clone());
        let stop = state.shutdown.subscribe();

        info!(%addr, "control server listening");

        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(stopped(stop));
            if let Err(e) = server.await {
                error!(error = %e, "control server error");
            }
        });

        Ok(Self {
            addr,
            state,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> &ControlState {
        &self.state
    }

    /// Stop accepting requests and wait up to `grace` for in-flight ones.
    ///
    /// Signal streams are closed first so they cannot hold the server open.
    pub async fn stop(&mut self, grace: Duration) {
        self.state.shutdown.send_replace(true);
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            warn!(?grace, "control server did not drain in time, aborting");
            handle.abort();
        }
        info!(addr = %self.addr, "control server stopped");
    }
}

/// Resolves once the server has been told to stop.
async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

// ── Replies ────────────────────────────────────────────────────

fn ok() -> Response {
    Json(json!({ "success": true })).into_response()
}

fn reply_response(reply: ControlReply) -> Response {
    match reply {
        ControlReply::Ack => ok(),
        ControlReply::NodeCreated {
            success,
            node_state,
        } => Json(json!({ "success": success, "node_state": node_state })).into_response(),
        ControlReply::ServerData {
            success,
            node_server_data,
        } => Json(json!({ "success": success, "node_server_data": node_server_data }))
            .into_response(),
        ControlReply::ServerDataDistributed {
            success,
            worker_state,
        } => Json(json!({ "success": success, "worker_state": worker_state })).into_response(),
        ControlReply::PackagesLoaded { success: true } => ok(),
        ControlReply::PackagesLoaded { success: false } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false })),
        )
            .into_response(),
        ControlReply::Saved { success } => Json(json!({ "success": success })).into_response(),
        ControlReply::Gathered(result) => Json(result).into_response(),
        ControlReply::Collected { id, success } => {
            Json(json!({ "id": id, "success": success })).into_response()
        }
    }
}

async fn dispatch(state: &ControlState, request: ControlRequest) -> Response {
    reply_response(state.dispatcher.dispatch(request).await)
}

// ── Manager → Worker ───────────────────────────────────────────

/// POST /nodes/create
async fn create_node(State(state): State<ControlState>, Json(spec): Json<NodeSpec>) -> Response {
    dispatch(&state, ControlRequest::CreateNode(spec)).await
}

/// GET /nodes/server_data
async fn report_server_data(State(state): State<ControlState>) -> Response {
    dispatch(&state, ControlRequest::ReportServerData).await
}

/// POST /nodes/server_data
async fn server_data_broadcast(
    State(state): State<ControlState>,
    Json(data): Json<NodeServerData>,
) -> Response {
    dispatch(&state, ControlRequest::ServerDataBroadcast(data)).await
}

async fn step(State(state): State<ControlState>) -> Response {
    dispatch(&state, ControlRequest::Step).await
}

async fn start_nodes(State(state): State<ControlState>) -> Response {
    dispatch(&state, ControlRequest::StartNodes).await
}

async fn stop_nodes(State(state): State<ControlState>) -> Response {
    dispatch(&state, ControlRequest::StopNodes).await
}

async fn request_saving(State(state): State<ControlState>) -> Response {
    dispatch(&state, ControlRequest::RequestSaving).await
}

/// GET /nodes/gather
async fn request_gather(State(state): State<ControlState>) -> Response {
    dispatch(&state, ControlRequest::RequestGather).await
}

/// POST /nodes/collect
async fn collect(
    State(state): State<ControlState>,
    Json(req): Json<CollectRequest>,
) -> Response {
    dispatch(&state, ControlRequest::Collect { path: req.path }).await
}

/// POST /packages/load
async fn load_packages(
    State(state): State<ControlState>,
    Json(req): Json<LoadPackagesRequest>,
) -> Response {
    dispatch(
        &state,
        ControlRequest::LoadPackages {
            packages: req.packages,
        },
    )
    .await
}

/// POST /shutdown
async fn shutdown(State(state): State<ControlState>) -> Response {
    dispatch(&state, ControlRequest::Shutdown).await
}

/// PUT /files/{name}
async fn receive_file(
    State(state): State<ControlState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    if !is_plain_file_name(&name) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "invalid file name" })),
        )
            .into_response();
    }

    let path = state.files_dir.join(&name);
    let registry = &state.registry;
    let stored = async {
        registry.record_transfer(&name, path.clone(), false).await?;
        tokio::fs::create_dir_all(&state.files_dir).await?;
        tokio::fs::write(&path, &body).await?;
        registry.record_transfer(&name, path.clone(), true).await
    }
    .await;

    match stored {
        Ok(()) => {
            debug!(%name, bytes = body.len(), "file received");
            ok()
        }
        Err(e) => {
            warn!(%name, error = %e, "failed to store delivered file");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

fn is_plain_file_name(name: &str) -> bool {
    let mut components = FsPath::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

// ── Node → Worker ──────────────────────────────────────────────

async fn accept_report(state: &ControlState, report: NodeReport) -> Response {
    if state.dispatcher.report(report).await {
        ok()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": "unknown node or stale incarnation" })),
        )
            .into_response()
    }
}

/// POST /nodes/status
async fn node_status(
    State(state): State<ControlState>,
    Json(node): Json<NodeState>,
) -> Response {
    accept_report(&state, NodeReport::Status(node)).await
}

/// POST /nodes/gather/report
async fn node_gather_report(
    State(state): State<ControlState>,
    Json(report): Json<NodeGatherReport>,
) -> Response {
    accept_report(&state, report.into()).await
}

/// GET /nodes/signals
///
/// Server-sent events, one per [`WorkerSignal`]. The stream ends after a
/// `shutdown` event or when the server stops.
async fn node_signals(
    State(state): State<ControlState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut signals = state.hub.subscribe();
    let stop = stopped(state.shutdown.subscribe());
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(16);

    tokio::spawn(async move {
        tokio::pin!(stop);
        loop {
            tokio::select! {
                received = signals.recv() => match received {
                    Ok(signal) => {
                        let last = matches!(signal, WorkerSignal::Shutdown);
                        let event = match Event::default().event(signal.event_name()).json_data(&signal) {
                            Ok(event) => event,
                            Err(e) => {
                                warn!(error = %e, "failed to encode signal");
                                continue;
                            }
                        };
                        if tx.send(Ok(event)).await.is_err() || last {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "node signal stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = &mut stop => break,
            }
        }
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}
