//! Scripted nodes and a fake Manager for Worker integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use serde_json::{Map, Value, json};
use tokio::task::JoinHandle;

use warden_core::*;
use warden_link::NodeClient;
use warden_node::{NodeConfig, NodeError, NodeExit, NodeHandle, NodeLauncher, NodeResult};
use wardend::{Delivery, Worker};

/// How a scripted node behaves in one creation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Reports init and ready, then answers every signal.
    Ready,
    /// Starts but never reports anything.
    Never,
    /// Reports init but never ready.
    InitOnly,
    /// Becomes ready but ignores gather and saving requests.
    ReadySilent,
    /// Becomes ready, then ignores every signal and shutdown request;
    /// only `terminate` stops it.
    Stubborn,
}

/// Hands out scripted nodes; each attempt takes the next behavior
/// queued for the node id, falling back to the default.
pub struct ScriptedLauncher {
    scripts: Mutex<HashMap<NodeId, VecDeque<Behavior>>>,
    fallback: Behavior,
    launches: AtomicUsize,
    terminations: Arc<AtomicUsize>,
}

impl ScriptedLauncher {
    pub fn new(fallback: Behavior) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            fallback,
            launches: AtomicUsize::new(0),
            terminations: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn script(&self, id: &str, behaviors: impl IntoIterator<Item = Behavior>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(id.to_string(), behaviors.into_iter().collect());
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// How many times any node had to be killed.
    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

impl NodeLauncher for ScriptedLauncher {
    fn launch(&self, spec: &NodeSpec) -> NodeResult<Box<dyn NodeHandle>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&spec.id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(self.fallback);
        Ok(Box::new(FakeNode {
            id: spec.id.clone(),
            behavior,
            config: None,
            task: None,
            exited: false,
            terminations: self.terminations.clone(),
        }))
    }
}

struct FakeNode {
    id: NodeId,
    behavior: Behavior,
    config: Option<NodeConfig>,
    task: Option<JoinHandle<()>>,
    exited: bool,
    terminations: Arc<AtomicUsize>,
}

#[async_trait]
impl NodeHandle for FakeNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn configure(&mut self, config: NodeConfig) -> NodeResult<()> {
        if self.config.is_some() {
            return Err(NodeError::AlreadyConfigured(self.id.clone()));
        }
        self.config = Some(config);
        Ok(())
    }

    async fn start(&mut self) -> NodeResult<()> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| NodeError::NotConfigured(self.id.clone()))?;
        let client = NodeClient::new(&config.worker_address, self.id.clone(), config.incarnation);
        let payload = chunk_from(&config.topology.payload);
        self.task = Some(tokio::spawn(run_node(client, self.behavior, payload)));
        Ok(())
    }

    async fn shutdown(&mut self) -> NodeResult<()> {
        if self.behavior == Behavior::Stubborn {
            return Ok(());
        }
        if let Some(task) = &self.task {
            task.abort();
        }
        Ok(())
    }

    async fn terminate(&mut self) -> NodeResult<()> {
        if let Some(task) = &self.task {
            self.terminations.fetch_add(1, Ordering::SeqCst);
            task.abort();
        }
        Ok(())
    }

    async fn join(&mut self, timeout: Duration) -> NodeResult<NodeExit> {
        if self.exited {
            return Ok(NodeExit::Exited(0));
        }
        let Some(task) = self.task.as_mut() else {
            return Ok(NodeExit::NotStarted);
        };
        match tokio::time::timeout(timeout, task).await {
            Ok(_) => {
                self.exited = true;
                Ok(NodeExit::Exited(0))
            }
            Err(_) => Ok(NodeExit::Running),
        }
    }

    fn try_exit(&mut self) -> NodeResult<NodeExit> {
        Ok(match &self.task {
            _ if self.exited => NodeExit::Exited(0),
            None => NodeExit::NotStarted,
            Some(task) if task.is_finished() => NodeExit::Exited(0),
            Some(_) => NodeExit::Running,
        })
    }
}

/// `{"gather": {...}}` in a spec payload becomes the node's gather answer.
fn chunk_from(payload: &Value) -> DataChunk {
    match payload.get("gather").and_then(Value::as_object) {
        Some(entries) => entries
            .iter()
            .fold(DataChunk::empty(), |chunk, (k, v)| chunk.with(k.clone(), v.clone())),
        None => DataChunk::empty(),
    }
}

async fn run_node(client: NodeClient, behavior: Behavior, payload: DataChunk) {
    match behavior {
        Behavior::Never => {
            std::future::pending::<()>().await;
        }
        Behavior::InitOnly => {
            let _ = client.report_init().await;
            std::future::pending::<()>().await;
        }
        Behavior::Ready | Behavior::ReadySilent | Behavior::Stubborn => {
            // Subscribe first so no signal sent after `ready` is missed.
            let Ok(mut signals) = client.signals().await else {
                return;
            };
            if client.report_init().await.is_err() || client.report_ready().await.is_err() {
                return;
            }
            while let Some(signal) = signals.next().await {
                if behavior == Behavior::Stubborn
                    || (behavior == Behavior::ReadySilent && signal != WorkerSignal::Shutdown)
                {
                    continue;
                }
                let answered = match signal {
                    WorkerSignal::RequestGather => client.report_gather(payload.clone()).await,
                    WorkerSignal::RequestSaving => {
                        let mut state = client.state();
                        state.finished = true;
                        client.report_status(state).await
                    }
                    WorkerSignal::ServerData(_) => {
                        let mut state = client.state();
                        state.connected = true;
                        client.report_status(state).await
                    }
                    WorkerSignal::Shutdown => break,
                    _ => Ok(()),
                };
                if answered.is_err() {
                    break;
                }
            }
            if behavior == Behavior::Stubborn {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Short timeouts so failing handshakes finish quickly.
pub fn fast_config(allowed_failures: u32) -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.worker.allowed_failures = allowed_failures;
    config.worker.timeout.node_creation = Duration::from_millis(500);
    config.worker.timeout.info_request = Duration::from_millis(500);
    config.worker.timeout.node_shutdown = Duration::from_millis(500);
    config.worker.timeout.package_delivery = Duration::from_millis(500);
    config.worker.timeout.archive_move = Duration::from_secs(2);
    config.worker.timeout.archive_retry = Duration::from_millis(50);
    config
}

pub fn worker(
    name: &str,
    launcher: Arc<ScriptedLauncher>,
    config: WorkerConfig,
    temp_root: &std::path::Path,
) -> Worker {
    worker_with_delivery(name, launcher, config, temp_root, Delivery::Auto)
}

pub fn worker_with_delivery(
    name: &str,
    launcher: Arc<ScriptedLauncher>,
    config: WorkerConfig,
    temp_root: &std::path::Path,
    delivery: Delivery,
) -> Worker {
    Worker::builder(name)
        .host("127.0.0.1")
        .config(config)
        .temp_root(temp_root)
        .launcher(launcher)
        .delivery(delivery)
        .build()
        .unwrap()
}

pub fn node(id: &str) -> NodeSpec {
    NodeSpec::new(id, id)
}

pub fn node_with_gather(id: &str, gather: Value) -> NodeSpec {
    let mut spec = node(id);
    spec.payload = json!({ "gather": gather });
    spec
}

/// Poll `check` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}

/// What the fake Manager has been told.
#[derive(Default)]
pub struct ManagerLog {
    pub registered: Vec<WorkerState>,
    pub deregistered: Vec<WorkerState>,
    pub statuses: Vec<NodeStatusUpdate>,
    pub archive_paths: Vec<String>,
}

#[derive(Clone)]
struct ManagerState {
    log: Arc<Mutex<ManagerLog>>,
    overrides: Arc<Map<String, Value>>,
}

/// An HTTP Manager on its own runtime, bound on `127.0.0.1:0`.
pub struct FakeManager {
    pub addr: SocketAddr,
    pub log: Arc<Mutex<ManagerLog>>,
    runtime: tokio::runtime::Runtime,
}

impl FakeManager {
    pub fn start(overrides: Value) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let log = Arc::new(Mutex::new(ManagerLog::default()));
        let state = ManagerState {
            log: log.clone(),
            overrides: Arc::new(overrides.as_object().cloned().unwrap_or_default()),
        };

        let router = Router::new()
            .route("/workers/register", post(register))
            .route("/workers/deregister", post(deregister))
            .route("/workers/node_status", post(node_status))
            .route("/workers/archive", post(archive))
            .with_state(state);

        let listener = runtime
            .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let addr = listener.local_addr().unwrap();
        runtime.spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { addr, log, runtime }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

async fn register(State(state): State<ManagerState>, Json(worker): Json<WorkerState>) -> Json<Value> {
    state.log.lock().unwrap().registered.push(worker);
    Json(Value::Object((*state.overrides).clone()))
}

async fn deregister(State(state): State<ManagerState>, Json(worker): Json<WorkerState>) -> Json<Value> {
    state.log.lock().unwrap().deregistered.push(worker);
    Json(json!({ "success": true }))
}

async fn node_status(
    State(state): State<ManagerState>,
    Json(update): Json<NodeStatusUpdate>,
) -> Json<Value> {
    state.log.lock().unwrap().statuses.push(update);
    Json(json!({ "success": true }))
}

async fn archive(State(state): State<ManagerState>, headers: HeaderMap, _body: Bytes) -> Json<Value> {
    let path = headers
        .get("x-archive-path")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.log.lock().unwrap().archive_paths.push(path);
    Json(json!({ "success": true }))
}

/// A port nothing is listening on.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
