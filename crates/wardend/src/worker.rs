//! The blocking Worker facade.
//!
//! Every method may be called from any thread except the loop thread.
//! Each hands a future to the [`EventLoop`] and blocks until it finishes
//! or its deadline passes; nothing here touches Worker state directly.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use warden_core::*;
use warden_node::{NodeExit, NodeLauncher, ProcessLauncher};

use crate::archive::Delivery;
use crate::event_loop::EventLoop;
use crate::worker_core::{WorkerCore, WorkerOptions};

/// Extra time a bridged call waits beyond the operation's own budget.
const BRIDGE_SLACK: Duration = Duration::from_secs(5);
/// Interval at which [`Worker::idle`] checks for shutdown.
const IDLE_POLL: Duration = Duration::from_millis(200);
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Builder for [`Worker`].
pub struct WorkerBuilder {
    name: String,
    id: Option<Uuid>,
    host: String,
    port: u16,
    config: WorkerConfig,
    temp_root: Option<PathBuf>,
    log_level: String,
    launcher: Option<Arc<dyn NodeLauncher>>,
    delivery: Delivery,
}

impl WorkerBuilder {
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Interface to bind on; defaults to all interfaces.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Parent directory of the Worker's temporary storage.
    pub fn temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(root.into());
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// How Nodes are brought up; defaults to [`ProcessLauncher`].
    pub fn launcher(mut self, launcher: Arc<dyn NodeLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// How results reach a connected Manager on collect.
    pub fn delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    /// Start the loop thread and the Worker's servers on it.
    pub fn build(self) -> WorkerResult<Worker> {
        let options = WorkerOptions {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            name: self.name,
            host: self.host,
            port: self.port,
            config: self.config,
            temp_root: self.temp_root.unwrap_or_else(std::env::temp_dir),
            log_level: self.log_level,
            launcher: self
                .launcher
                .unwrap_or_else(|| Arc::new(ProcessLauncher::default())),
            delivery: self.delivery,
        };

        let event_loop = EventLoop::start(&options.name)?;
        let core = event_loop.run(WorkerCore::start(options), STARTUP_TIMEOUT)??;
        Ok(Worker { core, event_loop })
    }
}

/// A Worker: supervises Nodes and answers its Manager.
pub struct Worker {
    core: Arc<WorkerCore>,
    event_loop: EventLoop,
}

impl Worker {
    pub fn builder(name: impl Into<String>) -> WorkerBuilder {
        WorkerBuilder {
            name: name.into(),
            id: None,
            host: "0.0.0.0".to_string(),
            port: 0,
            config: WorkerConfig::default(),
            temp_root: None,
            log_level: "info".to_string(),
            launcher: None,
            delivery: Delivery::Auto,
        }
    }

    /// A Worker with default settings that launches Nodes as processes.
    pub fn new(name: impl Into<String>) -> WorkerResult<Self> {
        Self::builder(name).build()
    }

    pub fn id(&self) -> Uuid {
        self.core.id()
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// `host:port` of the control server.
    pub fn address(&self) -> String {
        self.core.state().address()
    }

    pub fn state(&self) -> WorkerState {
        self.core.state()
    }

    pub fn config(&self) -> WorkerConfig {
        self.core.config()
    }

    pub fn temp_dir(&self) -> &Path {
        self.core.temp_dir()
    }

    pub fn data_dir(&self) -> &Path {
        self.core.data_dir()
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    pub fn has_shutdown(&self) -> bool {
        self.core.has_shutdown()
    }

    fn bridge<F, T>(&self, what: &str, fut: F, timeout: Duration) -> Option<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        match self.event_loop.run(fut, timeout) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(operation = %what, error = %e, "bridged call failed");
                None
            }
        }
    }

    /// Time to give one wait-on-every-node operation.
    fn per_node_budget(&self) -> Duration {
        let config = self.core.config();
        let nodes = self.core.state().nodes.len().max(1) as u32;
        config
            .timeouts()
            .info_request
            .saturating_mul(config.allowed_failures())
            .saturating_mul(nodes)
            .saturating_add(BRIDGE_SLACK)
    }

    /// Register with the Manager at `host:port`. Never fails loudly.
    pub fn connect(&self, host: &str, port: u16, timeout: Duration) -> bool {
        let core = self.core.clone();
        let host = host.to_string();
        self.bridge(
            "connect",
            async move { core.connect(&host, port, timeout).await },
            timeout.saturating_add(BRIDGE_SLACK),
        )
        .unwrap_or(false)
    }

    /// Create a Node and wait for it to become ready.
    pub fn create_node(&self, spec: NodeSpec) -> bool {
        let core = self.core.clone();
        let budget = core.handshake().budget().saturating_add(BRIDGE_SLACK);
        self.bridge(
            "create_node",
            async move { core.create_node(spec).await.0 },
            budget,
        )
        .unwrap_or(false)
    }

    fn broadcast(&self, signal: WorkerSignal) {
        let core = self.core.clone();
        self.event_loop.spawn(async move { core.broadcast(signal) });
    }

    pub fn step(&self) {
        self.broadcast(WorkerSignal::Step);
    }

    pub fn start_nodes(&self) {
        self.broadcast(WorkerSignal::StartNodes);
    }

    pub fn stop_nodes(&self) {
        self.broadcast(WorkerSignal::StopNodes);
    }

    /// One [`DataChunk`] per registered Node.
    pub fn gather(&self) -> GatherResult {
        let core = self.core.clone();
        let budget = self.per_node_budget();
        let id = self.id();
        let nodes = self.state().nodes;
        self.bridge("gather", async move { core.gather().await }, budget)
            .unwrap_or_else(|| GatherResult {
                id,
                node_data: nodes.into_keys().map(|n| (n, DataChunk::default())).collect(),
            })
    }

    pub fn request_saving(&self) -> bool {
        let core = self.core.clone();
        let budget = self.per_node_budget();
        self.bridge("request_saving", async move { core.request_saving().await }, budget)
            .unwrap_or(false)
    }

    /// Relay the Manager's peer map to the Nodes.
    pub fn distribute_server_data(&self, data: NodeServerData) -> bool {
        let core = self.core.clone();
        let budget = self.per_node_budget();
        self.bridge(
            "distribute_server_data",
            async move { core.distribute_server_data(data).await },
            budget,
        )
        .unwrap_or(false)
    }

    pub fn load_packages(&self, packages: Vec<String>) -> bool {
        let core = self.core.clone();
        let budget = self
            .core
            .config()
            .timeouts()
            .package_delivery
            .saturating_add(BRIDGE_SLACK);
        self.bridge(
            "load_packages",
            async move { core.load_packages(&packages).await },
            budget,
        )
        .unwrap_or(false)
    }

    /// Move or send the Worker's results to `dest`.
    ///
    /// Errors only when a local move stays stuck past `archive-move`.
    pub fn collect(&self, dest: impl Into<PathBuf>) -> WorkerResult<bool> {
        let core = self.core.clone();
        let dest = dest.into();
        let config = self.core.config();
        let budget = config
            .timeouts()
            .archive_move
            .saturating_add(config.timeouts().package_delivery)
            .saturating_add(BRIDGE_SLACK);
        self.event_loop
            .run(async move { core.collect(&dest).await }, budget)?
    }

    pub fn node_exit(&self, id: &str) -> Option<NodeExit> {
        let core = self.core.clone();
        let id = id.to_string();
        self.bridge("node_exit", async move { core.node_exit(&id).await }, BRIDGE_SLACK)
            .flatten()
    }

    /// Deregister, stop serving, stop every Node and clean up.
    ///
    /// Safe to call any number of times.
    pub fn shutdown(&self) {
        if self.core.has_shutdown() {
            return;
        }
        let core = self.core.clone();
        let nodes = self.state().nodes.len() as u32 + 1;
        let budget = self
            .core
            .config()
            .timeouts()
            .node_shutdown
            .saturating_mul(nodes)
            .saturating_add(BRIDGE_SLACK * 2);
        self.bridge("shutdown", async move { core.shutdown().await }, budget);
    }

    /// Block until the Worker has shut down.
    pub fn idle(&self) {
        while !self.core.has_shutdown() {
            std::thread::sleep(IDLE_POLL);
        }
    }

    /// Shut the Worker down on Ctrl-C.
    pub fn shutdown_on_ctrl_c(&self) {
        let core = self.core.clone();
        self.event_loop.spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for ctrl-c");
                return;
            }
            info!("interrupt received");
            core.shutdown().await;
        });
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
        self.event_loop.stop();
    }
}
