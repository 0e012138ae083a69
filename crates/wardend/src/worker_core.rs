//! The Worker's state on the loop thread.
//!
//! [`WorkerCore`] owns the registry, signal hub, supervisor and servers,
//! and answers every control request. It lives entirely on the loop
//! thread; the blocking [`Worker`](crate::Worker) facade only hands it
//! futures.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use warden_control::{ControlServer, ControlState, Dispatcher, LogReceiver, Registry, SignalHub};
use warden_core::config::TimeoutSection;
use warden_core::*;
use warden_link::ManagerLink;
use warden_node::{NodeConfig, NodeExit, NodeLauncher, NodeTopology};

use crate::archive::{self, Delivery};
use crate::gather::{self, Patience};
use crate::supervisor::{Handshake, NodeSupervisor};

/// How long the control server gets to finish in-flight requests.
const SERVER_DRAIN: Duration = Duration::from_secs(2);

/// Everything needed to bring a Worker up.
pub struct WorkerOptions {
    pub id: Uuid,
    pub name: String,
    /// Interface the control server and log receiver bind to.
    pub host: String,
    /// Control server port; 0 picks a free one.
    pub port: u16,
    pub config: WorkerConfig,
    /// Parent of the Worker's temporary directory.
    pub temp_root: PathBuf,
    /// Level handed to Nodes as their logging level.
    pub log_level: String,
    pub launcher: Arc<dyn NodeLauncher>,
    /// Move or upload on `collect` while connected.
    pub delivery: Delivery,
}

/// Host the Worker tells others to reach it on.
fn advertised_host(bind_host: &str) -> String {
    match bind_host.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() => "127.0.0.1".to_string(),
        _ => bind_host.to_string(),
    }
}

pub struct WorkerCore {
    this: Weak<WorkerCore>,
    id: Uuid,
    name: String,
    config: watch::Sender<WorkerConfig>,
    registry: Registry,
    hub: SignalHub,
    supervisor: NodeSupervisor,
    manager: watch::Sender<Option<ManagerLink>>,
    connected: AtomicBool,
    temp_dir: PathBuf,
    data_dir: PathBuf,
    files_dir: PathBuf,
    log_level: String,
    log_port: u16,
    delivery: Delivery,
    server: Mutex<Option<ControlServer>>,
    logs: Mutex<Option<LogReceiver>>,
    shutdown_started: AtomicBool,
    shutdown_done: watch::Sender<bool>,
}

impl WorkerCore {
    /// Create the temp layout, start the registry, the log receiver and
    /// the control server. Must run on the loop thread.
    pub async fn start(options: WorkerOptions) -> WorkerResult<Arc<Self>> {
        let WorkerOptions {
            id,
            name,
            host,
            port,
            config,
            temp_root,
            log_level,
            launcher,
            delivery,
        } = options;

        let temp_dir = temp_root.join(format!("warden-{id}"));
        let data_dir = temp_dir.join("data");
        let files_dir = temp_dir.join("files");
        tokio::fs::create_dir_all(&data_dir).await?;
        tokio::fs::create_dir_all(&files_dir).await?;

        let registry = Registry::spawn(WorkerState::new(id, name.clone()));
        let hub = SignalHub::default();
        let logs = LogReceiver::bind(&host).await?;
        let log_port = logs.port();

        let core = Arc::new_cyclic(|this| WorkerCore {
            this: this.clone(),
            id,
            name,
            config: watch::Sender::new(config),
            registry: registry.clone(),
            hub: hub.clone(),
            supervisor: NodeSupervisor::new(launcher, registry.clone()),
            manager: watch::Sender::new(None),
            connected: AtomicBool::new(false),
            temp_dir,
            data_dir,
            files_dir: files_dir.clone(),
            log_level,
            log_port,
            delivery,
            server: Mutex::new(None),
            logs: Mutex::new(Some(logs)),
            shutdown_started: AtomicBool::new(false),
            shutdown_done: watch::Sender::new(false),
        });

        let dispatcher: Arc<dyn Dispatcher> = core.clone();
        let state = ControlState::new(dispatcher, registry.clone(), hub, files_dir);
        let server = ControlServer::bind(&host, port, state).await?;
        let addr = server.local_addr();
        registry.set_address(advertised_host(&host), addr.port()).await?;
        *core.server.lock().await = Some(server);

        info!(
            worker_id = %core.id,
            name = %core.name,
            %addr,
            log_port,
            temp_dir = %core.temp_dir.display(),
            "worker started"
        );
        Ok(core)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> WorkerConfig {
        self.config.borrow().clone()
    }

    pub fn state(&self) -> WorkerState {
        self.registry.worker_state()
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Directory Nodes write their results into; the unit of `collect`.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Where files delivered by the Manager land.
    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn has_shutdown(&self) -> bool {
        *self.shutdown_done.borrow()
    }

    pub fn handshake(&self) -> Handshake {
        Handshake::from_config(&self.config.borrow())
    }

    fn patience(&self) -> Patience {
        Patience::from_config(&self.config.borrow())
    }

    fn timeouts(&self) -> TimeoutSection {
        self.config.borrow().timeouts().clone()
    }

    /// Register with the Manager and adopt its configuration overrides.
    pub async fn connect(&self, host: &str, port: u16, timeout: Duration) -> bool {
        let link = ManagerLink::new(host, port, timeout);
        let state = self.registry.worker_state();

        let overrides = match link.register(&state).await {
            Ok(overrides) => overrides,
            Err(e) => {
                warn!(manager = %link.address(), error = %e, "failed to register with manager");
                return false;
            }
        };

        if !overrides.is_empty() {
            self.config.send_modify(|config| {
                if let Some(applied) = config
                    .apply_overrides(&overrides)
                    .or_log("applying manager overrides")
                {
                    debug!(applied, "manager overrides applied");
                }
            });
        }
        self.manager.send_replace(Some(link));
        self.connected.store(true, Ordering::SeqCst);
        true
    }

    /// Run the creation handshake for `spec` and report the node's state.
    pub async fn create_node(&self, spec: NodeSpec) -> (bool, NodeState) {
        let snapshot = self.registry.snapshot();
        let base = NodeConfig {
            worker_address: snapshot.worker.address(),
            temp_dir: self.data_dir.clone(),
            topology: NodeTopology::default(),
            logging_level: self.log_level.clone(),
            logging_port: self.log_port,
            incarnation: 0,
            package_path: snapshot.package_path.clone(),
        };

        let success = self.supervisor.create(&spec, &base, self.handshake()).await;
        let node_state = self
            .registry
            .snapshot()
            .node(&spec.id)
            .cloned()
            .unwrap_or_else(|| NodeState::new(spec.id.clone()));
        (success, node_state)
    }

    /// Fire-and-forget broadcast to every Node.
    pub fn broadcast(&self, signal: WorkerSignal) {
        debug!(signal = signal.event_name(), "broadcasting to nodes");
        self.hub.send(signal);
    }

    pub async fn gather(&self) -> GatherResult {
        gather::gather(&self.registry, &self.hub, self.patience()).await
    }

    pub async fn request_saving(&self) -> bool {
        gather::request_saving(&self.registry, &self.hub, self.patience()).await
    }

    pub async fn distribute_server_data(&self, data: NodeServerData) -> bool {
        gather::distribute_server_data(&self.registry, &self.hub, self.patience(), data).await
    }

    pub async fn load_packages(&self, packages: &[String]) -> bool {
        let timeout = self.timeouts().package_delivery;
        gather::load_packages(&self.registry, packages, timeout).await
    }

    pub async fn node_exit(&self, id: &str) -> Option<NodeExit> {
        self.supervisor.exit_status(id).await
    }

    /// Hand the Worker's results over to the Manager.
    ///
    /// A co-located Manager (or none at all) gets the data directory moved
    /// to `<dest>/<name>-<id>`; a remote one gets it uploaded, unless the
    /// Worker was built with a fixed [`Delivery`]. Only a stuck local move
    /// is returned as an error.
    pub async fn collect(&self, dest: &Path) -> WorkerResult<bool> {
        let manager = self.manager.borrow().clone();
        let worker = self.registry.worker_state();

        let upload_to = match (manager, self.delivery) {
            (None, _) | (Some(_), Delivery::Move) => None,
            (Some(link), Delivery::Upload) => Some(link),
            (Some(link), Delivery::Auto) => {
                if archive::shares_machine(link.host(), &worker.host).await {
                    None
                } else {
                    Some(link)
                }
            }
        };

        if let Some(link) = upload_to {
            let timeout = self.timeouts().package_delivery;
            return Ok(match link.upload_archive(&worker, &self.data_dir, timeout).await {
                Ok(files) => {
                    info!(files, manager = %link.address(), "results sent to manager");
                    true
                }
                Err(e) => {
                    warn!(error = %e, "failed to send results, keeping temporary storage");
                    self.config
                        .send_modify(|config| config.delete_temp_on_shutdown = false);
                    false
                }
            });
        }

        let timeouts = self.timeouts();
        let final_name = format!("{}-{}", self.name, self.id);
        match archive::move_archive(
            &self.data_dir,
            dest,
            &final_name,
            timeouts.archive_retry,
            timeouts.archive_move,
        )
        .await
        {
            Ok(target) => {
                info!(target = %target.display(), "results collected");
                Ok(true)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(dest = %dest.display(), error = %e, "collect failed");
                Ok(false)
            }
        }
    }

    /// Tear the Worker down. Only the first call does the work; later
    /// callers wait for it to finish.
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            let mut done = self.shutdown_done.subscribe();
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
            return;
        }
        info!(worker_id = %self.id, "worker shutting down");

        if self.connected.swap(false, Ordering::SeqCst) {
            let link = self.manager.borrow().clone();
            if let Some(link) = link {
                let state = self.registry.worker_state();
                link.deregister(&state)
                    .await
                    .map_err(WorkerError::from)
                    .or_log("deregistering from manager");
            }
        }

        self.broadcast(WorkerSignal::Shutdown);
        let server = self.server.lock().await.take();
        if let Some(mut server) = server {
            server.stop(SERVER_DRAIN).await;
        }

        self.supervisor
            .shutdown_all(self.timeouts().node_shutdown)
            .await;

        let logs = self.logs.lock().await.take();
        if let Some(logs) = logs {
            logs.stop().await;
        }

        let delete_temp = self.config.borrow().delete_temp_on_shutdown;
        if delete_temp {
            match tokio::fs::remove_dir_all(&self.temp_dir).await {
                Ok(()) => debug!(path = %self.temp_dir.display(), "temporary storage removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %self.temp_dir.display(), error = %e, "failed to remove temporary storage");
                }
            }
        } else {
            info!(path = %self.temp_dir.display(), "keeping temporary storage");
        }

        self.registry.clear().await.or_log("clearing node registry");
        self.shutdown_done.send_replace(true);
        info!(worker_id = %self.id, "worker shut down");
    }

    /// Push a node's latest state to the Manager without waiting.
    fn forward_status(&self, node: NodeState) {
        if !self.is_connected() {
            return;
        }
        let Some(link) = self.manager.borrow().clone() else {
            return;
        };
        let worker_id = self.id;
        tokio::spawn(async move {
            link.push_status(worker_id, &node)
                .await
                .map_err(WorkerError::from)
                .or_log("forwarding node status");
        });
    }
}

#[async_trait]
impl Dispatcher for WorkerCore {
    async fn dispatch(&self, request: ControlRequest) -> ControlReply {
        match request {
            ControlRequest::CreateNode(spec) => {
                let (success, node_state) = self.create_node(spec).await;
                ControlReply::NodeCreated {
                    success,
                    node_state,
                }
            }
            ControlRequest::ReportServerData => ControlReply::ServerData {
                success: true,
                node_server_data: self.registry.worker_state().server_data(),
            },
            ControlRequest::ServerDataBroadcast(data) => {
                let success = self.distribute_server_data(data).await;
                ControlReply::ServerDataDistributed {
                    success,
                    worker_state: self.registry.worker_state(),
                }
            }
            ControlRequest::Step => {
                self.broadcast(WorkerSignal::Step);
                ControlReply::Ack
            }
            ControlRequest::StartNodes => {
                self.broadcast(WorkerSignal::StartNodes);
                ControlReply::Ack
            }
            ControlRequest::StopNodes => {
                self.broadcast(WorkerSignal::StopNodes);
                ControlReply::Ack
            }
            ControlRequest::LoadPackages { packages } => ControlReply::PackagesLoaded {
                success: self.load_packages(&packages).await,
            },
            ControlRequest::RequestSaving => ControlReply::Saved {
                success: self.request_saving().await,
            },
            ControlRequest::RequestGather => ControlReply::Gathered(self.gather().await),
            ControlRequest::Collect { path } => {
                let success = match self.collect(&path).await {
                    Ok(success) => success,
                    Err(e) => {
                        error!(dest = %path.display(), error = %e, "collect failed");
                        false
                    }
                };
                ControlReply::Collected {
                    id: self.id,
                    success,
                }
            }
            ControlRequest::Shutdown => {
                // Replying first lets the server drain this request.
                if let Some(core) = self.this.upgrade() {
                    tokio::spawn(async move { core.shutdown().await });
                }
                ControlReply::Ack
            }
        }
    }

    async fn report(&self, report: NodeReport) -> bool {
        match self.registry.report(report).await {
            Ok(Some(node)) => {
                self.forward_status(node);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "node report not applied");
                false
            }
        }
    }
}
