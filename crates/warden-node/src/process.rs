//! Nodes backed by an OS child process.
//!
//! The Node's configuration reaches the child through its environment
//! (see [`crate::env`]); stdout and stderr are inherited so a Node's own
//! output lands next to the Worker's.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use warden_core::NodeSpec;

use crate::env::*;
use crate::error::{NodeError, NodeResult};
use crate::handle::{NodeConfig, NodeExit, NodeHandle, NodeLauncher};

/// Launches every Node as a child process running its spec's command.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher;

impl NodeLauncher for ProcessLauncher {
    fn check(&self, spec: &NodeSpec) -> NodeResult<()> {
        if spec.command.is_empty() {
            return Err(NodeError::EmptyCommand(spec.id.clone()));
        }
        Ok(())
    }

    fn launch(&self, spec: &NodeSpec) -> NodeResult<Box<dyn NodeHandle>> {
        Ok(Box::new(ProcessNode::new(spec.clone())?))
    }
}

/// A Node running as a child process.
pub struct ProcessNode {
    spec: NodeSpec,
    config: Option<NodeConfig>,
    child: Option<Child>,
    exit: Option<i32>,
}

impl ProcessNode {
    pub fn new(spec: NodeSpec) -> NodeResult<Self> {
        ProcessLauncher.check(&spec)?;
        Ok(Self {
            spec,
            config: None,
            child: None,
            exit: None,
        })
    }

    /// OS process id, while the child is known to be running.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    fn command(&self, config: &NodeConfig) -> NodeResult<Command> {
        let topology = serde_json::to_string(&config.topology)
            .map_err(|e| NodeError::Io(e.into()))?;
        let package_path = std::env::join_paths(&config.package_path)
            .map_err(|_| NodeError::Environment(ENV_PACKAGE_PATH))?;

        let mut cmd = Command::new(&self.spec.command[0]);
        cmd.args(&self.spec.command[1..])
            .env(ENV_WORKER_ADDR, &config.worker_address)
            .env(ENV_NODE_ID, &self.spec.id)
            .env(ENV_NODE_NAME, self.spec.display_name())
            .env(ENV_NODE_INCARNATION, config.incarnation.to_string())
            .env(ENV_TEMP_DIR, &config.temp_dir)
            .env(ENV_LOG_LEVEL, &config.logging_level)
            .env(ENV_LOG_PORT, config.logging_port.to_string())
            .env(ENV_PACKAGE_PATH, package_path)
            .env(ENV_NODE_CONFIG, topology)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        Ok(cmd)
    }

    fn record(&mut self, status: std::process::ExitStatus) -> NodeExit {
        let code = status.code().unwrap_or(-1);
        self.exit = Some(code);
        if code != 0 {
            debug!(node_id = %self.spec.id, code, "node process exited abnormally");
        }
        NodeExit::Exited(code)
    }
}

#[async_trait]
impl NodeHandle for ProcessNode {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn configure(&mut self, config: NodeConfig) -> NodeResult<()> {
        if self.config.is_some() {
            return Err(NodeError::AlreadyConfigured(self.spec.id.clone()));
        }
        self.config = Some(config);
        Ok(())
    }

    async fn start(&mut self) -> NodeResult<()> {
        if self.child.is_some() {
            return Err(NodeError::AlreadyStarted(self.spec.id.clone()));
        }
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| NodeError::NotConfigured(self.spec.id.clone()))?;

        let child = self
            .command(config)?
            .spawn()
            .map_err(|source| NodeError::Spawn {
                id: self.spec.id.clone(),
                source,
            })?;

        info!(node_id = %self.spec.id, pid = ?child.id(), "node process started");
        self.child = Some(child);
        Ok(())
    }

    async fn shutdown(&mut self) -> NodeResult<()> {
        if !matches!(self.try_exit()?, NodeExit::Running) {
            return Ok(());
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: `pid` comes from a child we spawned and have not yet
            // reaped, so it cannot have been recycled for another process.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                warn!(node_id = %self.spec.id, pid, "failed to deliver SIGTERM");
            }
        }

        #[cfg(not(unix))]
        child.start_kill()?;

        debug!(node_id = %self.spec.id, "shutdown requested");
        Ok(())
    }

    async fn terminate(&mut self) -> NodeResult<()> {
        if !matches!(self.try_exit()?, NodeExit::Running) {
            return Ok(());
        }
        if let Some(child) = self.child.as_mut() {
            match child.start_kill() {
                Ok(()) => warn!(node_id = %self.spec.id, "node process killed"),
                // Already exited between the check and the kill.
                Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn join(&mut self, timeout: Duration) -> NodeResult<NodeExit> {
        if let Some(code) = self.exit {
            return Ok(NodeExit::Exited(code));
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(NodeExit::NotStarted);
        };

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                Ok(self.record(status))
            }
            Err(_) => Ok(NodeExit::Running),
        }
    }

    fn try_exit(&mut self) -> NodeResult<NodeExit> {
        if let Some(code) = self.exit {
            return Ok(NodeExit::Exited(code));
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(NodeExit::NotStarted);
        };

        match child.try_wait()? {
            Some(status) => Ok(self.record(status)),
            None => Ok(NodeExit::Running),
        }
    }
}
