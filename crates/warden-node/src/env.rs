//! Environment handed to a Node process.
//!
//! [`ProcessNode`](crate::ProcessNode) writes these variables; a Node
//! program reads them back with [`NodeEnv::from_env`].

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{NodeError, NodeResult};
use crate::handle::NodeTopology;

pub const ENV_WORKER_ADDR: &str = "WARDEN_WORKER_ADDR";
pub const ENV_NODE_ID: &str = "WARDEN_NODE_ID";
pub const ENV_NODE_NAME: &str = "WARDEN_NODE_NAME";
pub const ENV_NODE_INCARNATION: &str = "WARDEN_NODE_INCARNATION";
pub const ENV_TEMP_DIR: &str = "WARDEN_TEMP_DIR";
pub const ENV_LOG_LEVEL: &str = "WARDEN_LOG_LEVEL";
pub const ENV_LOG_PORT: &str = "WARDEN_LOG_PORT";
pub const ENV_PACKAGE_PATH: &str = "WARDEN_PACKAGE_PATH";
pub const ENV_NODE_CONFIG: &str = "WARDEN_NODE_CONFIG";

/// A Node's view of its Worker, as read from its environment.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeEnv {
    pub worker_address: String,
    pub node_id: String,
    pub node_name: String,
    pub incarnation: u32,
    pub temp_dir: PathBuf,
    pub log_level: String,
    pub log_port: u16,
    pub package_path: Vec<PathBuf>,
    pub topology: NodeTopology,
}

impl NodeEnv {
    /// Read the current process environment.
    pub fn from_env() -> NodeResult<Self> {
        Self::from_vars(std::env::vars().collect())
    }

    pub fn from_vars(vars: HashMap<String, String>) -> NodeResult<Self> {
        let required = |key: &'static str| -> NodeResult<String> {
            vars.get(key).cloned().ok_or(NodeError::Environment(key))
        };

        let incarnation = required(ENV_NODE_INCARNATION)?
            .parse()
            .map_err(|_| NodeError::Environment(ENV_NODE_INCARNATION))?;

        let log_port = match vars.get(ENV_LOG_PORT) {
            Some(port) => port
                .parse()
                .map_err(|_| NodeError::Environment(ENV_LOG_PORT))?,
            None => 0,
        };

        let package_path = vars
            .get(ENV_PACKAGE_PATH)
            .filter(|p| !p.is_empty())
            .map(|p| std::env::split_paths(p).collect())
            .unwrap_or_default();

        let topology = match vars.get(ENV_NODE_CONFIG) {
            Some(json) => serde_json::from_str(json)
                .map_err(|_| NodeError::Environment(ENV_NODE_CONFIG))?,
            None => NodeTopology::default(),
        };

        let node_id = required(ENV_NODE_ID)?;
        Ok(Self {
            worker_address: required(ENV_WORKER_ADDR)?,
            node_name: vars.get(ENV_NODE_NAME).cloned().unwrap_or_else(|| node_id.clone()),
            node_id,
            incarnation,
            temp_dir: PathBuf::from(required(ENV_TEMP_DIR)?),
            log_level: vars
                .get(ENV_LOG_LEVEL)
                .cloned()
                .unwrap_or_else(|| "info".to_string()),
            log_port,
            package_path,
            topology,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> HashMap<String, String> {
        [
            (ENV_WORKER_ADDR, "127.0.0.1:9000"),
            (ENV_NODE_ID, "n1"),
            (ENV_NODE_INCARNATION, "2"),
            (ENV_TEMP_DIR, "/tmp/warden"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn minimal_environment() {
        let env = NodeEnv::from_vars(base()).unwrap();
        assert_eq!(env.node_id, "n1");
        assert_eq!(env.node_name, "n1");
        assert_eq!(env.incarnation, 2);
        assert_eq!(env.log_level, "info");
        assert!(env.package_path.is_empty());
        assert_eq!(env.topology, NodeTopology::default());
    }

    #[test]
    fn missing_worker_address() {
        let mut vars = base();
        vars.remove(ENV_WORKER_ADDR);
        assert!(matches!(
            NodeEnv::from_vars(vars),
            Err(NodeError::Environment(ENV_WORKER_ADDR))
        ));
    }

    #[test]
    fn topology_and_packages() {
        let mut vars = base();
        vars.insert(
            ENV_NODE_CONFIG.into(),
            r#"{"in_bound":["n0"],"out_bound":["n2"],"follow":"n0"}"#.into(),
        );
        vars.insert(ENV_PACKAGE_PATH.into(), "/a/x.zip:/b/y.zip".into());
        vars.insert(ENV_LOG_PORT.into(), "5555".into());

        let env = NodeEnv::from_vars(vars).unwrap();
        assert_eq!(env.topology.follow.as_deref(), Some("n0"));
        assert_eq!(env.topology.out_bound, vec!["n2".to_string()]);
        assert_eq!(env.package_path.len(), 2);
        assert_eq!(env.log_port, 5555);
    }

    #[test]
    fn bad_incarnation() {
        let mut vars = base();
        vars.insert(ENV_NODE_INCARNATION.into(), "first".into());
        assert!(NodeEnv::from_vars(vars).is_err());
    }
}
