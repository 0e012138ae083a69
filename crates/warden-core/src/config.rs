//! Worker configuration (`worker.toml` and Manager overrides).
//!
//! ```toml
//! delete-temp-on-shutdown = true
//!
//! [worker]
//! allowed-failures = 10
//!
//! [worker.timeout]
//! node-creation = "20s"
//! info-request = "20s"
//! node-shutdown = "10s"
//! package-delivery = "100s"
//! archive-move = "10s"
//! archive-retry = "1s"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{WorkerError, WorkerResult};

pub const DEFAULT_ALLOWED_FAILURES: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct WorkerConfig {
    /// Remove the Worker's temporary directory on shutdown.
    #[serde(default = "default_true")]
    pub delete_temp_on_shutdown: bool,
    #[serde(default)]
    pub worker: WorkerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct WorkerSection {
    /// Retry budget shared by every handshake, gather and save wait.
    #[serde(default = "default_allowed_failures")]
    pub allowed_failures: u32,
    #[serde(default)]
    pub timeout: TimeoutSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct TimeoutSection {
    /// Wait for a freshly started Node to report `init`.
    #[serde(default = "default_node_creation", with = "duration_str")]
    pub node_creation: Duration,
    /// Wait for a single status round trip (ready, connected, gather, save).
    #[serde(default = "default_info_request", with = "duration_str")]
    pub info_request: Duration,
    /// Grace period for a Node to exit after a shutdown request.
    #[serde(default = "default_node_shutdown", with = "duration_str")]
    pub node_shutdown: Duration,
    /// Wait for a package archive sent by the Manager to arrive.
    #[serde(default = "default_package_delivery", with = "duration_str")]
    pub package_delivery: Duration,
    /// Upper bound on retrying a local archive move.
    #[serde(default = "default_archive_move", with = "duration_str")]
    pub archive_move: Duration,
    /// Delay between archive move attempts.
    #[serde(default = "default_archive_retry", with = "duration_str")]
    pub archive_retry: Duration,
}

fn default_true() -> bool {
    true
}

fn default_allowed_failures() -> u32 {
    DEFAULT_ALLOWED_FAILURES
}

fn default_node_creation() -> Duration {
    Duration::from_secs(20)
}

fn default_info_request() -> Duration {
    Duration::from_secs(20)
}

fn default_node_shutdown() -> Duration {
    Duration::from_secs(10)
}

fn default_package_delivery() -> Duration {
    Duration::from_secs(100)
}

fn default_archive_move() -> Duration {
    Duration::from_secs(10)
}

fn default_archive_retry() -> Duration {
    Duration::from_secs(1)
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            node_creation: default_node_creation(),
            info_request: default_info_request(),
            node_shutdown: default_node_shutdown(),
            package_delivery: default_package_delivery(),
            archive_move: default_archive_move(),
            archive_retry: default_archive_retry(),
        }
    }
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            allowed_failures: DEFAULT_ALLOWED_FAILURES,
            timeout: TimeoutSection::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            delete_temp_on_shutdown: true,
            worker: WorkerSection::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &Path) -> WorkerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> WorkerResult<Self> {
        toml::from_str(content).map_err(|e| WorkerError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> WorkerResult<String> {
        toml::to_string_pretty(self).map_err(|e| WorkerError::Config(e.to_string()))
    }

    /// Retry budget, never below one attempt.
    pub fn allowed_failures(&self) -> u32 {
        self.worker.allowed_failures.max(1)
    }

    pub fn timeouts(&self) -> &TimeoutSection {
        &self.worker.timeout
    }

    /// Apply a single dotted option. Returns `Ok(false)` for keys this
    /// Worker does not recognise.
    pub fn set(&mut self, key: &str, value: &serde_json::Value) -> WorkerResult<bool> {
        let timeouts = &mut self.worker.timeout;
        let slot = match key {
            "worker.allowed-failures" => {
                self.worker.allowed_failures = value
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| invalid(key, value))?;
                return Ok(true);
            }
            "delete-temp-on-shutdown" => {
                self.delete_temp_on_shutdown = value.as_bool().ok_or_else(|| invalid(key, value))?;
                return Ok(true);
            }
            "worker.timeout.node-creation" => &mut timeouts.node_creation,
            "worker.timeout.info-request" => &mut timeouts.info_request,
            "worker.timeout.node-shutdown" => &mut timeouts.node_shutdown,
            "worker.timeout.package-delivery" => &mut timeouts.package_delivery,
            "worker.timeout.archive-move" => &mut timeouts.archive_move,
            "worker.timeout.archive-retry" => &mut timeouts.archive_retry,
            _ => return Ok(false),
        };
        *slot = duration_from_json(value).ok_or_else(|| invalid(key, value))?;
        Ok(true)
    }

    /// Apply the option map returned by the Manager on registration.
    ///
    /// Every valid entry is applied even when others are rejected; the
    /// rejected keys are reported together.
    pub fn apply_overrides(
        &mut self,
        overrides: &serde_json::Map<String, serde_json::Value>,
    ) -> WorkerResult<usize> {
        let mut applied = 0;
        let mut rejected = Vec::new();

        for (key, value) in overrides {
            match self.set(key, value) {
                Ok(true) => applied += 1,
                Ok(false) => debug!(%key, "ignoring unknown config override"),
                Err(_) => rejected.push(key.as_str()),
            }
        }

        if rejected.is_empty() {
            Ok(applied)
        } else {
            Err(WorkerError::Config(format!(
                "invalid override value for {}",
                rejected.join(", ")
            )))
        }
    }
}

fn invalid(key: &str, value: &serde_json::Value) -> WorkerError {
    WorkerError::Config(format!("invalid value for {key}: {value}"))
}

fn duration_from_json(value: &serde_json::Value) -> Option<Duration> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().and_then(secs_to_duration),
        serde_json::Value::String(s) => parse_duration(s),
        _ => None,
    }
}

fn secs_to_duration(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

/// Parse a duration string like "5s", "500ms", "2m", or "1.5".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<f64>().ok().and_then(secs_to_duration)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<f64>().ok().and_then(secs_to_duration)
    }
}

/// Render a duration the way [`parse_duration`] reads it back.
pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 && d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(f64),
            Text(String),
        }

        match Raw::deserialize(d)? {
            Raw::Secs(secs) => super::secs_to_duration(secs)
                .ok_or_else(|| D::Error::custom(format!("invalid duration: {secs}"))),
            Raw::Text(text) => super::parse_duration(&text)
                .ok_or_else(|| D::Error::custom(format!("invalid duration: {text}"))),
        }
    }
}
