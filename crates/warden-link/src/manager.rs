//! Outbound calls from a Worker to its Manager.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method};
use serde_json::{Map, Value};
use tracing::{debug, info};
use walkdir::WalkDir;

use warden_core::*;

use crate::error::{LinkError, LinkResult};
use crate::client::HttpClient;

pub const HEADER_WORKER_ID: &str = "x-worker-id";
pub const HEADER_WORKER_NAME: &str = "x-worker-name";
pub const HEADER_ARCHIVE_PATH: &str = "x-archive-path";

/// Client for the Manager's worker-facing routes.
#[derive(Debug, Clone)]
pub struct ManagerLink {
    host: String,
    http: HttpClient,
}

impl ManagerLink {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            http: HttpClient::new(host, port, timeout),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// `host:port` of the Manager.
    pub fn address(&self) -> &str {
        self.http.address()
    }

    /// Register the Worker and return the Manager's config overrides.
    pub async fn register(&self, state: &WorkerState) -> LinkResult<Map<String, Value>> {
        let reply: Value = self.http.post_json("/workers/register", state).await?;
        info!(manager = %self.address(), worker_id = %state.id, "registered with manager");
        Ok(match reply {
            Value::Object(map) => map,
            _ => Map::new(),
        })
    }

    pub async fn deregister(&self, state: &WorkerState) -> LinkResult<()> {
        self.http.post("/workers/deregister", state).await?;
        info!(manager = %self.address(), worker_id = %state.id, "deregistered from manager");
        Ok(())
    }

    /// Forward a node's latest state upstream.
    pub async fn push_status(&self, worker_id: uuid::Uuid, node: &NodeState) -> LinkResult<()> {
        let update = NodeStatusUpdate {
            worker_id,
            node: node.clone(),
        };
        self.http.post("/workers/node_status", &update).await
    }

    /// Upload every file under `dir`, one request per file.
    ///
    /// Each file's path relative to `dir` travels in `x-archive-path`.
    /// Returns how many files were sent.
    pub async fn upload_archive(
        &self,
        state: &WorkerState,
        dir: &Path,
        timeout: Duration,
    ) -> LinkResult<usize> {
        let http = self.http.clone().with_timeout(timeout);
        let mut sent = 0;

        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| LinkError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(dir)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");

            let body = Bytes::from(tokio::fs::read(entry.path()).await?);
            let mut headers = HeaderMap::new();
            headers.insert(HEADER_WORKER_ID, header_value(&state.id.to_string()));
            headers.insert(HEADER_WORKER_NAME, header_value(&state.name));
            headers.insert(HEADER_ARCHIVE_PATH, header_value(&relative));

            debug!(path = %relative, bytes = body.len(), "uploading archive file");
            http.expect_success(Method::POST, "/workers/archive", headers, body)
                .await?;
            sent += 1;
        }

        info!(worker_id = %state.id, files = sent, "archive uploaded");
        Ok(sent)
    }
}

fn header_value(s: &str) -> HeaderValue {
    HeaderValue::from_str(s).unwrap_or_else(|_| HeaderValue::from_static("invalid"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::Json;
    use axum::Router;
    use axum::body::Bytes as AxumBytes;
    use axum::http::HeaderMap as AxumHeaders;
    use axum::routing::post;
    use serde_json::json;
    use uuid::Uuid;

    type Seen = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

    async fn fake_manager() -> (u16, Seen) {
        let seen: Seen = Arc::default();
        let archive_seen = seen.clone();

        let router = Router::new()
            .route(
                "/workers/register",
                post(|| async { Json(json!({"worker.allowed-failures": 3})) }),
            )
            .route("/workers/deregister", post(|| async { Json(json!({})) }))
            .route(
                "/workers/archive",
                post(move |headers: AxumHeaders, body: AxumBytes| {
                    let seen = archive_seen.clone();
                    async move {
                        let path = headers
                            .get(HEADER_ARCHIVE_PATH)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        seen.lock().unwrap().push((path, body.to_vec()));
                        Json(json!({"success": true}))
                    }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (port, seen)
    }

    fn state() -> WorkerState {
        WorkerState::new(Uuid::new_v4(), "w1")
    }

    #[tokio::test]
    async fn register_returns_overrides() {
        let (port, _) = fake_manager().await;
        let link = ManagerLink::new("127.0.0.1", port, Duration::from_secs(5));

        let overrides = link.register(&state()).await.unwrap();
        assert_eq!(overrides["worker.allowed-failures"], 3);
        link.deregister(&state()).await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_manager_is_a_connect_error() {
        // Bind and drop to find a port nothing listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let link = ManagerLink::new("127.0.0.1", port, Duration::from_secs(1));

        let err = link.register(&state()).await.unwrap_err();
        assert!(matches!(err, LinkError::Connect { .. }));
        assert!(matches!(
            WorkerError::from(err),
            WorkerError::NetworkUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn missing_route_is_a_status_error() {
        let (port, _) = fake_manager().await;
        let link = ManagerLink::new("127.0.0.1", port, Duration::from_secs(5));

        let err = link
            .push_status(Uuid::new_v4(), &NodeState::new("n1"))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Status { status, .. } if status == 404));
    }

    #[tokio::test]
    async fn archive_upload_sends_each_file() {
        let (port, seen) = fake_manager().await;
        let link = ManagerLink::new("127.0.0.1", port, Duration::from_secs(5));

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("n1")).unwrap();
        std::fs::write(dir.path().join("meta.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("n1/frames.bin"), b"0123").unwrap();

        let sent = link
            .upload_archive(&state(), dir.path(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(sent, 2);

        let seen = seen.lock().unwrap();
        let paths: Vec<&str> = seen.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["meta.json", "n1/frames.bin"]);
        assert_eq!(seen[1].1, b"0123");
    }
}
