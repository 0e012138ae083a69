//! Minimal HTTP/1 client over hyper.
//!
//! One TCP connection per request, the way a probe would do it. The
//! control plane is low-traffic, so there is no pooling.

use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, USER_AGENT};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{LinkError, LinkResult};

const AGENT: &str = concat!("warden/", env!("CARGO_PKG_VERSION"));

/// Client bound to a single `host:port`.
#[derive(Debug, Clone)]
pub struct HttpClient {
    addr: String,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.addr
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Open a connection and send `req`, returning the streaming response.
    async fn send(&self, req: Request<Full<Bytes>>) -> LinkResult<Response<Incoming>> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| LinkError::Connect {
                addr: self.addr.clone(),
                source,
            })?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

        // Drive the connection in the background.
        let addr = self.addr.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, %addr, "connection closed with error");
            }
        });

        Ok(sender.send_request(req).await?)
    }

    fn build(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> LinkResult<Request<Full<Bytes>>> {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("http://{}{}", self.addr, path))
            .header(HOST, &self.addr)
            .header(USER_AGENT, AGENT);
        if let Some(h) = builder.headers_mut() {
            h.extend(headers);
        }
        Ok(builder.body(Full::new(body))?)
    }

    /// Send a request and collect the whole response, within the timeout.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> LinkResult<(StatusCode, Bytes)> {
        let req = self.build(method, path, headers, body)?;
        let exchange = async {
            let resp = self.send(req).await?;
            let status = resp.status();
            let bytes = resp.into_body().collect().await?.to_bytes();
            Ok::<_, LinkError>((status, bytes))
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| LinkError::Timeout {
                path: path.to_string(),
                after: self.timeout,
            })?
    }

    /// Send a request and fail on any non-2xx status.
    pub async fn expect_success(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> LinkResult<Bytes> {
        let (status, bytes) = self.request(method, path, headers, body).await?;
        if !status.is_success() {
            return Err(LinkError::Status {
                path: path.to_string(),
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(bytes)
    }

    /// POST a JSON body and decode a JSON reply.
    pub async fn post_json<T, R>(&self, path: &str, body: &T) -> LinkResult<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let bytes = self
            .expect_success(Method::POST, path, json_headers(), serde_json::to_vec(body)?.into())
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// POST a JSON body, ignoring the reply body.
    pub async fn post<T>(&self, path: &str, body: &T) -> LinkResult<()>
    where
        T: Serialize + ?Sized,
    {
        self.expect_success(Method::POST, path, json_headers(), serde_json::to_vec(body)?.into())
            .await?;
        Ok(())
    }

    /// GET and decode a JSON reply.
    pub async fn get_json<R: DeserializeOwned>(&self, path: &str) -> LinkResult<R> {
        let bytes = self
            .expect_success(Method::GET, path, HeaderMap::new(), Bytes::new())
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// GET a long-lived response; only connecting is bounded by the timeout.
    pub async fn open_stream(&self, path: &str) -> LinkResult<Incoming> {
        let req = self.build(Method::GET, path, HeaderMap::new(), Bytes::new())?;
        let resp = tokio::time::timeout(self.timeout, self.send(req))
            .await
            .map_err(|_| LinkError::Timeout {
                path: path.to_string(),
                after: self.timeout,
            })??;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.into_body().collect().await?.to_bytes();
            return Err(LinkError::Status {
                path: path.to_string(),
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(resp.into_body())
    }
}

fn json_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, http::HeaderValue::from_static("application/json"));
    headers
}
