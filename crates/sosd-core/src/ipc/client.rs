//! IPC client: typed calls to the admin API over the Unix socket, using
//! `hyper` HTTP/1.1.

use std::path::PathBuf;

use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;
use tracing::debug;

use super::types::*;

#[derive(Debug, thiserror::Error)]
pub enum IpcClientError {
    #[error("failed to connect to daemon socket at {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("daemon is not running (socket not found at {0})")]
    NotRunning(PathBuf),

    #[error("request failed: {0}")]
    Request(String),

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("daemon returned error: {0}")]
    DaemonError(String),
}

pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Whether the socket file exists (the daemon is likely running).
    pub fn daemon_available(&self) -> bool {
        self.socket_path.exists()
    }

    async fn request(&self, method: hyper::Method, path: &str) -> Result<Bytes, IpcClientError> {
        if !self.daemon_available() {
            return Err(IpcClientError::NotRunning(self.socket_path.clone()));
        }

        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| IpcClientError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake::<
            _,
            http_body_util::Empty<Bytes>,
        >(TokioIo::new(stream))
        .await
        .map_err(|e| IpcClientError::Request(format!("HTTP handshake failed: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::warn!(error = %e, "IPC connection error");
            }
        });

        debug!(%method, path, "IPC request");
        let req = hyper::Request::builder()
            .method(method)
            .uri(path)
            .header("host", "localhost")
            .body(http_body_util::Empty::new())
            .map_err(|e| IpcClientError::Request(format!("failed to build request: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| IpcClientError::Request(format!("request failed: {e}")))?;
        let status = resp.status();
        let body = http_body_util::BodyExt::collect(resp.into_body())
            .await
            .map_err(|e| IpcClientError::Request(format!("failed to read response body: {e}")))?
            .to_bytes();

        if !status.is_success() {
            if let Ok(err) = serde_json::from_slice::<ErrorResponse>(&body) {
                return Err(IpcClientError::DaemonError(err.error));
            }
            return Err(IpcClientError::Request(format!("unexpected status: {status}")));
        }
        Ok(body)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: hyper::Method,
        path: &str,
    ) -> Result<T, IpcClientError> {
        let body = self.request(method, path).await?;
        serde_json::from_slice(&body).map_err(|e| IpcClientError::Parse(format!("{path}: {e}")))
    }

    pub async fn health(&self) -> Result<HealthResponse, IpcClientError> {
        self.call(hyper::Method::GET, "/health").await
    }

    pub async fn status(&self) -> Result<StatusResponse, IpcClientError> {
        self.call(hyper::Method::GET, "/status").await
    }

    pub async fn stop(&self) -> Result<StopResponse, IpcClientError> {
        self.call(hyper::Method::POST, "/stop").await
    }

    pub async fn config(&self) -> Result<ConfigResponse, IpcClientError> {
        self.call(hyper::Method::GET, "/config").await
    }

    pub async fn manifest(&self, filter: Option<&str>) -> Result<ManifestResponse, IpcClientError> {
        let path = match filter {
            Some(f) => format!("/manifest?filter={}", percent_encode(f)),
            None => "/manifest".to_string(),
        };
        self.call(hyper::Method::GET, &path).await
    }

    pub async fn logs(&self, limit: usize, level: Option<&str>) -> Result<LogsResponse, IpcClientError> {
        let mut path = format!("/logs?limit={limit}");
        if let Some(level) = level {
            path.push_str("&level=");
            path.push_str(&percent_encode(level));
        }
        self.call(hyper::Method::GET, &path).await
    }

    pub async fn reset(&self) -> Result<ResetResponse, IpcClientError> {
        self.call(hyper::Method::POST, "/reset").await
    }
}

/// Query-string escaping: everything but RFC 3986 unreserved bytes.
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SosContext;
    use crate::ipc::server::{self, IpcState};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_percent_encode() {
        assert_eq!(percent_encode("^sim.*$"), "%5Esim.%2A%24");
        assert_eq!(percent_encode("a b"), "a%20b");
    }

    #[tokio::test]
    async fn test_client_not_running_error() {
        let client = IpcClient::new("/tmp/nonexistent-sosd-test.sock");
        assert!(!client.daemon_available());
        let result = client.health().await;
        assert!(matches!(result, Err(IpcClientError::NotRunning(_))));
    }

    #[tokio::test]
    async fn test_server_client_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("sosd.sock");

        let mut config = sosd_config::AppConfig::default();
        config.store.persist = false;
        let ctx = Arc::new(SosContext::open(config).unwrap());
        let state = Arc::new(IpcState {
            ctx: Arc::clone(&ctx),
            logs: None,
        });

        let shutdown = CancellationToken::new();
        let server_handle = {
            let sock_path = sock_path.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server::serve(&sock_path, state, shutdown).await })
        };

        let client = IpcClient::new(&sock_path);
        for _ in 0..50 {
            if client.daemon_available() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(client.health().await.unwrap().status, "ok");
        assert_eq!(client.status().await.unwrap().pubs, 0);
        assert!(client.manifest(Some("^x$")).await.unwrap().pubs.is_empty());
        assert!(client.logs(10, Some("warn")).await.unwrap().entries.is_empty());
        assert!(client.stop().await.unwrap().acknowledged);
        assert!(ctx.shutdown_token().is_cancelled());

        shutdown.cancel();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), server_handle).await;
    }
}
