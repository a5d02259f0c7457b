//! IPC server: axum router over a Unix domain socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sosd_config::AppConfig;

use super::types::*;
use crate::build_info::BuildInfo;
use crate::context::SosContext;
use crate::logging::LogReader;

pub struct IpcState {
    pub ctx: Arc<SosContext>,
    /// Present when the binary installed a [`crate::LogCollector`].
    pub logs: Option<LogReader>,
}

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/sosd.sock";

const DEFAULT_LOG_LIMIT: usize = 200;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

pub fn router(state: Arc<IpcState>) -> axum::Router {
    axum::Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/stop", post(handle_stop))
        .route("/config", get(handle_config))
        .route("/manifest", get(handle_manifest))
        .route("/logs", get(handle_logs))
        .route("/reset", post(handle_reset))
        .with_state(state)
}

/// Serve the admin API on `socket_path` until `shutdown` fires.
///
/// A stale socket file is replaced; the file is removed on exit.
pub async fn serve(
    socket_path: &Path,
    state: Arc<IpcState>,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let listener = UnixListener::bind(socket_path)?;
    info!(path = %socket_path.display(), "Admin IPC listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Admin IPC shutting down");
        })
        .await?;

    std::fs::remove_file(socket_path).ok();
    Ok(())
}

pub fn socket_path_from_config(config: &AppConfig) -> PathBuf {
    config
        .daemon
        .socket_path
        .as_deref()
        .map_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH), PathBuf::from)
}

// ── Route handlers ──────────────────────────────────────────────────────

async fn handle_health(State(state): State<Arc<IpcState>>) -> Json<HealthResponse> {
    let lifecycle = state.ctx.lifecycle();
    let status = if state.ctx.store.fault().is_some() {
        "faulted"
    } else {
        "ok"
    };
    Json(HealthResponse {
        status: status.to_string(),
        lifecycle,
        build: BuildInfo::current(),
    })
}

async fn handle_status(State(state): State<Arc<IpcState>>) -> Json<StatusResponse> {
    let ctx = &state.ctx;
    let probe = ctx.probe();
    let store = ctx.store.stats();
    Json(StatusResponse {
        lifecycle: probe.lifecycle,
        version: probe.version,
        uptime_secs: probe.uptime_secs,
        pid: std::process::id(),
        listen_addr: ctx.config.daemon.listen_addr.clone(),
        listen_port: ctx.config.daemon.listen_port,
        persistent: store.persistent,
        data_dir: ctx.config.store.data_dir.clone(),
        wal_bytes: store.wal_bytes,
        pubs: probe.pubs,
        fields: probe.fields,
        vals: probe.vals,
        max_frame: probe.max_frame,
        queued_queries: probe.queued_queries,
        executing_queries: probe.executing_queries,
        fault: probe.fault,
        counters: probe.counters,
    })
}

async fn handle_stop(State(state): State<Arc<IpcState>>) -> Json<StopResponse> {
    info!("Stop requested via admin IPC");
    let first = state.ctx.request_shutdown("admin /stop");
    Json(StopResponse {
        acknowledged: true,
        message: if first {
            "Shutdown initiated".to_string()
        } else {
            "Shutdown already in progress".to_string()
        },
    })
}

async fn handle_config(
    State(state): State<Arc<IpcState>>,
) -> Result<Json<ConfigResponse>, ApiError> {
    let mut config = state.ctx.config.clone();
    // Never echo the shutdown secret.
    if config.daemon.shutdown_token.is_some() {
        config.daemon.shutdown_token = Some("<redacted>".to_string());
    }
    toml::to_string_pretty(&config)
        .map(|toml| Json(ConfigResponse { toml }))
        .map_err(|e| {
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to serialize config: {e}"),
            )
        })
}

async fn handle_manifest(
    State(state): State<Arc<IpcState>>,
    Query(params): Query<ManifestParams>,
) -> Result<Json<ManifestResponse>, ApiError> {
    state
        .ctx
        .registry
        .list_manifest(params.filter.as_deref())
        .map(|pubs| Json(ManifestResponse { pubs }))
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))
}

async fn handle_logs(
    State(state): State<Arc<IpcState>>,
    Query(params): Query<LogsParams>,
) -> Result<Json<LogsResponse>, ApiError> {
    let Some(reader) = &state.logs else {
        return Ok(Json(LogsResponse {
            entries: Vec::new(),
            total: 0,
        }));
    };
    let min_level = match params.level.as_deref() {
        Some(level) => level
            .parse::<tracing::Level>()
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("bad level {level:?}: {e}")))?,
        None => tracing::Level::TRACE,
    };
    let entries = reader
        .recent(params.limit.unwrap_or(DEFAULT_LOG_LIMIT), min_level)
        .into_iter()
        .map(|e| LogEntry {
            elapsed_secs: e.elapsed_secs,
            level: e.level.to_string(),
            target: e.target,
            message: e.message,
            fields: e.fields,
        })
        .collect();
    Ok(Json(LogsResponse {
        entries,
        total: reader.len(),
    }))
}

async fn handle_reset(
    State(state): State<Arc<IpcState>>,
) -> Result<Json<ResetResponse>, ApiError> {
    let before = state.ctx.store.stats();
    state.ctx.reset().map_err(|e| {
        warn!(error = %e, "Admin reset failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e)
    })?;
    Ok(Json(ResetResponse {
        pubs_removed: before.pubs,
        vals_removed: before.vals,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogCollector;
    use crate::store::BatchEntry;
    use crate::types::{PubInfo, Value};
    use axum::body::Body;
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    fn test_state(logs: Option<LogReader>) -> Arc<IpcState> {
        let mut config = AppConfig::default();
        config.store.persist = false;
        config.daemon.shutdown_token = Some("hunter2".into());
        Arc::new(IpcState {
            ctx: Arc::new(SosContext::open(config).unwrap()),
            logs,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        app: axum::Router,
        method: &str,
        uri: &str,
    ) -> (StatusCode, T) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (status, health): (_, HealthResponse) =
            get_json(router(test_state(None)), "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health.status, "ok");
        assert_eq!(health.build.version, crate::build_info::VERSION);
    }

    #[tokio::test]
    async fn test_status_counts_store() {
        let state = test_state(None);
        state
            .ctx
            .store
            .announce_pub(900, &PubInfo::default(), &[])
            .unwrap();
        state
            .ctx
            .store
            .commit_batch(900, 0, &[BatchEntry::new("x", Value::Int(1))])
            .unwrap();

        let (status, body): (_, StatusResponse) =
            get_json(router(state), "GET", "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.pubs, 1);
        assert_eq!(body.vals, 1);
        assert_eq!(body.listen_port, 22500);
        assert!(!body.persistent);
    }

    #[tokio::test]
    async fn test_stop_requests_shutdown() {
        let state = test_state(None);
        let ctx = Arc::clone(&state.ctx);
        let (status, stop): (_, StopResponse) = get_json(router(state), "POST", "/stop").await;
        assert_eq!(status, StatusCode::OK);
        assert!(stop.acknowledged);
        assert!(ctx.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_config_redacts_token() {
        let (_, config): (_, ConfigResponse) =
            get_json(router(test_state(None)), "GET", "/config").await;
        assert!(config.toml.contains("listen_port"));
        assert!(!config.toml.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_manifest_and_bad_filter() {
        let state = test_state(None);
        state
            .ctx
            .registry
            .announce(&crate::registry::AnnounceRequest {
                info: PubInfo {
                    title: "lulesh".into(),
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap();

        let (status, manifest): (_, ManifestResponse) =
            get_json(router(Arc::clone(&state)), "GET", "/manifest?filter=lul").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(manifest.pubs.len(), 1);
        assert_eq!(manifest.pubs[0].title, "lulesh");

        let (status, err): (_, ErrorResponse) =
            get_json(router(state), "GET", "/manifest?filter=%28").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!err.error.is_empty());
    }

    #[tokio::test]
    async fn test_logs_endpoint() {
        let collector = LogCollector::new(16);
        let reader = collector.reader();
        let _guard = tracing_subscriber::registry().with(collector).set_default();
        tracing::info!("hello");
        tracing::warn!("careful");

        let (status, logs): (_, LogsResponse) =
            get_json(router(test_state(Some(reader))), "GET", "/logs?level=warn").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(logs.entries.len(), 1);
        assert_eq!(logs.entries[0].message, "careful");
        assert_eq!(logs.entries[0].level, "WARN");
    }

    #[tokio::test]
    async fn test_reset_endpoint() {
        let state = test_state(None);
        state
            .ctx
            .store
            .announce_pub(900, &PubInfo::default(), &[])
            .unwrap();
        let (status, reset): (_, ResetResponse) =
            get_json(router(Arc::clone(&state)), "POST", "/reset").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reset.pubs_removed, 1);
        assert_eq!(state.ctx.store.stats().pubs, 0);
    }
}
