//! Core daemon process: startup, background tasks, and ordered shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sosd_config::{AppConfig, ConfigError};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::context::{Lifecycle, SosContext};
use crate::ipc::{self, IpcState};
use crate::listener::accept_loop;
use crate::logging::LogReader;
use crate::store::StoreError;

const REAP_INTERVAL: Duration = Duration::from_secs(1);
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// The SOS daemon.
///
/// Owns the shared [`SosContext`] plus the tokens and task tracker that
/// drive its background work. `stop` ends accepting; `close` ends every
/// connection and housekeeping task.
pub struct Daemon {
    ctx: Arc<SosContext>,
    logs: Option<LogReader>,
    tracker: TaskTracker,
    stop: CancellationToken,
    close: CancellationToken,
}

impl Daemon {
    /// Validate `config` and open the store, replaying its log.
    pub fn open(config: AppConfig) -> Result<Self, DaemonError> {
        config.validate()?;
        let ctx = SosContext::open(config)?;
        Ok(Self {
            ctx: Arc::new(ctx),
            logs: None,
            tracker: TaskTracker::new(),
            stop: CancellationToken::new(),
            close: CancellationToken::new(),
        })
    }

    /// Expose captured log events through the admin API.
    pub fn with_logs(mut self, logs: LogReader) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn context(&self) -> &Arc<SosContext> {
        &self.ctx
    }

    pub fn config(&self) -> &AppConfig {
        &self.ctx.config
    }

    /// Bind the configured wire address.
    pub async fn bind(&self) -> Result<TcpListener, DaemonError> {
        let daemon = &self.ctx.config.daemon;
        let addr = format!("{}:{}", daemon.listen_addr, daemon.listen_port);
        TcpListener::bind(&addr)
            .await
            .map_err(|e| DaemonError::Startup(format!("failed to bind {addr}: {e}")))
    }

    /// Start serving on an already-bound listener and return its address.
    ///
    /// Spawns the accept loop, the admin socket (when configured), and
    /// housekeeping. Returns immediately; call [`Daemon::shutdown`] to stop.
    pub fn serve_on(&self, listener: TcpListener) -> Result<SocketAddr, DaemonError> {
        let addr = listener.local_addr()?;
        self.ctx.advance(Lifecycle::Running);
        info!(
            %addr,
            version = %crate::build_info::version_string(),
            persistent = self.ctx.store.is_persistent(),
            "SOS daemon listening"
        );

        self.tracker.spawn(accept_loop(
            listener,
            Arc::clone(&self.ctx),
            self.tracker.clone(),
            self.stop.clone(),
            self.close.clone(),
        ));

        if let Some(path) = &self.ctx.config.daemon.socket_path {
            let path = PathBuf::from(path);
            let state = Arc::new(IpcState {
                ctx: Arc::clone(&self.ctx),
                logs: self.logs.clone(),
            });
            let close = self.close.clone();
            self.tracker.spawn(async move {
                if let Err(e) = ipc::server::serve(&path, state, close).await {
                    error!(path = %path.display(), error = %e, "Admin IPC server failed");
                }
            });
        }

        self.spawn_housekeeping();
        Ok(addr)
    }

    fn spawn_housekeeping(&self) {
        // Retired async jobs.
        let ctx = Arc::clone(&self.ctx);
        let close = self.close.clone();
        self.tracker.spawn(async move {
            let mut tick = tokio::time::interval(REAP_INTERVAL);
            loop {
                tokio::select! {
                    _ = close.cancelled() => break,
                    _ = tick.tick() => {
                        let reaped = ctx.query.reap_expired();
                        if reaped > 0 {
                            info!(reaped, "Expired query jobs removed");
                        }
                    }
                }
            }
        });

        // A store fault makes further commits impossible: drain and stop.
        let ctx = Arc::clone(&self.ctx);
        let close = self.close.clone();
        let mut fault = ctx.store.subscribe_fault();
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = close.cancelled() => break,
                    changed = fault.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let reason = fault.borrow_and_update().clone();
                        if let Some(reason) = reason {
                            error!(%reason, "Store fault, shutting down");
                            ctx.request_shutdown("store fault");
                            break;
                        }
                    }
                }
            }
        });

        let sync_ms = self.ctx.config.store.sync_interval_ms;
        if self.ctx.store.is_persistent() && sync_ms > 0 {
            let ctx = Arc::clone(&self.ctx);
            let close = self.close.clone();
            self.tracker.spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_millis(sync_ms));
                loop {
                    tokio::select! {
                        _ = close.cancelled() => break,
                        _ = tick.tick() => {
                            if let Err(e) = ctx.store.flush() {
                                warn!(error = %e, "Periodic store sync failed");
                            }
                        }
                    }
                }
            });
        }
    }

    /// Bind, serve, and block until shutdown is requested over the wire,
    /// the admin socket, a store fault, or a signal. Then drain and stop.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let listener = self.bind().await?;
        self.serve_on(listener)?;

        tokio::select! {
            _ = self.ctx.shutdown_token().cancelled() => {
                info!("Shutdown signal received, stopping daemon");
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Ctrl-C received, initiating graceful shutdown");
                self.ctx.request_shutdown("interrupt");
            }
            _ = terminate_signal() => {
                warn!("SIGTERM received, initiating graceful shutdown");
                self.ctx.request_shutdown("terminate");
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Drain and stop. Safe to call more than once; later calls return
    /// immediately.
    ///
    /// In-flight publishes finish first, then the listener stops accepting,
    /// pending async queries are cancelled while running ones complete, and
    /// the store is flushed before connections close.
    pub async fn shutdown(&self) {
        self.ctx.request_shutdown("daemon shutdown");
        if !self.ctx.advance(Lifecycle::Draining) {
            return;
        }

        self.ctx.ingest.drain().await;
        self.stop.cancel();
        self.ctx.query.drain().await;
        if let Err(e) = self.ctx.store.flush() {
            error!(error = %e, "Final store flush failed");
        }
        self.ctx.advance(Lifecycle::Stopped);

        self.close.cancel();
        self.tracker.close();
        if tokio::time::timeout(CLOSE_GRACE, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.tracker.len(),
                "Tasks still running after shutdown grace period"
            );
        }
        info!("SOS daemon stopped");
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

/// Errors from the daemon runtime.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("daemon startup failed: {0}")]
    Startup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SosClient;
    use pretty_assertions::assert_eq;

    fn memory_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.store.persist = false;
        config
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let mut config = memory_config();
        config.daemon.listen_port = 0;
        assert!(matches!(Daemon::open(config), Err(DaemonError::Config(_))));
    }

    #[tokio::test]
    async fn test_serve_and_shutdown() {
        let daemon = Daemon::open(memory_config()).unwrap();
        assert_eq!(daemon.context().lifecycle(), Lifecycle::Init);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = daemon.serve_on(listener).unwrap();
        assert_eq!(daemon.context().lifecycle(), Lifecycle::Running);

        let mut client = SosClient::connect(addr).await.unwrap();
        let probe = client.probe().await.unwrap();
        assert_eq!(probe.lifecycle, Lifecycle::Running);
        drop(client);

        daemon.shutdown().await;
        assert_eq!(daemon.context().lifecycle(), Lifecycle::Stopped);
        assert!(daemon.context().shutdown_token().is_cancelled());

        // Second call is a no-op.
        daemon.shutdown().await;
        assert_eq!(daemon.context().lifecycle(), Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn test_admin_socket_served() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("sosd.sock");
        let mut config = memory_config();
        config.daemon.socket_path = Some(sock.to_string_lossy().into_owned());

        let daemon = Daemon::open(config).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        daemon.serve_on(listener).unwrap();

        let client = ipc::IpcClient::new(&sock);
        for _ in 0..50 {
            if client.daemon_available() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let health = client.health().await.unwrap();
        assert_eq!(health.lifecycle, Lifecycle::Running);

        client.stop().await.unwrap();
        assert!(daemon.context().shutdown_token().is_cancelled());
        daemon.shutdown().await;
        assert!(!sock.exists());
    }
}
