//! Daemon test helpers.
//!
//! [`TestDaemon`] runs a real [`Daemon`] on an ephemeral loopback port with
//! its own temp directory, so integration tests talk to it over the wire
//! exactly as clients would.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sosd_config::AppConfig;
use sosd_core::{Daemon, SosClient, SosContext};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// A test-scoped daemon serving on `127.0.0.1:<ephemeral>`.
///
/// The temp directory is deleted automatically when this value is dropped,
/// guaranteeing cleanup even on panic.
pub struct TestDaemon {
    pub daemon: Daemon,
    pub addr: SocketAddr,
    temp_dir: TempDir,
}

impl TestDaemon {
    /// Start a daemon with `config`.
    pub async fn start(config: AppConfig) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let daemon = Daemon::open(config).expect("failed to open daemon");
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener");
        let addr = daemon.serve_on(listener).expect("failed to start daemon");
        Self {
            daemon,
            addr,
            temp_dir,
        }
    }

    /// Start an in-memory daemon with default settings.
    pub async fn in_memory() -> Self {
        Self::start(crate::TestConfigBuilder::new().build()).await
    }

    /// Start an in-memory daemon that also serves the admin socket inside
    /// its temp directory.
    pub async fn with_admin_socket() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let socket = temp_dir.path().join("sosd.sock");
        let config = crate::TestConfigBuilder::new().socket_path(&socket).build();
        let daemon = Daemon::open(config).expect("failed to open daemon");
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener");
        let addr = daemon.serve_on(listener).expect("failed to start daemon");
        Self {
            daemon,
            addr,
            temp_dir,
        }
    }

    pub fn dir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn socket_path(&self) -> Option<PathBuf> {
        self.daemon.config().daemon.socket_path.as_ref().map(PathBuf::from)
    }

    pub fn context(&self) -> &Arc<SosContext> {
        self.daemon.context()
    }

    /// A fresh, registered wire client.
    pub async fn client(&self) -> SosClient {
        let mut client = SosClient::connect(self.addr)
            .await
            .expect("failed to connect to test daemon");
        client
            .register(&Default::default())
            .await
            .expect("failed to register test client");
        client
    }

    pub async fn shutdown(&self) {
        self.daemon.shutdown().await;
    }
}
