//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries. The builder starts from an
//! in-memory store so tests never touch the working directory.

use std::path::Path;

use sosd_config::AppConfig;

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .max_concurrent_queries(1)
///     .shutdown_token("secret")
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.store.persist = false;
        Self { config }
    }

    pub fn listen_addr(mut self, addr: &str) -> Self {
        self.config.daemon.listen_addr = addr.to_string();
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    /// Persist the store under `dir` with synchronous WAL flushes.
    pub fn persistent(mut self, dir: &Path) -> Self {
        self.config.store.persist = true;
        self.config.store.data_dir = dir.to_string_lossy().into_owned();
        self.config.store.sync_interval_ms = 0;
        self
    }

    pub fn segment_rows(mut self, rows: usize) -> Self {
        self.config.store.segment_rows = rows;
        self
    }

    pub fn socket_path(mut self, path: &Path) -> Self {
        self.config.daemon.socket_path = Some(path.to_string_lossy().into_owned());
        self
    }

    pub fn shutdown_token(mut self, token: &str) -> Self {
        self.config.daemon.shutdown_token = Some(token.to_string());
        self
    }

    pub fn max_frame_bytes(mut self, bytes: usize) -> Self {
        self.config.daemon.max_frame_bytes = bytes;
        self
    }

    pub fn max_concurrent_queries(mut self, n: usize) -> Self {
        self.config.query.max_concurrent = n;
        self
    }

    pub fn query_timeout_ms(mut self, ms: u64) -> Self {
        self.config.query.default_timeout_ms = ms;
        self
    }

    pub fn max_result_rows(mut self, rows: usize) -> Self {
        self.config.query.max_result_rows = rows;
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
