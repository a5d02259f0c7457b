#![deny(unsafe_code)]

//! Configuration loading and validation for the SOS daemon.
//!
//! Loads TOML configuration files and validates them. Every section and
//! field has a default, so an empty file yields a usable [`AppConfig`].

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Size of the fixed wire header. Frames smaller than this cannot exist.
pub const WIRE_HEADER_LEN: usize = 24;

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Listener and control-plane configuration.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Value store and persistence configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Query engine limits.
    #[serde(default)]
    pub query: QueryConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for the daemon's listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Address the data-plane TCP listener binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Data-plane TCP port.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Unix socket for the admin IPC API. No admin socket when unset.
    #[serde(default)]
    pub socket_path: Option<String>,

    /// Largest accepted wire frame, header included.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Number of GUIDs handed out per REGISTER / GUID_BLOCK request.
    #[serde(default = "default_guid_block_size")]
    pub guid_block_size: u64,

    /// When set, a wire SHUTDOWN must carry this token.
    #[serde(default)]
    pub shutdown_token: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            socket_path: None,
            max_frame_bytes: default_max_frame_bytes(),
            guid_block_size: default_guid_block_size(),
            shutdown_token: None,
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    22500
}

fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024 // 16 MiB
}

fn default_guid_block_size() -> u64 {
    1024
}

/// Value store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the write-ahead log.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Persist committed values to the write-ahead log. `false` keeps
    /// everything in memory.
    #[serde(default = "default_persist")]
    pub persist: bool,

    /// Group-commit interval in milliseconds (0 = fsync every commit).
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    /// Rows per sealed value-log segment.
    #[serde(default = "default_segment_rows")]
    pub segment_rows: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            persist: default_persist(),
            sync_interval_ms: default_sync_interval_ms(),
            segment_rows: default_segment_rows(),
        }
    }
}

fn default_data_dir() -> String {
    "sosd-data".to_string()
}

fn default_persist() -> bool {
    true
}

fn default_sync_interval_ms() -> u64 {
    100
}

fn default_segment_rows() -> usize {
    4096
}

/// Query engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Timeout applied to async queries that do not specify one.
    #[serde(default = "default_query_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Number of queries allowed to execute at once.
    #[serde(default = "default_query_max_concurrent")]
    pub max_concurrent: usize,

    /// Result row limit (0 = unlimited).
    #[serde(default = "default_max_result_rows")]
    pub max_result_rows: usize,

    /// Seconds a finished, unclaimed async query is kept before it is reaped.
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_query_timeout_ms(),
            max_concurrent: default_query_max_concurrent(),
            max_result_rows: default_max_result_rows(),
            job_retention_secs: default_job_retention_secs(),
        }
    }
}

fn default_query_timeout_ms() -> u64 {
    30_000
}

fn default_query_max_concurrent() -> usize {
    4
}

fn default_max_result_rows() -> usize {
    1_000_000
}

fn default_job_retention_secs() -> u64 {
    300
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Number of recent log events kept for the admin `/logs` endpoint.
    #[serde(default = "default_capture_capacity")]
    pub capture_capacity: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            capture_capacity: default_capture_capacity(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_capture_capacity() -> usize {
    1000
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.listen_port == 0 {
            return Err(ConfigError::Validation(
                "daemon.listen_port must be non-zero".to_string(),
            ));
        }
        if self.daemon.listen_addr.is_empty() {
            return Err(ConfigError::Validation(
                "daemon.listen_addr must not be empty".to_string(),
            ));
        }
        if self.daemon.max_frame_bytes <= WIRE_HEADER_LEN {
            return Err(ConfigError::Validation(format!(
                "daemon.max_frame_bytes must exceed the {WIRE_HEADER_LEN}-byte header, got {}",
                self.daemon.max_frame_bytes
            )));
        }
        if self.daemon.max_frame_bytes > i32::MAX as usize {
            return Err(ConfigError::Validation(format!(
                "daemon.max_frame_bytes must fit in a signed 32-bit size, got {}",
                self.daemon.max_frame_bytes
            )));
        }
        if self.daemon.guid_block_size == 0 {
            return Err(ConfigError::Validation(
                "daemon.guid_block_size must be at least 1".to_string(),
            ));
        }
        if let Some(token) = &self.daemon.shutdown_token
            && token.is_empty()
        {
            return Err(ConfigError::Validation(
                "daemon.shutdown_token must not be empty when set".to_string(),
            ));
        }

        if self.store.persist && self.store.data_dir.is_empty() {
            return Err(ConfigError::Validation(
                "store.data_dir must not be empty when store.persist is enabled".to_string(),
            ));
        }
        if self.store.segment_rows == 0 {
            return Err(ConfigError::Validation(
                "store.segment_rows must be at least 1".to_string(),
            ));
        }

        if self.query.max_concurrent == 0 {
            return Err(ConfigError::Validation(
                "query.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.query.default_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "query.default_timeout_ms must be non-zero".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }
        if self.logging.capture_capacity == 0 {
            return Err(ConfigError::Validation(
                "logging.capture_capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Path of the write-ahead log inside `store.data_dir`.
    pub fn wal_path(&self) -> std::path::PathBuf {
        Path::new(&self.store.data_dir).join("values.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.daemon.listen_addr, "127.0.0.1");
        assert_eq!(config.daemon.listen_port, 22500);
        assert_eq!(config.daemon.max_frame_bytes, 16 * 1024 * 1024);
        assert_eq!(config.daemon.guid_block_size, 1024);
        assert!(config.daemon.socket_path.is_none());
        assert!(config.store.persist);
        assert_eq!(config.store.segment_rows, 4096);
        assert_eq!(config.query.max_concurrent, 4);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            [daemon]
            listen_addr = "0.0.0.0"
            listen_port = 22501
            socket_path = "/tmp/sosd-test.sock"
            max_frame_bytes = 65536
            guid_block_size = 64
            shutdown_token = "letmeout"

            [store]
            data_dir = "/var/lib/sosd"
            persist = false
            sync_interval_ms = 0
            segment_rows = 128

            [query]
            default_timeout_ms = 500
            max_concurrent = 2
            max_result_rows = 10
            job_retention_secs = 5

            [logging]
            level = "debug"
            capture_capacity = 50
        "#;
        let config = AppConfig::parse(toml).unwrap();
        assert_eq!(config.daemon.listen_addr, "0.0.0.0");
        assert_eq!(config.daemon.listen_port, 22501);
        assert_eq!(
            config.daemon.socket_path.as_deref(),
            Some("/tmp/sosd-test.sock")
        );
        assert_eq!(config.daemon.max_frame_bytes, 65536);
        assert_eq!(config.daemon.guid_block_size, 64);
        assert_eq!(config.daemon.shutdown_token.as_deref(), Some("letmeout"));
        assert_eq!(config.store.data_dir, "/var/lib/sosd");
        assert!(!config.store.persist);
        assert_eq!(config.store.sync_interval_ms, 0);
        assert_eq!(config.store.segment_rows, 128);
        assert_eq!(config.query.default_timeout_ms, 500);
        assert_eq!(config.query.max_concurrent, 2);
        assert_eq!(config.query.max_result_rows, 10);
        assert_eq!(config.query.job_retention_secs, 5);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.capture_capacity, 50);
    }

    #[test]
    fn test_validation_rejects_zero_port() {
        let toml = r#"
            [daemon]
            listen_port = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_empty_addr() {
        let toml = r#"
            [daemon]
            listen_addr = ""
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_tiny_frame_limit() {
        let toml = r#"
            [daemon]
            max_frame_bytes = 24
        "#;
        let err = AppConfig::parse(toml).unwrap_err();
        assert!(err.to_string().contains("max_frame_bytes"));
    }

    #[test]
    fn test_validation_rejects_zero_guid_block() {
        let toml = r#"
            [daemon]
            guid_block_size = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_empty_shutdown_token() {
        let toml = r#"
            [daemon]
            shutdown_token = ""
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_empty_data_dir_when_persisting() {
        let toml = r#"
            [store]
            data_dir = ""
        "#;
        assert!(AppConfig::parse(toml).is_err());

        let toml = r#"
            [store]
            data_dir = ""
            persist = false
        "#;
        assert!(AppConfig::parse(toml).is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_segment_rows() {
        let toml = r#"
            [store]
            segment_rows = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let toml = r#"
            [query]
            max_concurrent = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_log_level() {
        let toml = r#"
            [logging]
            level = "chatty"
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_wal_path_under_data_dir() {
        let config = AppConfig::parse("[store]\ndata_dir = \"/tmp/sos\"\n").unwrap();
        assert_eq!(config.wal_path(), Path::new("/tmp/sos/values.wal"));
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let mut config = AppConfig::default();
        config.daemon.socket_path = Some("/tmp/x.sock".to_string());
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(AppConfig::parse(&text).unwrap(), config);
    }

    // ── Async file-based loading ──────────────────────────────────────

    #[test_log::test(tokio::test)]
    async fn test_load_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sosd.toml");
        tokio::fs::write(
            &path,
            b"[daemon]\nlisten_port = 4242\nlisten_addr = \"0.0.0.0\"\n",
        )
        .await
        .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.daemon.listen_port, 4242);
        assert_eq!(config.daemon.listen_addr, "0.0.0.0");
    }

    #[test_log::test(tokio::test)]
    async fn test_load_nonexistent_file() {
        let result = AppConfig::load(Path::new("/nonexistent/file.toml")).await;
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test_log::test(tokio::test)]
    async fn test_load_invalid_toml_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        tokio::fs::write(&path, b"not valid toml [[[").await.unwrap();

        let result = AppConfig::load(&path).await;
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation("bad value".to_string());
        assert_eq!(err.to_string(), "validation error: bad value");
    }
}
