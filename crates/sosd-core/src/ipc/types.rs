//! Request/response bodies of the admin API.

use serde::{Deserialize, Serialize};

use crate::build_info::BuildInfo;
use crate::context::Lifecycle;
use crate::registry::ManifestEntry;
use crate::stats::StatsSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub lifecycle: Lifecycle,
    #[serde(flatten)]
    pub build: BuildInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub lifecycle: Lifecycle,
    pub version: String,
    pub uptime_secs: u64,
    pub pid: u32,
    pub listen_addr: String,
    pub listen_port: u16,
    pub persistent: bool,
    pub data_dir: String,
    pub wal_bytes: u64,
    pub pubs: usize,
    pub fields: usize,
    pub vals: usize,
    pub max_frame: Option<i64>,
    pub queued_queries: usize,
    pub executing_queries: usize,
    pub fault: Option<String>,
    pub counters: StatsSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub acknowledged: bool,
    pub message: String,
}

/// Resolved configuration as TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub toml: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestParams {
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestResponse {
    pub pubs: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogsParams {
    pub limit: Option<usize>,
    /// Minimum severity, e.g. `warn`.
    pub level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub elapsed_secs: f64,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResponse {
    pub entries: Vec<LogEntry>,
    /// Events currently held by the collector.
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetResponse {
    pub pubs_removed: usize,
    pub vals_removed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
