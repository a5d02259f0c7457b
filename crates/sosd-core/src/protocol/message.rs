//! Payload bodies carried inside frames.

use serde::{Deserialize, Serialize};

use crate::error::{Coded, WireError};
use crate::ingest::PackEntry;
use crate::registry::ManifestEntry;
use crate::results::ResultSet;
use crate::stats::StatsSnapshot;
use crate::types::Guid;

/// Generic acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    #[serde(default)]
    pub count: u64,
}

impl Ack {
    pub fn ok(count: u64) -> Self {
        Self {
            ok: true,
            error: None,
            count,
        }
    }

    pub fn failed(error: WireError) -> Self {
        Self {
            ok: false,
            error: Some(error),
            count: 0,
        }
    }

    pub fn from_error(err: &dyn Coded) -> Self {
        Self::failed(err.to_wire())
    }
}

/// PUBLISH body. The target pub travels in the frame header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    #[serde(default)]
    pub packs: Vec<PackEntry>,
    /// Client send time; the daemon fills it in when absent.
    #[serde(default)]
    pub time_send: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
    #[serde(default, rename = "async")]
    pub is_async: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Reply to an asynchronous QUERY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryHandle {
    pub query_guid: Guid,
}

/// QUERY_STATUS and QUERY_CANCEL body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRef {
    pub query_guid: Guid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub query_guid: Guid,
    /// Wait for the job to finish instead of answering `QueryPending`.
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotQuery {
    #[serde(flatten)]
    pub request: crate::query::PivotRequest,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// RESULTS body: a result envelope, or an error with empty columns and rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    pub results: ResultSet,
}

impl ResultsReply {
    pub fn from_result(query_guid: Guid, result: Result<ResultSet, WireError>) -> Self {
        match result {
            Ok(results) => Self {
                ok: true,
                error: None,
                results,
            },
            Err(error) => Self {
                ok: false,
                error: Some(error),
                results: ResultSet {
                    query_guid,
                    ..Default::default()
                },
            },
        }
    }

    pub fn into_result(self) -> Result<ResultSet, WireError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.results),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestRequest {
    /// Regex over pub title or program name.
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestReply {
    pub pubs: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownRequest {
    pub token: Option<String>,
}

/// SENSITIVITY and DESENSITIZE body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenseRequest {
    pub handle: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub handle: String,
    #[serde(default)]
    pub payload: String,
}

/// PROBE reply: daemon health at a glance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReply {
    pub version: String,
    pub lifecycle: crate::context::Lifecycle,
    pub uptime_secs: u64,
    pub pubs: usize,
    pub fields: usize,
    pub vals: usize,
    pub max_frame: Option<i64>,
    pub active_connections: u64,
    pub queued_queries: usize,
    pub executing_queries: usize,
    pub persistent: bool,
    pub fault: Option<String>,
    pub counters: StatsSnapshot,
}
