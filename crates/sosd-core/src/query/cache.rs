//! Cache grab: the most recent frames of a filtered subset, read straight
//! from the store's frame index without running a query.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::QueryError;
use crate::results::ResultSet;
use crate::store::ValueStore;
use crate::types::{Guid, format_double};

pub const CACHE_COLUMNS: &[&str] = &[
    "pub_guid",
    "title",
    "comm_rank",
    "prog_name",
    "value_name",
    "value_type",
    "value",
    "frame",
    "time_pack",
    "time_send",
    "time_recv",
];

fn latest() -> i64 {
    -1
}

fn one() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheGrab {
    /// Regex over pub title or program name; empty matches all.
    #[serde(default)]
    pub pub_filter: String,
    /// Regex over field names; empty matches all.
    #[serde(default)]
    pub val_filter: String,
    /// Newest frame to return; negative means each pub's latest.
    #[serde(default = "latest")]
    pub frame_head: i64,
    /// Frames to return counting back from the head; negative means all.
    #[serde(default = "one")]
    pub frame_depth: i64,
}

impl Default for CacheGrab {
    fn default() -> Self {
        Self {
            pub_filter: String::new(),
            val_filter: String::new(),
            frame_head: latest(),
            frame_depth: one(),
        }
    }
}

fn compile(pattern: &str) -> Result<Option<Regex>, QueryError> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .map_err(|e| QueryError::Syntax(format!("invalid filter {pattern:?}: {e}")))
}

pub fn grab(store: &ValueStore, req: &CacheGrab, query_guid: Guid) -> Result<ResultSet, QueryError> {
    let started = std::time::Instant::now();
    let pub_re = compile(&req.pub_filter)?;
    let val_re = compile(&req.val_filter)?;

    let pub_filter = |p: &crate::store::PubRecord| {
        pub_re
            .as_ref()
            .is_none_or(|re| re.is_match(&p.info.title) || re.is_match(&p.info.prog_name))
    };
    let field_filter = |name: &str| val_re.as_ref().is_none_or(|re| re.is_match(name));

    let vals = store.recent_vals(&pub_filter, &field_filter, req.frame_head, req.frame_depth);
    let rows = vals
        .into_iter()
        .map(|v| {
            vec![
                Some(v.pub_guid.to_string()),
                Some(v.title),
                Some(v.comm_rank.to_string()),
                Some(v.prog_name),
                Some(v.value_name),
                Some(v.value_type.code().to_string()),
                Some(v.value.to_string()),
                Some(v.frame.to_string()),
                Some(format_double(v.time_pack)),
                Some(format_double(v.time_send)),
                Some(format_double(v.time_recv)),
            ]
        })
        .collect();

    Ok(ResultSet {
        query_guid,
        column_names: CACHE_COLUMNS.iter().map(|c| (*c).to_string()).collect(),
        rows,
        exec_duration_ms: started.elapsed().as_millis() as u64,
    })
}
