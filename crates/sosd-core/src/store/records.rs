//! Row types of the three relations kept by the value store.

use serde::{Deserialize, Serialize};

use crate::types::{Guid, PubInfo, Semantic, ValType, Value};

/// One row of `tblPubs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PubRecord {
    pub row_id: u64,
    pub guid: Guid,
    pub info: PubInfo,
    /// Highest frame with at least one stored value.
    pub max_frame: Option<i64>,
}

/// One row of `tblData`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRecord {
    pub row_id: u64,
    pub pub_guid: Guid,
    pub guid: Guid,
    pub name: String,
    pub val_type: ValType,
    pub semantic: Semantic,
}

/// One row of `tblVals`.
///
/// `pub_idx` and `field_idx` index the pub and field vectors of the same
/// snapshot; they are valid because neither vector shrinks outside of reset.
#[derive(Debug, Clone, PartialEq)]
pub struct ValRecord {
    pub row_id: u64,
    pub pub_guid: Guid,
    pub field_guid: Guid,
    pub pub_idx: usize,
    pub field_idx: usize,
    pub value: Value,
    pub frame: i64,
    pub semantic: Semantic,
    pub time_pack: f64,
    pub time_send: f64,
    pub time_recv: f64,
}

/// Field definition as persisted in the write-ahead log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub guid: Guid,
    pub name: String,
    pub val_type: ValType,
    #[serde(default)]
    pub semantic: Semantic,
}

/// Value as persisted in the write-ahead log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValDef {
    pub field_guid: Guid,
    pub value: Value,
    #[serde(default)]
    pub semantic: Semantic,
    pub time_pack: f64,
    pub time_send: f64,
    pub time_recv: f64,
}

/// One value in a publish batch handed to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub name: String,
    pub value: Value,
    pub semantic: Semantic,
    pub time_pack: f64,
    pub time_send: f64,
}

impl BatchEntry {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        let now = crate::types::now_secs();
        Self {
            name: name.into(),
            value,
            semantic: Semantic::Default,
            time_pack: now,
            time_send: now,
        }
    }
}

/// A field declared at announce time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    pub val_type: ValType,
    #[serde(default)]
    pub semantic: Semantic,
}

/// A recent value returned by a cache grab.
#[derive(Debug, Clone, PartialEq)]
pub struct RecentVal {
    pub pub_guid: Guid,
    pub title: String,
    pub comm_rank: i64,
    pub prog_name: String,
    pub value_name: String,
    pub value_type: ValType,
    pub value: Value,
    pub frame: i64,
    pub time_pack: f64,
    pub time_send: f64,
    pub time_recv: f64,
}

/// A pub rebuilt from the store after a restart.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredPub {
    pub guid: Guid,
    pub info: PubInfo,
    /// Frame the next publish will use.
    pub next_frame: i64,
    pub fields: Vec<(FieldRecord, Option<Value>)>,
}
