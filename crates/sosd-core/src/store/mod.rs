//! Value store: the committed, queryable record of every pub, field, and value.
//!
//! All committed state lives behind one reader-writer lock. Writers first
//! take the writer mutex, which orders the log, validate under a read lock,
//! append to the log, and only then take the write lock to apply. Readers
//! either see a whole batch or none of it, and never wait on log I/O.
//! Readers copy out a [`StoreSnapshot`] under a short read lock and run
//! against that.
//!
//! ```text
//!   commit_batch ──▶ writer mutex ──▶ WAL append ──▶ apply (write lock) ──▶ visible
//!   snapshot     ──▶ clone Arcs + tail (read lock)     ──▶ query runs lock-free
//! ```

pub mod records;
pub mod segment;
pub mod wal;

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use sosd_config::StoreConfig;

use crate::error::{Coded, ErrorCode};
use crate::guid::GuidAllocator;
use crate::types::{Guid, PubInfo, ValType, Value, now_secs};

pub use records::{
    BatchEntry, FieldDecl, FieldDef, FieldRecord, PubRecord, RecentVal, RecoveredPub, ValDef,
    ValRecord,
};
pub use segment::{ValLog, ValView};
pub use wal::{WalError, WalRecord, WriteAheadLog};

/// Errors from the value store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown publisher {0}")]
    UnknownPublisher(Guid),

    #[error("field {name:?} is {expected}, cannot store {got}")]
    TypeMismatch {
        name: String,
        expected: ValType,
        got: ValType,
    },

    #[error("value for field {name:?} cannot be stored: {reason}")]
    Unrepresentable { name: String, reason: String },

    #[error("write-ahead log failure: {0}")]
    Wal(#[from] WalError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame {frame} for publisher {pub_guid} precedes its latest frame {latest}")]
    FrameRegression {
        pub_guid: Guid,
        frame: i64,
        latest: i64,
    },

    #[error("store is faulted and refuses writes: {0}")]
    Faulted(String),
}

impl Coded for StoreError {
    fn code(&self) -> ErrorCode {
        match self {
            StoreError::UnknownPublisher(_) => ErrorCode::UnknownPublisher,
            StoreError::TypeMismatch { .. } => ErrorCode::TypeMismatch,
            StoreError::Unrepresentable { .. } => ErrorCode::UnknownType,
            StoreError::FrameRegression { .. } => ErrorCode::FrameRegression,
            StoreError::Wal(_) | StoreError::Io(_) | StoreError::Faulted(_) => {
                ErrorCode::StoreIoError
            }
        }
    }
}

/// Row ids assigned to a committed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReceipt {
    pub first_row_id: u64,
    pub count: usize,
}

/// Summary counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreStats {
    pub pubs: usize,
    pub fields: usize,
    pub vals: usize,
    pub max_frame: Option<i64>,
    pub persistent: bool,
    pub wal_bytes: u64,
    pub fault: Option<String>,
}

/// Consistent read-only copy of the store, taken at one instant.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pubs: Arc<Vec<PubRecord>>,
    fields: Arc<Vec<FieldRecord>>,
    vals: ValView,
}

impl StoreSnapshot {
    pub fn empty() -> Self {
        Self {
            pubs: Arc::new(Vec::new()),
            fields: Arc::new(Vec::new()),
            vals: ValView::empty(),
        }
    }

    pub fn pubs(&self) -> &[PubRecord] {
        &self.pubs
    }

    pub fn fields(&self) -> &[FieldRecord] {
        &self.fields
    }

    pub fn vals(&self) -> &ValView {
        &self.vals
    }

    pub fn pub_of(&self, val: &ValRecord) -> &PubRecord {
        &self.pubs[val.pub_idx]
    }

    pub fn field_of(&self, val: &ValRecord) -> &FieldRecord {
        &self.fields[val.field_idx]
    }
}

#[derive(Debug)]
struct StoreState {
    pubs: Arc<Vec<PubRecord>>,
    pub_rows: HashMap<Guid, usize>,
    fields: Arc<Vec<FieldRecord>>,
    /// (pub guid, field name) → index into `fields`.
    field_rows: HashMap<(Guid, String), usize>,
    pub_fields: HashMap<Guid, Vec<usize>>,
    vals: ValLog,
    /// field guid → frame → row ids.
    frames: HashMap<Guid, BTreeMap<i64, Vec<u64>>>,
}

impl StoreState {
    fn new(segment_rows: usize) -> Self {
        Self {
            pubs: Arc::new(Vec::new()),
            pub_rows: HashMap::new(),
            fields: Arc::new(Vec::new()),
            field_rows: HashMap::new(),
            pub_fields: HashMap::new(),
            vals: ValLog::new(segment_rows),
            frames: HashMap::new(),
        }
    }

    fn field(&self, pub_guid: Guid, name: &str) -> Option<&FieldRecord> {
        self.field_rows
            .get(&(pub_guid, name.to_string()))
            .map(|&idx| &self.fields[idx])
    }

    fn add_field(&mut self, pub_guid: Guid, def: FieldDef) -> usize {
        let idx = self.fields.len();
        self.field_rows.insert((pub_guid, def.name.clone()), idx);
        self.pub_fields.entry(pub_guid).or_default().push(idx);
        Arc::make_mut(&mut self.fields).push(FieldRecord {
            row_id: idx as u64 + 1,
            pub_guid,
            guid: def.guid,
            name: def.name,
            val_type: def.val_type,
            semantic: def.semantic,
        });
        idx
    }

    fn apply(&mut self, record: WalRecord) {
        match record {
            WalRecord::PubUpsert { guid, info, fields } => {
                match self.pub_rows.get(&guid) {
                    Some(&idx) => Arc::make_mut(&mut self.pubs)[idx].info = info,
                    None => {
                        let idx = self.pubs.len();
                        self.pub_rows.insert(guid, idx);
                        Arc::make_mut(&mut self.pubs).push(PubRecord {
                            row_id: idx as u64 + 1,
                            guid,
                            info,
                            max_frame: None,
                        });
                    }
                }
                for def in fields {
                    if self.field(guid, &def.name).is_none() {
                        self.add_field(guid, def);
                    }
                }
            }
            WalRecord::Batch {
                pub_guid,
                frame,
                fields,
                vals,
            } => {
                let Some(&pub_idx) = self.pub_rows.get(&pub_guid) else {
                    return;
                };
                for def in fields {
                    if self.field(pub_guid, &def.name).is_none() {
                        self.add_field(pub_guid, def);
                    }
                }
                let by_guid: HashMap<Guid, usize> = self
                    .pub_fields
                    .get(&pub_guid)
                    .map(|idxs| idxs.iter().map(|&i| (self.fields[i].guid, i)).collect())
                    .unwrap_or_default();
                let mut stored = 0;
                for val in vals {
                    let Some(&field_idx) = by_guid.get(&val.field_guid) else {
                        continue;
                    };
                    let row_id = self.vals.next_row_id();
                    self.frames
                        .entry(val.field_guid)
                        .or_default()
                        .entry(frame)
                        .or_default()
                        .push(row_id);
                    self.vals.push(ValRecord {
                        row_id,
                        pub_guid,
                        field_guid: val.field_guid,
                        pub_idx,
                        field_idx,
                        value: val.value,
                        frame,
                        semantic: val.semantic,
                        time_pack: val.time_pack,
                        time_send: val.time_send,
                        time_recv: val.time_recv,
                    });
                    stored += 1;
                }
                if stored > 0 {
                    let record = &mut Arc::make_mut(&mut self.pubs)[pub_idx];
                    record.max_frame = Some(record.max_frame.map_or(frame, |m| m.max(frame)));
                }
            }
        }
    }
}

/// The daemon's value store.
pub struct ValueStore {
    state: RwLock<StoreState>,
    /// Serializes every mutation and owns the log when persistent. Held
    /// while logging; `state` is write-locked only to apply.
    writer: Mutex<Option<WriteAheadLog>>,
    persistent: bool,
    wal_bytes: AtomicU64,
    guids: Arc<GuidAllocator>,
    segment_rows: usize,
    fault: watch::Sender<Option<String>>,
}

impl ValueStore {
    /// A store that keeps everything in memory.
    pub fn in_memory(segment_rows: usize, guids: Arc<GuidAllocator>) -> Self {
        let (fault, _) = watch::channel(None);
        Self {
            state: RwLock::new(StoreState::new(segment_rows)),
            writer: Mutex::new(None),
            persistent: false,
            wal_bytes: AtomicU64::new(0),
            guids,
            segment_rows,
            fault,
        }
    }

    /// Open the store described by `config`, replaying its write-ahead log.
    ///
    /// A torn tail is truncated away; every intact record is applied.
    pub fn open(config: &StoreConfig, guids: Arc<GuidAllocator>) -> Result<Self, StoreError> {
        if !config.persist {
            info!("Value store running in memory only");
            return Ok(Self::in_memory(config.segment_rows, guids));
        }

        let dir = std::path::Path::new(&config.data_dir);
        std::fs::create_dir_all(dir)?;
        let path = dir.join("values.wal");

        let replayed = wal::replay(&path)?;
        if let Some(reason) = &replayed.torn {
            warn!(path = %path.display(), valid_len = replayed.valid_len, reason = %reason,
                "Truncating damaged write-ahead log tail");
            wal::truncate_file(&path, replayed.valid_len)?;
        }

        let mut state = StoreState::new(config.segment_rows);
        let record_count = replayed.records.len();
        for record in replayed.records {
            observe_guids(&guids, &record);
            state.apply(record);
        }
        info!(
            path = %path.display(),
            records = record_count,
            pubs = state.pubs.len(),
            vals = state.vals.len(),
            "Value store recovered"
        );

        let log = WriteAheadLog::open(&path, Duration::from_millis(config.sync_interval_ms))?;
        let (fault, _) = watch::channel(None);
        Ok(Self {
            state: RwLock::new(state),
            wal_bytes: AtomicU64::new(log.position()),
            writer: Mutex::new(Some(log)),
            persistent: true,
            guids,
            segment_rows: config.segment_rows,
            fault,
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Current fault, if the store has stopped accepting writes.
    pub fn fault(&self) -> Option<String> {
        self.fault.borrow().clone()
    }

    pub fn subscribe_fault(&self) -> watch::Receiver<Option<String>> {
        self.fault.subscribe()
    }

    fn check_fault(&self) -> Result<(), StoreError> {
        match self.fault() {
            Some(reason) => Err(StoreError::Faulted(reason)),
            None => Ok(()),
        }
    }

    fn enter_fault(&self, err: &WalError) {
        let reason = err.to_string();
        error!(error = %reason, "Value store write failed; refusing further writes");
        self.fault.send_replace(Some(reason));
    }

    /// Append `record` to the log, if there is one. The caller holds the
    /// writer lock, so log order is commit order.
    fn log(&self, wal: &mut Option<WriteAheadLog>, record: &WalRecord) -> Result<(), StoreError> {
        let Some(wal) = wal.as_mut() else {
            return Ok(());
        };
        if let Err(e) = wal.append(record) {
            self.enter_fault(&e);
            return Err(e.into());
        }
        self.wal_bytes.store(wal.position(), Ordering::Relaxed);
        Ok(())
    }

    /// Create a pub record or update its metadata and declared fields.
    ///
    /// Returns `true` when anything changed. Declared fields that conflict
    /// with an existing field's type fail the whole call.
    pub fn announce_pub(
        &self,
        guid: Guid,
        info: &PubInfo,
        fields: &[FieldDecl],
    ) -> Result<bool, StoreError> {
        let mut writer = self.writer.lock();
        self.check_fault()?;

        let record = {
            let state = self.state.read();
            let mut new_fields: Vec<FieldDef> = Vec::new();
            for decl in fields {
                if let Some(existing) = state.field(guid, &decl.name) {
                    if existing.val_type != decl.val_type {
                        return Err(StoreError::TypeMismatch {
                            name: decl.name.clone(),
                            expected: existing.val_type,
                            got: decl.val_type,
                        });
                    }
                    continue;
                }
                if let Some(pending) = new_fields.iter().find(|f| f.name == decl.name) {
                    if pending.val_type != decl.val_type {
                        return Err(StoreError::TypeMismatch {
                            name: decl.name.clone(),
                            expected: pending.val_type,
                            got: decl.val_type,
                        });
                    }
                    continue;
                }
                new_fields.push(FieldDef {
                    guid: self.guids.next(),
                    name: decl.name.clone(),
                    val_type: decl.val_type,
                    semantic: decl.semantic,
                });
            }

            let info_changed = match state.pub_rows.get(&guid) {
                Some(&idx) => state.pubs[idx].info != *info,
                None => true,
            };
            if !info_changed && new_fields.is_empty() {
                return Ok(false);
            }
            WalRecord::PubUpsert {
                guid,
                info: info.clone(),
                fields: new_fields,
            }
        };

        self.log(&mut writer, &record)?;
        self.state.write().apply(record);
        debug!(pub_guid = guid, "Pub record upserted");
        Ok(true)
    }

    /// Store a single value for `field_name` at `frame`.
    ///
    /// The field is created on first use; afterwards its type is fixed.
    pub fn append(
        &self,
        pub_guid: Guid,
        field_name: &str,
        value: Value,
        frame: i64,
    ) -> Result<u64, StoreError> {
        let receipt = self.commit_batch(pub_guid, frame, &[BatchEntry::new(field_name, value)])?;
        Ok(receipt.first_row_id)
    }

    /// Store every entry as one atomic batch sharing `frame`.
    ///
    /// Either all entries become visible together or none do. `frame` may
    /// repeat the pub's latest frame but never precede it.
    pub fn commit_batch(
        &self,
        pub_guid: Guid,
        frame: i64,
        entries: &[BatchEntry],
    ) -> Result<BatchReceipt, StoreError> {
        let mut writer = self.writer.lock();
        self.check_fault()?;

        let (record, receipt) = {
            let state = self.state.read();
            let pub_idx = *state
                .pub_rows
                .get(&pub_guid)
                .ok_or(StoreError::UnknownPublisher(pub_guid))?;
            if let Some(latest) = state.pubs[pub_idx].max_frame
                && frame < latest
            {
                return Err(StoreError::FrameRegression {
                    pub_guid,
                    frame,
                    latest,
                });
            }

            let time_recv = now_secs();
            let mut new_fields: Vec<FieldDef> = Vec::new();
            let mut vals: Vec<ValDef> = Vec::with_capacity(entries.len());
            for entry in entries {
                if let Value::Double(v) = entry.value
                    && !v.is_finite()
                {
                    return Err(StoreError::Unrepresentable {
                        name: entry.name.clone(),
                        reason: format!("non-finite double {v}"),
                    });
                }
                let got = entry.value.val_type();
                let field_guid = match state.field(pub_guid, &entry.name) {
                    Some(field) if field.val_type != got => {
                        return Err(StoreError::TypeMismatch {
                            name: entry.name.clone(),
                            expected: field.val_type,
                            got,
                        });
                    }
                    Some(field) => field.guid,
                    None => match new_fields.iter().find(|f| f.name == entry.name) {
                        Some(pending) if pending.val_type != got => {
                            return Err(StoreError::TypeMismatch {
                                name: entry.name.clone(),
                                expected: pending.val_type,
                                got,
                            });
                        }
                        Some(pending) => pending.guid,
                        None => {
                            let guid = self.guids.next();
                            new_fields.push(FieldDef {
                                guid,
                                name: entry.name.clone(),
                                val_type: got,
                                semantic: entry.semantic,
                            });
                            guid
                        }
                    },
                };
                vals.push(ValDef {
                    field_guid,
                    value: entry.value.clone(),
                    semantic: entry.semantic,
                    time_pack: entry.time_pack,
                    time_send: entry.time_send,
                    time_recv,
                });
            }

            let receipt = BatchReceipt {
                first_row_id: state.vals.next_row_id(),
                count: vals.len(),
            };
            if receipt.count == 0 && new_fields.is_empty() {
                return Ok(receipt);
            }
            let record = WalRecord::Batch {
                pub_guid,
                frame,
                fields: new_fields,
                vals,
            };
            (record, receipt)
        };

        self.log(&mut writer, &record)?;
        self.state.write().apply(record);
        Ok(receipt)
    }

    /// Take a consistent snapshot for query execution.
    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.read();
        StoreSnapshot {
            pubs: Arc::clone(&state.pubs),
            fields: Arc::clone(&state.fields),
            vals: state.vals.view(),
        }
    }

    /// All pub records, in creation order.
    pub fn manifest(&self) -> Vec<PubRecord> {
        let pubs = Arc::clone(&self.state.read().pubs);
        pubs.as_ref().clone()
    }

    pub fn pub_record(&self, guid: Guid) -> Option<PubRecord> {
        let state = self.state.read();
        state.pub_rows.get(&guid).map(|&idx| state.pubs[idx].clone())
    }

    /// Values of the most recent frames, read straight from the frame index.
    ///
    /// `frame_head < 0` means each pub's latest frame; `frame_depth < 0`
    /// means every frame up to the head.
    pub fn recent_vals(
        &self,
        pub_filter: &dyn Fn(&PubRecord) -> bool,
        field_filter: &dyn Fn(&str) -> bool,
        frame_head: i64,
        frame_depth: i64,
    ) -> Vec<RecentVal> {
        let mut out = Vec::new();
        if frame_depth == 0 {
            return out;
        }
        let state = self.state.read();

        for record in state.pubs.iter().filter(|p| pub_filter(p)) {
            let head = if frame_head < 0 {
                match record.max_frame {
                    Some(f) => f,
                    None => continue,
                }
            } else {
                frame_head
            };
            let low = if frame_depth < 0 {
                Bound::Unbounded
            } else {
                Bound::Included(head.saturating_sub(frame_depth.saturating_sub(1)))
            };

            let Some(field_idxs) = state.pub_fields.get(&record.guid) else {
                continue;
            };
            for &idx in field_idxs {
                let field = &state.fields[idx];
                if !field_filter(&field.name) {
                    continue;
                }
                let Some(frames) = state.frames.get(&field.guid) else {
                    continue;
                };
                for (_, row_ids) in frames.range((low, Bound::Included(head))) {
                    for val in row_ids.iter().filter_map(|&id| state.vals.get(id)) {
                        out.push(RecentVal {
                            pub_guid: record.guid,
                            title: record.info.title.clone(),
                            comm_rank: record.info.comm_rank,
                            prog_name: record.info.prog_name.clone(),
                            value_name: field.name.clone(),
                            value_type: field.val_type,
                            value: val.value.clone(),
                            frame: val.frame,
                            time_pack: val.time_pack,
                            time_send: val.time_send,
                            time_recv: val.time_recv,
                        });
                    }
                }
            }
        }
        out
    }

    /// Row ids of one field's values within `[from, to]` frames.
    pub fn frame_range(
        &self,
        pub_guid: Guid,
        field_name: &str,
        from: i64,
        to: i64,
    ) -> Vec<(i64, u64)> {
        let state = self.state.read();
        let Some(field) = state.field(pub_guid, field_name) else {
            return Vec::new();
        };
        let Some(frames) = state.frames.get(&field.guid) else {
            return Vec::new();
        };
        if from > to {
            return Vec::new();
        }
        frames
            .range(from..=to)
            .flat_map(|(&frame, ids)| ids.iter().map(move |&id| (frame, id)))
            .collect()
    }

    /// Everything needed to rebuild live publisher state after a restart.
    pub fn recovered_pubs(&self) -> Vec<RecoveredPub> {
        let state = self.state.read();
        state
            .pubs
            .iter()
            .map(|record| {
                let fields = state
                    .pub_fields
                    .get(&record.guid)
                    .map(|idxs| {
                        idxs.iter()
                            .map(|&idx| {
                                let field = state.fields[idx].clone();
                                let last = state
                                    .frames
                                    .get(&field.guid)
                                    .and_then(|frames| frames.values().next_back())
                                    .and_then(|ids| ids.last())
                                    .and_then(|&id| state.vals.get(id))
                                    .map(|v| v.value.clone());
                                (field, last)
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                RecoveredPub {
                    guid: record.guid,
                    info: record.info.clone(),
                    next_frame: record.max_frame.map_or(0, |f| f + 1),
                    fields,
                }
            })
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        let (pubs, fields, vals, max_frame) = {
            let state = self.state.read();
            (
                state.pubs.len(),
                state.fields.len(),
                state.vals.len(),
                state.pubs.iter().filter_map(|p| p.max_frame).max(),
            )
        };
        StoreStats {
            pubs,
            fields,
            vals,
            max_frame,
            persistent: self.persistent,
            wal_bytes: self.wal_bytes.load(Ordering::Relaxed),
            fault: self.fault(),
        }
    }

    /// Force logged records to stable storage.
    pub fn flush(&self) -> Result<(), StoreError> {
        let mut writer = self.writer.lock();
        if let Some(wal) = writer.as_mut()
            && let Err(e) = wal.sync()
        {
            self.enter_fault(&e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Administrative reset: drop every pub, field, and value and empty the log.
    pub fn reset(&self) -> Result<(), StoreError> {
        let mut writer = self.writer.lock();
        if let Some(wal) = writer.as_mut() {
            if let Err(e) = wal.truncate(0) {
                self.enter_fault(&e);
                return Err(e.into());
            }
            self.wal_bytes.store(0, Ordering::Relaxed);
        }
        *self.state.write() = StoreState::new(self.segment_rows);
        warn!("Value store reset");
        Ok(())
    }
}

fn observe_guids(guids: &GuidAllocator, record: &WalRecord) {
    match record {
        WalRecord::PubUpsert { guid, fields, .. } => {
            guids.observe(*guid);
            fields.iter().for_each(|f| guids.observe(f.guid));
        }
        WalRecord::Batch {
            pub_guid, fields, ..
        } => {
            guids.observe(*pub_guid);
            fields.iter().for_each(|f| guids.observe(f.guid));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn store() -> ValueStore {
        ValueStore::in_memory(4, Arc::new(GuidAllocator::new()))
    }

    fn info(title: &str) -> PubInfo {
        PubInfo {
            title: title.to_string(),
            ..Default::default()
        }
    }

    fn persistent_config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            data_dir: dir.path().to_string_lossy().into_owned(),
            persist: true,
            sync_interval_ms: 0,
            segment_rows: 4,
        }
    }

    #[test]
    fn test_append_requires_known_pub() {
        let store = store();
        let err = store.append(42, "x", Value::Int(1), 0).unwrap_err();
        assert!(matches!(err, StoreError::UnknownPublisher(42)));
        assert_eq!(err.code(), ErrorCode::UnknownPublisher);
    }

    #[test]
    fn test_append_fixes_field_type() {
        let store = store();
        store.announce_pub(1, &info("a"), &[]).unwrap();
        store.append(1, "x", Value::Int(5), 0).unwrap();

        let err = store
            .append(1, "x", Value::String("five".into()), 1)
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::TypeMismatch {
                expected: ValType::Int,
                got: ValType::String,
                ..
            }
        ));

        let snap = store.snapshot();
        assert_eq!(snap.vals().len(), 1);
        assert_eq!(snap.vals().iter().next().unwrap().value, Value::Int(5));
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let store = store();
        store.announce_pub(1, &info("a"), &[]).unwrap();
        store.append(1, "x", Value::Int(1), 0).unwrap();

        let batch = vec![
            BatchEntry::new("y", Value::Double(2.0)),
            BatchEntry::new("x", Value::Double(3.0)),
        ];
        assert!(store.commit_batch(1, 1, &batch).is_err());

        let snap = store.snapshot();
        assert_eq!(snap.vals().len(), 1);
        // "y" was never created either.
        assert_eq!(snap.fields().len(), 1);
    }

    #[test]
    fn test_reannounce_identical_is_noop() {
        let store = store();
        let decl = [FieldDecl {
            name: "t".into(),
            val_type: ValType::Double,
            semantic: Default::default(),
        }];
        assert!(store.announce_pub(9, &info("sim"), &decl).unwrap());
        assert!(!store.announce_pub(9, &info("sim"), &decl).unwrap());
        assert_eq!(store.manifest().len(), 1);
        assert_eq!(store.snapshot().fields().len(), 1);

        assert!(store.announce_pub(9, &info("sim-renamed"), &decl).unwrap());
        assert_eq!(store.manifest()[0].info.title, "sim-renamed");
    }

    #[test]
    fn test_snapshot_does_not_see_later_commits() {
        let store = store();
        store.announce_pub(1, &info("a"), &[]).unwrap();
        store.append(1, "x", Value::Long(1), 0).unwrap();
        let snap = store.snapshot();
        for frame in 1..10 {
            store.append(1, "x", Value::Long(frame), frame).unwrap();
        }
        assert_eq!(snap.vals().len(), 1);
        assert_eq!(snap.pubs()[0].max_frame, Some(0));
        assert_eq!(store.snapshot().vals().len(), 10);
    }

    #[test]
    fn test_frame_index_range_lookup() {
        let store = store();
        store.announce_pub(1, &info("a"), &[]).unwrap();
        for frame in 0..20 {
            store.append(1, "e", Value::Long(frame), frame).unwrap();
        }
        let hits = store.frame_range(1, "e", 5, 7);
        let frames: Vec<i64> = hits.iter().map(|(f, _)| *f).collect();
        assert_eq!(frames, vec![5, 6, 7]);
        assert!(store.frame_range(1, "missing", 0, 100).is_empty());
    }

    #[test]
    fn test_recent_vals_latest_frames() {
        let store = store();
        store.announce_pub(1, &info("a"), &[]).unwrap();
        store.announce_pub(2, &info("b"), &[]).unwrap();
        for frame in 0..5 {
            store.append(1, "e", Value::Long(frame), frame).unwrap();
        }
        store.append(2, "e", Value::Long(100), 0).unwrap();

        let all_pubs = |_: &PubRecord| true;
        let all_fields = |_: &str| true;
        let latest_two = store.recent_vals(&all_pubs, &all_fields, -1, 2);
        let got: Vec<(Guid, i64)> = latest_two.iter().map(|r| (r.pub_guid, r.frame)).collect();
        assert_eq!(got, vec![(1, 3), (1, 4), (2, 0)]);

        let only_a = |p: &PubRecord| p.info.title == "a";
        let everything = store.recent_vals(&only_a, &all_fields, -1, -1);
        assert_eq!(everything.len(), 5);
    }

    #[test]
    fn test_non_finite_double_rejected() {
        let store = store();
        store.announce_pub(1, &info("a"), &[]).unwrap();
        let err = store.append(1, "x", Value::Double(f64::NAN), 0).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownType);
    }

    #[test]
    fn test_reopen_replays_log() {
        let dir = TempDir::new().unwrap();
        let config = persistent_config(&dir);
        {
            let store = ValueStore::open(&config, Arc::new(GuidAllocator::new())).unwrap();
            store.announce_pub(7, &info("persisted"), &[]).unwrap();
            let batch = vec![
                BatchEntry::new("time", Value::Double(1.0)),
                BatchEntry::new("energy", Value::Double(2.0)),
            ];
            store.commit_batch(7, 0, &batch).unwrap();
            store.append(7, "time", Value::Double(1.5), 1).unwrap();
            store.flush().unwrap();
        }

        let guids = Arc::new(GuidAllocator::new());
        let store = ValueStore::open(&config, Arc::clone(&guids)).unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.pubs().len(), 1);
        assert_eq!(snap.pubs()[0].info.title, "persisted");
        assert_eq!(snap.pubs()[0].max_frame, Some(1));
        assert_eq!(snap.fields().len(), 2);
        assert_eq!(snap.vals().len(), 3);
        assert!(guids.peek() > 7);

        let recovered = store.recovered_pubs();
        assert_eq!(recovered[0].next_frame, 2);
        let time = recovered[0]
            .fields
            .iter()
            .find(|(f, _)| f.name == "time")
            .unwrap();
        assert_eq!(time.1, Some(Value::Double(1.5)));
    }

    #[test]
    fn test_reopen_truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        let config = persistent_config(&dir);
        {
            let store = ValueStore::open(&config, Arc::new(GuidAllocator::new())).unwrap();
            store.announce_pub(1, &info("a"), &[]).unwrap();
            store.append(1, "x", Value::Int(1), 0).unwrap();
        }
        let path = dir.path().join("values.wal");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&[9, 0, 0, 0, 1, 2]);
        std::fs::write(&path, &bytes).unwrap();

        let store = ValueStore::open(&config, Arc::new(GuidAllocator::new())).unwrap();
        assert_eq!(store.snapshot().vals().len(), 1);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            (bytes.len() - 6) as u64
        );
        // Still writable after recovery.
        store.append(1, "x", Value::Int(2), 1).unwrap();
    }

    #[test]
    fn test_reset_clears_everything() {
        let dir = TempDir::new().unwrap();
        let config = persistent_config(&dir);
        let store = ValueStore::open(&config, Arc::new(GuidAllocator::new())).unwrap();
        store.announce_pub(1, &info("a"), &[]).unwrap();
        store.append(1, "x", Value::Int(1), 0).unwrap();

        store.reset().unwrap();
        assert_eq!(store.stats().pubs, 0);
        assert_eq!(store.stats().vals, 0);
        drop(store);

        let reopened = ValueStore::open(&config, Arc::new(GuidAllocator::new())).unwrap();
        assert_eq!(reopened.stats().pubs, 0);
    }

    #[test]
    fn test_frame_regression_rejected() {
        let store = store();
        store.announce_pub(1, &info("a"), &[]).unwrap();
        store.announce_pub(2, &info("b"), &[]).unwrap();
        store.append(1, "x", Value::Int(1), 5).unwrap();
        // Repeating the latest frame is fine; going back is not.
        store.append(1, "y", Value::Int(2), 5).unwrap();

        let err = store.append(1, "x", Value::Int(3), 2).unwrap_err();
        assert!(matches!(
            err,
            StoreError::FrameRegression {
                pub_guid: 1,
                frame: 2,
                latest: 5,
            }
        ));
        assert_eq!(err.code(), ErrorCode::FrameRegression);

        // Frames are tracked per pub.
        store.append(2, "x", Value::Int(4), 0).unwrap();

        let frames: Vec<i64> = store.snapshot().vals().iter().map(|v| v.frame).collect();
        assert_eq!(frames, vec![5, 5, 0]);
        assert_eq!(store.frame_range(1, "x", 0, 10), vec![(5, 1)]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_log_write_failure_faults_store() {
        let dir = TempDir::new().unwrap();
        let config = persistent_config(&dir);
        // Every write to /dev/full fails with ENOSPC.
        std::os::unix::fs::symlink("/dev/full", dir.path().join("values.wal")).unwrap();

        let store = ValueStore::open(&config, Arc::new(GuidAllocator::new())).unwrap();
        let mut fault = store.subscribe_fault();
        assert!(store.fault().is_none());

        let err = store.announce_pub(1, &info("a"), &[]).unwrap_err();
        assert!(matches!(err, StoreError::Wal(_)));
        assert_eq!(err.code(), ErrorCode::StoreIoError);
        assert!(fault.has_changed().unwrap());
        assert!(fault.borrow_and_update().is_some());

        // The fault is sticky and nothing reaches the state.
        let err = store
            .commit_batch(1, 0, &[BatchEntry::new("x", Value::Int(1))])
            .unwrap_err();
        assert!(matches!(err, StoreError::Faulted(_)));
        assert_eq!(err.code(), ErrorCode::StoreIoError);
        assert!(matches!(
            store.announce_pub(2, &info("b"), &[]),
            Err(StoreError::Faulted(_))
        ));
        let stats = store.stats();
        assert_eq!(stats.pubs, 0);
        assert!(stats.fault.is_some());
    }

    #[test]
    fn test_stats() {
        let store = store();
        store.announce_pub(1, &info("a"), &[]).unwrap();
        store.append(1, "x", Value::Int(1), 3).unwrap();
        let stats = store.stats();
        assert_eq!(stats.pubs, 1);
        assert_eq!(stats.fields, 1);
        assert_eq!(stats.vals, 1);
        assert_eq!(stats.max_frame, Some(3));
        assert!(!stats.persistent);
        assert!(stats.fault.is_none());
    }
}
