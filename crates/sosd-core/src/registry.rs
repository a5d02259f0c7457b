//! Publisher registry: live per-pub state and GUID issuance.
//!
//! Each pub sits behind its own mutex, so announces and publishes for the
//! same pub serialize while unrelated pubs proceed in parallel. The
//! registry writes pub metadata through to the value store, which is the
//! source of truth for manifests.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Coded, ErrorCode};
use crate::guid::{GuidAllocator, GuidBlock};
use crate::store::{BatchEntry, FieldDecl, StoreError, ValueStore};
use crate::types::{Guid, PubInfo, Semantic, ValType, Value};

/// Errors from the publisher registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("field {name:?} declares unknown type code {code}")]
    UnknownType { name: String, code: i32 },

    #[error("field {name:?} is {expected}, cannot become {got}")]
    TypeMismatch {
        name: String,
        expected: ValType,
        got: ValType,
    },

    #[error("no publisher with guid {0}")]
    NotFound(Guid),

    #[error("invalid manifest filter: {0}")]
    InvalidFilter(#[from] regex::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Coded for RegistryError {
    fn code(&self) -> ErrorCode {
        match self {
            RegistryError::UnknownType { .. } => ErrorCode::UnknownType,
            RegistryError::TypeMismatch { .. } => ErrorCode::TypeMismatch,
            RegistryError::NotFound(_) => ErrorCode::UnknownPublisher,
            RegistryError::InvalidFilter(_) => ErrorCode::QuerySyntaxError,
            RegistryError::Store(e) => e.code(),
        }
    }
}

/// A field as declared on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub type_code: i32,
    #[serde(default)]
    pub semantic: Semantic,
}

/// Announce payload: establish or refresh a pub and its declared fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnounceRequest {
    /// Existing pub to refresh. Absent or unknown creates a new pub.
    #[serde(default)]
    pub guid: Option<Guid>,
    #[serde(default)]
    pub info: PubInfo,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceOutcome {
    pub guid: Guid,
    pub created: bool,
    pub changed: bool,
    /// Frame the next publish of this pub will use.
    pub frame: i64,
}

/// Client identification sent with REGISTER.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientInfo {
    pub role: String,
    pub prog_name: String,
    pub node_id: String,
    pub process_id: i64,
    pub comm_rank: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub client_guid: Guid,
    pub guid_block: GuidBlock,
}

/// One line of the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub pub_guid: Guid,
    pub title: String,
    pub prog_name: String,
    pub comm_rank: i64,
    pub node_id: String,
    pub max_frame: Option<i64>,
}

/// Read-only view of a live pub.
#[derive(Debug, Clone, PartialEq)]
pub struct PubSummary {
    pub guid: Guid,
    pub info: PubInfo,
    pub frame: i64,
    pub fields: Vec<(String, ValType)>,
}

/// A field slot inside a live pub.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSlot {
    pub name: String,
    pub val_type: ValType,
    pub semantic: Semantic,
    pub value: Option<Value>,
    pub dirty: bool,
    pub time_pack: f64,
}

/// Live state of one publisher.
#[derive(Debug)]
pub struct Pub {
    pub guid: Guid,
    pub info: PubInfo,
    pub frame: i64,
    fields: Vec<FieldSlot>,
    by_name: HashMap<String, usize>,
}

impl Pub {
    fn new(guid: Guid, info: PubInfo) -> Self {
        Self {
            guid,
            info,
            frame: 0,
            fields: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSlot> {
        self.by_name.get(name).map(|&i| &self.fields[i])
    }

    pub fn fields(&self) -> &[FieldSlot] {
        &self.fields
    }

    fn declare(&mut self, decl: &FieldDecl) {
        if self.by_name.contains_key(&decl.name) {
            return;
        }
        self.by_name.insert(decl.name.clone(), self.fields.len());
        self.fields.push(FieldSlot {
            name: decl.name.clone(),
            val_type: decl.val_type,
            semantic: decl.semantic,
            value: None,
            dirty: false,
            time_pack: 0.0,
        });
    }

    /// Set a field's current value and mark it dirty.
    ///
    /// The first pack of a name fixes its type.
    pub fn pack(
        &mut self,
        name: &str,
        value: Value,
        semantic: Semantic,
        time_pack: f64,
    ) -> Result<(), RegistryError> {
        let got = value.val_type();
        if let Some(&idx) = self.by_name.get(name) {
            let slot = &mut self.fields[idx];
            if slot.val_type != got {
                return Err(RegistryError::TypeMismatch {
                    name: name.to_string(),
                    expected: slot.val_type,
                    got,
                });
            }
            slot.value = Some(value);
            slot.semantic = semantic;
            slot.dirty = true;
            slot.time_pack = time_pack;
            return Ok(());
        }

        self.by_name.insert(name.to_string(), self.fields.len());
        self.fields.push(FieldSlot {
            name: name.to_string(),
            val_type: got,
            semantic,
            value: Some(value),
            dirty: true,
            time_pack,
        });
        Ok(())
    }

    /// Dirty fields as a batch for the store.
    pub fn dirty_batch(&self, time_send: f64) -> Vec<BatchEntry> {
        self.fields
            .iter()
            .filter(|f| f.dirty)
            .filter_map(|f| {
                f.value.as_ref().map(|v| BatchEntry {
                    name: f.name.clone(),
                    value: v.clone(),
                    semantic: f.semantic,
                    time_pack: f.time_pack,
                    time_send,
                })
            })
            .collect()
    }

    pub fn mark_clean(&mut self) {
        self.fields.iter_mut().for_each(|f| f.dirty = false);
    }

    fn summary(&self) -> PubSummary {
        PubSummary {
            guid: self.guid,
            info: self.info.clone(),
            frame: self.frame,
            fields: self
                .fields
                .iter()
                .map(|f| (f.name.clone(), f.val_type))
                .collect(),
        }
    }
}

pub struct PublisherRegistry {
    pubs: DashMap<Guid, Arc<Mutex<Pub>>>,
    /// Read-held across announce and publish; write-held by [`Self::reset`].
    reset_gate: RwLock<()>,
    store: Arc<ValueStore>,
    guids: Arc<GuidAllocator>,
    block_size: u64,
}

impl PublisherRegistry {
    pub fn new(store: Arc<ValueStore>, guids: Arc<GuidAllocator>, block_size: u64) -> Self {
        Self {
            pubs: DashMap::new(),
            reset_gate: RwLock::new(()),
            store,
            guids,
            block_size: block_size.max(1),
        }
    }

    /// Rebuild live pubs from whatever the store recovered.
    pub fn restore(&self) -> usize {
        let recovered = self.store.recovered_pubs();
        let count = recovered.len();
        for rec in recovered {
            let mut live = Pub::new(rec.guid, rec.info);
            live.frame = rec.next_frame;
            for (field, last) in rec.fields {
                live.declare(&FieldDecl {
                    name: field.name.clone(),
                    val_type: field.val_type,
                    semantic: field.semantic,
                });
                if let Some(&idx) = live.by_name.get(&field.name) {
                    live.fields[idx].value = last;
                }
            }
            self.pubs.insert(rec.guid, Arc::new(Mutex::new(live)));
        }
        if count > 0 {
            info!(pubs = count, "Publisher registry restored from store");
        }
        count
    }

    pub fn register_client(&self, client: &ClientInfo) -> Registration {
        let registration = Registration {
            client_guid: self.guids.next(),
            guid_block: self.guids.block(self.block_size),
        };
        info!(
            client_guid = registration.client_guid,
            prog_name = %client.prog_name,
            comm_rank = client.comm_rank,
            role = %client.role,
            "Client registered"
        );
        registration
    }

    pub fn guid_block(&self) -> GuidBlock {
        self.guids.block(self.block_size)
    }

    /// Create a pub or refresh an existing one.
    ///
    /// All declared fields are validated before anything changes; a type
    /// conflict with an existing field fails the whole announce.
    pub fn announce(&self, req: &AnnounceRequest) -> Result<AnnounceOutcome, RegistryError> {
        let decls = req
            .fields
            .iter()
            .map(|spec| {
                ValType::from_code(spec.type_code)
                    .map(|val_type| FieldDecl {
                        name: spec.name.clone(),
                        val_type,
                        semantic: spec.semantic,
                    })
                    .ok_or_else(|| RegistryError::UnknownType {
                        name: spec.name.clone(),
                        code: spec.type_code,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let _gate = self.hold();
        let existing = req
            .guid
            .filter(|&g| g != 0)
            .and_then(|g| self.pubs.get(&g).map(|e| Arc::clone(e.value())));

        match existing {
            Some(handle) => {
                let mut live = handle.lock();
                for decl in &decls {
                    if let Some(slot) = live.field(&decl.name)
                        && slot.val_type != decl.val_type
                    {
                        return Err(RegistryError::TypeMismatch {
                            name: decl.name.clone(),
                            expected: slot.val_type,
                            got: decl.val_type,
                        });
                    }
                }
                let changed = self.store.announce_pub(live.guid, &req.info, &decls)?;
                live.info = req.info.clone();
                decls.iter().for_each(|d| live.declare(d));
                debug!(pub_guid = live.guid, changed, "Pub re-announced");
                Ok(AnnounceOutcome {
                    guid: live.guid,
                    created: false,
                    changed,
                    frame: live.frame,
                })
            }
            None => {
                let guid = self.guids.next();
                let mut live = Pub::new(guid, req.info.clone());
                self.store.announce_pub(guid, &req.info, &decls)?;
                decls.iter().for_each(|d| live.declare(d));
                self.pubs.insert(guid, Arc::new(Mutex::new(live)));
                info!(pub_guid = guid, title = %req.info.title, "Pub announced");
                Ok(AnnounceOutcome {
                    guid,
                    created: true,
                    changed: true,
                    frame: 0,
                })
            }
        }
    }

    /// Keeps [`Self::reset`] out until the guard drops. Store writes made
    /// together with a registry change run under it.
    pub fn hold(&self) -> RwLockReadGuard<'_, ()> {
        self.reset_gate.read()
    }

    /// Handle to the live pub, for callers that need to hold its lock.
    pub fn handle(&self, guid: Guid) -> Option<Arc<Mutex<Pub>>> {
        self.pubs.get(&guid).map(|e| Arc::clone(e.value()))
    }

    pub fn lookup(&self, guid: Guid) -> Result<PubSummary, RegistryError> {
        let handle = self.handle(guid).ok_or(RegistryError::NotFound(guid))?;
        let summary = handle.lock().summary();
        Ok(summary)
    }

    /// Pubs with their max observed frame, optionally filtered by a regex
    /// over title or program name.
    pub fn list_manifest(&self, filter: Option<&str>) -> Result<Vec<ManifestEntry>, RegistryError> {
        let filter = match filter.filter(|f| !f.is_empty()) {
            Some(f) => Some(Regex::new(f)?),
            None => None,
        };
        Ok(self
            .store
            .manifest()
            .into_iter()
            .filter(|p| {
                filter
                    .as_ref()
                    .is_none_or(|re| re.is_match(&p.info.title) || re.is_match(&p.info.prog_name))
            })
            .map(|p| ManifestEntry {
                pub_guid: p.guid,
                title: p.info.title,
                prog_name: p.info.prog_name,
                comm_rank: p.info.comm_rank,
                node_id: p.info.node_id,
                max_frame: p.max_frame,
            })
            .collect())
    }

    pub fn len(&self) -> usize {
        self.pubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pubs.is_empty()
    }

    /// Administrative reset: empty the store and forget every live pub as
    /// one step. No announce or publish is in progress while it runs.
    pub fn reset(&self) -> Result<(), StoreError> {
        let _gate = self.reset_gate.write();
        self.store.reset()?;
        self.pubs.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry() -> PublisherRegistry {
        let guids = Arc::new(GuidAllocator::new());
        let store = Arc::new(ValueStore::in_memory(16, Arc::clone(&guids)));
        PublisherRegistry::new(store, guids, 8)
    }

    fn announce(title: &str, fields: &[(&str, i32)]) -> AnnounceRequest {
        AnnounceRequest {
            guid: None,
            info: PubInfo {
                title: title.to_string(),
                prog_name: "lulesh".to_string(),
                ..Default::default()
            },
            fields: fields
                .iter()
                .map(|(name, code)| FieldSpec {
                    name: name.to_string(),
                    type_code: *code,
                    semantic: Semantic::Default,
                })
                .collect(),
        }
    }

    #[test]
    fn test_announce_creates_pub() {
        let reg = registry();
        let out = reg.announce(&announce("rank0", &[("time", 2)])).unwrap();
        assert!(out.created);
        assert_eq!(out.frame, 0);

        let summary = reg.lookup(out.guid).unwrap();
        assert_eq!(summary.info.title, "rank0");
        assert_eq!(summary.fields, vec![("time".to_string(), ValType::Double)]);
    }

    #[test]
    fn test_unknown_guid_allocates_new() {
        let reg = registry();
        let mut req = announce("x", &[]);
        req.guid = Some(999_999);
        let out = reg.announce(&req).unwrap();
        assert!(out.created);
        assert_ne!(out.guid, 999_999);
    }

    #[test]
    fn test_reannounce_is_idempotent() {
        let reg = registry();
        let first = reg.announce(&announce("rank0", &[("time", 2)])).unwrap();
        let mut again = announce("rank0", &[("time", 2)]);
        again.guid = Some(first.guid);

        let second = reg.announce(&again).unwrap();
        assert_eq!(second.guid, first.guid);
        assert!(!second.created);
        assert!(!second.changed);

        let third = reg.announce(&again).unwrap();
        assert!(!third.changed);
        assert_eq!(reg.list_manifest(None).unwrap().len(), 1);
    }

    #[test]
    fn test_announce_type_conflict_fails_without_mutation() {
        let reg = registry();
        let first = reg.announce(&announce("old", &[("x", 0)])).unwrap();

        let mut conflicting = announce("new-title", &[("y", 2), ("x", 3)]);
        conflicting.guid = Some(first.guid);
        let err = reg.announce(&conflicting).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TypeMismatch);

        let summary = reg.lookup(first.guid).unwrap();
        assert_eq!(summary.info.title, "old");
        assert_eq!(summary.fields.len(), 1);
    }

    #[test]
    fn test_announce_unknown_type_code() {
        let reg = registry();
        let err = reg.announce(&announce("p", &[("bad", 17)])).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownType { code: 17, .. }));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_pack_fixes_type() {
        let mut live = Pub::new(1, PubInfo::default());
        live.pack("x", Value::Int(1), Semantic::Default, 0.0).unwrap();
        let err = live
            .pack("x", Value::String("1".into()), Semantic::Default, 0.0)
            .unwrap_err();
        assert!(matches!(err, RegistryError::TypeMismatch { .. }));
        assert_eq!(live.field("x").unwrap().value, Some(Value::Int(1)));
    }

    #[test]
    fn test_dirty_batch_and_clean() {
        let mut live = Pub::new(1, PubInfo::default());
        live.pack("a", Value::Long(1), Semantic::Counter, 1.0).unwrap();
        live.pack("b", Value::Long(2), Semantic::Default, 1.0).unwrap();
        assert_eq!(live.dirty_batch(2.0).len(), 2);
        live.mark_clean();
        assert!(live.dirty_batch(2.0).is_empty());
        live.pack("b", Value::Long(3), Semantic::Default, 3.0).unwrap();
        let batch = live.dirty_batch(4.0);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].name, "b");
        assert_eq!(batch[0].time_send, 4.0);
    }

    #[test]
    fn test_manifest_filter() {
        let reg = registry();
        reg.announce(&announce("alpha", &[])).unwrap();
        reg.announce(&announce("beta", &[])).unwrap();
        let hits = reg.list_manifest(Some("^al")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "alpha");
        assert!(reg.list_manifest(Some("(")).is_err());
        assert_eq!(reg.list_manifest(Some("")).unwrap().len(), 2);
    }

    #[test]
    fn test_register_hands_out_disjoint_blocks() {
        let reg = registry();
        let a = reg.register_client(&ClientInfo::default());
        let b = reg.register_client(&ClientInfo::default());
        assert_eq!(a.guid_block.len(), 8);
        assert!(!a.guid_block.contains(b.client_guid));
        assert!(b.guid_block.start >= a.guid_block.end);
        let extra = reg.guid_block();
        assert!(extra.start >= b.guid_block.end);
    }

    #[test]
    fn test_restore_rebuilds_frames() {
        let guids = Arc::new(GuidAllocator::new());
        let store = Arc::new(ValueStore::in_memory(16, Arc::clone(&guids)));
        store.announce_pub(5, &PubInfo::default(), &[]).unwrap();
        store.append(5, "t", Value::Double(0.5), 0).unwrap();
        store.append(5, "t", Value::Double(1.5), 1).unwrap();

        let reg = PublisherRegistry::new(store, guids, 8);
        assert_eq!(reg.restore(), 1);
        let summary = reg.lookup(5).unwrap();
        assert_eq!(summary.frame, 2);
        let handle = reg.handle(5).unwrap();
        assert_eq!(
            handle.lock().field("t").unwrap().value,
            Some(Value::Double(1.5))
        );
    }

    #[test]
    fn test_reset_waits_for_in_progress_writes() {
        let reg = Arc::new(registry());
        let first = reg.announce(&announce("a", &[])).unwrap();

        let gate = reg.hold();
        let resetter = {
            let reg = Arc::clone(&reg);
            std::thread::spawn(move || reg.reset())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(reg.handle(first.guid).is_some());
        assert_eq!(reg.list_manifest(None).unwrap().len(), 1);

        drop(gate);
        resetter.join().unwrap().unwrap();
        assert!(reg.is_empty());
        assert!(reg.list_manifest(None).unwrap().is_empty());

        // Registry and store agree on what came after.
        let second = reg.announce(&announce("b", &[])).unwrap();
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.list_manifest(None).unwrap()[0].pub_guid, second.guid);
    }
}
