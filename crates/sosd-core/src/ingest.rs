//! Ingest handler: validates packs and commits publish batches.
//!
//! A PUBLISH carries the client's packs for one pub. They are applied to
//! the live pub in order (a bad pack is rejected on its own), then every
//! dirty field is committed to the store as one batch at the pub's current
//! frame and the frame counter advances. The pub's mutex is held for the
//! whole sequence, which is what keeps frames monotonic per pub.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{Coded, ErrorCode, WireError};
use crate::registry::{AnnounceOutcome, AnnounceRequest, Pub, PublisherRegistry, RegistryError};
use crate::store::{StoreError, ValueStore};
use crate::types::{Guid, Semantic, Value};

/// Errors that fail a whole ingest request.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("unknown publisher {0}")]
    UnknownPublisher(Guid),

    #[error("publisher {0} has no successful announce in this session")]
    NotAnnounced(Guid),

    #[error("pack {name:?} carries unknown or malformed type code {code}")]
    UnknownType { name: String, code: i32 },

    #[error("daemon is shutting down")]
    ShuttingDown,

    #[error("ingest worker failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Coded for IngestError {
    fn code(&self) -> ErrorCode {
        match self {
            IngestError::UnknownPublisher(_) => ErrorCode::UnknownPublisher,
            IngestError::NotAnnounced(_) => ErrorCode::NotAnnounced,
            IngestError::UnknownType { .. } => ErrorCode::UnknownType,
            IngestError::ShuttingDown => ErrorCode::ShuttingDown,
            IngestError::Worker(_) => ErrorCode::StoreIoError,
            IngestError::Registry(e) => e.code(),
            IngestError::Store(e) => e.code(),
        }
    }
}

/// One client-side pack, as carried in a PUBLISH.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackEntry {
    pub name: String,
    pub type_code: i32,
    pub value: serde_json::Value,
    #[serde(default)]
    pub semantic: Semantic,
    #[serde(default)]
    pub time_pack: f64,
}

impl PackEntry {
    pub fn new(name: impl Into<String>, value: &Value) -> Self {
        Self {
            name: name.into(),
            type_code: value.val_type().code(),
            value: value.to_wire(),
            semantic: Semantic::Default,
            time_pack: crate::types::now_secs(),
        }
    }

    pub fn with_semantic(mut self, semantic: Semantic) -> Self {
        self.semantic = semantic;
        self
    }
}

/// A pack refused while the rest of its publish went ahead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackRejection {
    pub name: String,
    pub error: WireError,
}

/// Outcome of a publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishAck {
    pub pub_guid: Guid,
    /// Frame shared by every committed value.
    pub frame: i64,
    pub committed: usize,
    #[serde(default)]
    pub rejected: Vec<PackRejection>,
}

/// Per-connection ingest state.
#[derive(Debug, Clone, Default)]
pub struct IngestSession {
    pub client_guid: Guid,
    /// Pubs whose last announce in this session failed.
    failed: HashSet<Guid>,
}

impl IngestSession {
    pub fn new(client_guid: Guid) -> Self {
        Self {
            client_guid,
            failed: HashSet::new(),
        }
    }

    pub fn is_blocked(&self, pub_guid: Guid) -> bool {
        self.failed.contains(&pub_guid)
    }
}

pub struct IngestHandler {
    registry: Arc<PublisherRegistry>,
    store: Arc<ValueStore>,
    in_flight: AtomicUsize,
    draining: AtomicBool,
    idle: Notify,
}

/// Counts one publish as in flight for as long as it lives.
struct InFlight<'a> {
    handler: &'a IngestHandler,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.handler.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.handler.idle.notify_waiters();
        }
    }
}

impl IngestHandler {
    pub fn new(registry: Arc<PublisherRegistry>, store: Arc<ValueStore>) -> Self {
        Self {
            registry,
            store,
            in_flight: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            idle: Notify::new(),
        }
    }

    fn enter(&self) -> Result<InFlight<'_>, IngestError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight { handler: self };
        if self.draining.load(Ordering::SeqCst) {
            return Err(IngestError::ShuttingDown);
        }
        Ok(guard)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Refuse new publishes and wait for those already running to commit.
    pub async fn drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let pending = self.in_flight.load(Ordering::SeqCst);
            if pending == 0 {
                break;
            }
            debug!(pending, "Waiting for in-flight publishes");
            notified.await;
        }
        info!("Ingest drained");
    }

    /// Establish or refresh a pub for this session.
    ///
    /// A failure blocks further publishes of that pub from this session
    /// until an announce succeeds.
    pub fn announce(
        &self,
        session: &mut IngestSession,
        req: &AnnounceRequest,
    ) -> Result<AnnounceOutcome, IngestError> {
        if self.is_draining() {
            return Err(IngestError::ShuttingDown);
        }
        match self.registry.announce(req) {
            Ok(outcome) => {
                session.failed.remove(&outcome.guid);
                Ok(outcome)
            }
            Err(e) => {
                if let Some(guid) = req.guid {
                    session.failed.insert(guid);
                }
                warn!(client_guid = session.client_guid, error = %e, "Announce failed");
                Err(e.into())
            }
        }
    }

    /// [`Self::announce`] on the blocking pool, since the store may write
    /// and sync its log. `session` is updated only once the call returns.
    pub async fn offload_announce(
        self: &Arc<Self>,
        session: &mut IngestSession,
        req: AnnounceRequest,
    ) -> Result<AnnounceOutcome, IngestError> {
        let handler = Arc::clone(self);
        let mut detached = session.clone();
        let (detached, result) = tokio::task::spawn_blocking(move || {
            let result = handler.announce(&mut detached, &req);
            (detached, result)
        })
        .await
        .map_err(|e| IngestError::Worker(e.to_string()))?;
        *session = detached;
        result
    }

    /// [`Self::publish`] on the blocking pool. Waiting on the pub's lock
    /// and the log sync never stalls a runtime worker.
    pub async fn offload_publish(
        self: &Arc<Self>,
        session: &IngestSession,
        pub_guid: Guid,
        packs: Vec<PackEntry>,
        time_send: f64,
    ) -> Result<PublishAck, IngestError> {
        let handler = Arc::clone(self);
        let session = session.clone();
        tokio::task::spawn_blocking(move || handler.publish(&session, pub_guid, &packs, time_send))
            .await
            .map_err(|e| IngestError::Worker(e.to_string()))?
    }

    /// Apply one pack to a pub without publishing it.
    pub fn pack(
        &self,
        session: &IngestSession,
        pub_guid: Guid,
        entry: &PackEntry,
    ) -> Result<(), IngestError> {
        if session.is_blocked(pub_guid) {
            return Err(IngestError::NotAnnounced(pub_guid));
        }
        let handle = self
            .registry
            .handle(pub_guid)
            .ok_or(IngestError::UnknownPublisher(pub_guid))?;
        let mut live = handle.lock();
        apply_pack(&mut live, entry)
    }

    /// Apply `packs` in order, then commit every dirty field as one batch.
    pub fn publish(
        &self,
        session: &IngestSession,
        pub_guid: Guid,
        packs: &[PackEntry],
        time_send: f64,
    ) -> Result<PublishAck, IngestError> {
        let _in_flight = self.enter()?;
        if session.is_blocked(pub_guid) {
            return Err(IngestError::NotAnnounced(pub_guid));
        }
        let _gate = self.registry.hold();
        let handle = self
            .registry
            .handle(pub_guid)
            .ok_or(IngestError::UnknownPublisher(pub_guid))?;

        let mut live = handle.lock();
        let mut rejected = Vec::new();
        for entry in packs {
            if let Err(e) = apply_pack(&mut live, entry) {
                debug!(pub_guid, field = %entry.name, error = %e, "Pack rejected");
                rejected.push(PackRejection {
                    name: entry.name.clone(),
                    error: e.to_wire(),
                });
            }
        }

        let frame = live.frame;
        let batch = live.dirty_batch(time_send);
        if batch.is_empty() {
            return Ok(PublishAck {
                pub_guid,
                frame,
                committed: 0,
                rejected,
            });
        }

        let receipt = self.store.commit_batch(pub_guid, frame, &batch)?;
        live.mark_clean();
        live.frame += 1;
        debug!(pub_guid, frame, count = receipt.count, "Publish committed");

        Ok(PublishAck {
            pub_guid,
            frame,
            committed: receipt.count,
            rejected,
        })
    }
}

fn apply_pack(live: &mut Pub, entry: &PackEntry) -> Result<(), IngestError> {
    let value = Value::from_wire(entry.type_code, &entry.value).ok_or_else(|| {
        IngestError::UnknownType {
            name: entry.name.clone(),
            code: entry.type_code,
        }
    })?;
    live.pack(&entry.name, value, entry.semantic, entry.time_pack)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::GuidAllocator;
    use crate::registry::FieldSpec;
    use crate::types::{PubInfo, ValType};
    use pretty_assertions::assert_eq;

    struct Fixture {
        store: Arc<ValueStore>,
        registry: Arc<PublisherRegistry>,
        ingest: IngestHandler,
    }

    fn fixture() -> Fixture {
        let guids = Arc::new(GuidAllocator::new());
        let store = Arc::new(ValueStore::in_memory(64, Arc::clone(&guids)));
        let registry = Arc::new(PublisherRegistry::new(Arc::clone(&store), guids, 16));
        let ingest = IngestHandler::new(Arc::clone(&registry), Arc::clone(&store));
        Fixture {
            store,
            registry,
            ingest,
        }
    }

    fn announce(f: &Fixture, session: &mut IngestSession, title: &str) -> Guid {
        let req = AnnounceRequest {
            guid: None,
            info: PubInfo {
                title: title.into(),
                ..Default::default()
            },
            fields: Vec::new(),
        };
        f.ingest.announce(session, &req).unwrap().guid
    }

    #[test]
    fn test_publish_commits_batch_and_advances_frame() {
        let f = fixture();
        let mut session = IngestSession::new(1);
        let guid = announce(&f, &mut session, "p");

        let packs = vec![
            PackEntry::new("time", &Value::Double(1.0)),
            PackEntry::new("energy", &Value::Double(2.0)),
        ];
        let ack = f.ingest.publish(&session, guid, &packs, 0.0).unwrap();
        assert_eq!(ack.frame, 0);
        assert_eq!(ack.committed, 2);
        assert!(ack.rejected.is_empty());

        let ack = f
            .ingest
            .publish(&session, guid, &[PackEntry::new("time", &Value::Double(1.5))], 0.0)
            .unwrap();
        assert_eq!(ack.frame, 1);
        assert_eq!(ack.committed, 1);

        let snap = f.store.snapshot();
        let frames: Vec<i64> = snap.vals().iter().map(|v| v.frame).collect();
        assert_eq!(frames, vec![0, 0, 1]);
    }

    #[test]
    fn test_bad_pack_rejected_alone() {
        let f = fixture();
        let mut session = IngestSession::new(1);
        let guid = announce(&f, &mut session, "p");

        let packs = vec![
            PackEntry::new("ok", &Value::Int(1)),
            PackEntry {
                name: "weird".into(),
                type_code: 42,
                value: serde_json::json!(1),
                semantic: Semantic::Default,
                time_pack: 0.0,
            },
        ];
        let ack = f.ingest.publish(&session, guid, &packs, 0.0).unwrap();
        assert_eq!(ack.committed, 1);
        assert_eq!(ack.rejected.len(), 1);
        assert_eq!(ack.rejected[0].name, "weird");
        assert_eq!(ack.rejected[0].error.code, ErrorCode::UnknownType);
    }

    #[test]
    fn test_type_conflict_keeps_original_value() {
        let f = fixture();
        let mut session = IngestSession::new(1);
        let guid = announce(&f, &mut session, "p");
        f.ingest
            .publish(&session, guid, &[PackEntry::new("x", &Value::Int(7))], 0.0)
            .unwrap();

        let ack = f
            .ingest
            .publish(
                &session,
                guid,
                &[PackEntry::new("x", &Value::String("seven".into()))],
                0.0,
            )
            .unwrap();
        assert_eq!(ack.committed, 0);
        assert_eq!(ack.rejected[0].error.code, ErrorCode::TypeMismatch);

        let snap = f.store.snapshot();
        assert_eq!(snap.vals().len(), 1);
        assert_eq!(snap.vals().iter().next().unwrap().value, Value::Int(7));
    }

    #[test]
    fn test_pack_then_publish() {
        let f = fixture();
        let mut session = IngestSession::new(1);
        let guid = announce(&f, &mut session, "p");
        f.ingest
            .pack(&session, guid, &PackEntry::new("a", &Value::Long(1)))
            .unwrap();
        let err = f
            .ingest
            .pack(&session, guid, &PackEntry::new("a", &Value::Double(1.0)))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::TypeMismatch);

        let ack = f.ingest.publish(&session, guid, &[], 0.0).unwrap();
        assert_eq!(ack.committed, 1);
    }

    #[test]
    fn test_failed_announce_blocks_session() {
        let f = fixture();
        let mut session = IngestSession::new(1);
        let req = AnnounceRequest {
            guid: None,
            info: PubInfo::default(),
            fields: vec![FieldSpec {
                name: "x".into(),
                type_code: ValType::Int.code(),
                semantic: Semantic::Default,
            }],
        };
        let guid = f.ingest.announce(&mut session, &req).unwrap().guid;

        let mut bad = req.clone();
        bad.guid = Some(guid);
        bad.fields[0].type_code = ValType::String.code();
        assert!(f.ingest.announce(&mut session, &bad).is_err());

        let err = f
            .ingest
            .publish(&session, guid, &[PackEntry::new("x", &Value::Int(1))], 0.0)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotAnnounced);

        // Another session is unaffected.
        let other = IngestSession::new(2);
        assert!(
            f.ingest
                .publish(&other, guid, &[PackEntry::new("x", &Value::Int(1))], 0.0)
                .is_ok()
        );

        // Re-announcing clears the block.
        let mut fixed = req.clone();
        fixed.guid = Some(guid);
        f.ingest.announce(&mut session, &fixed).unwrap();
        assert!(
            f.ingest
                .publish(&session, guid, &[PackEntry::new("x", &Value::Int(2))], 0.0)
                .is_ok()
        );
    }

    #[test]
    fn test_unknown_publisher() {
        let f = fixture();
        let session = IngestSession::new(1);
        let err = f.ingest.publish(&session, 12345, &[], 0.0).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownPublisher);
    }

    #[test]
    fn test_concurrent_publishes_lose_nothing() {
        let f = Arc::new(fixture());
        let mut session = IngestSession::new(1);
        let guids: Vec<Guid> = (0..8)
            .map(|i| announce(&f, &mut session, &format!("p{i}")))
            .collect();

        std::thread::scope(|scope| {
            for &guid in &guids {
                let f = Arc::clone(&f);
                scope.spawn(move || {
                    let session = IngestSession::new(guid);
                    for i in 0..50 {
                        f.ingest
                            .publish(&session, guid, &[PackEntry::new("i", &Value::Long(i))], 0.0)
                            .unwrap();
                    }
                });
            }
        });

        let snap = f.store.snapshot();
        assert_eq!(snap.vals().len(), 8 * 50);
        for guid in guids {
            assert_eq!(f.registry.lookup(guid).unwrap().frame, 50);
        }
    }

    #[test]
    fn test_same_pub_publishes_serialize() {
        let f = Arc::new(fixture());
        let mut session = IngestSession::new(1);
        let guid = announce(&f, &mut session, "shared");

        std::thread::scope(|scope| {
            for t in 0..4 {
                let f = Arc::clone(&f);
                scope.spawn(move || {
                    let session = IngestSession::new(t);
                    for i in 0..25 {
                        f.ingest
                            .publish(&session, guid, &[PackEntry::new("v", &Value::Long(i))], 0.0)
                            .unwrap();
                    }
                });
            }
        });

        let snap = f.store.snapshot();
        let mut frames: Vec<i64> = snap.vals().iter().map(|v| v.frame).collect();
        // Commit order equals frame order.
        let sorted = {
            let mut s = frames.clone();
            s.sort_unstable();
            s
        };
        assert_eq!(frames, sorted);
        frames.dedup();
        assert_eq!(frames.len(), 100);
    }

    #[tokio::test]
    async fn test_drain_rejects_new_publishes() {
        let f = fixture();
        let mut session = IngestSession::new(1);
        let guid = announce(&f, &mut session, "p");

        f.ingest.drain().await;
        assert!(f.ingest.is_draining());
        let err = f
            .ingest
            .publish(&session, guid, &[PackEntry::new("x", &Value::Int(1))], 0.0)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ShuttingDown);
        assert_eq!(f.ingest.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_offloaded_publish_leaves_runtime_free() {
        let f = fixture();
        let ingest = Arc::new(IngestHandler::new(
            Arc::clone(&f.registry),
            Arc::clone(&f.store),
        ));
        let mut session = IngestSession::new(1);
        let req = AnnounceRequest {
            guid: None,
            info: PubInfo {
                title: "offloaded".into(),
                ..Default::default()
            },
            fields: Vec::new(),
        };
        let guid = ingest.offload_announce(&mut session, req).await.unwrap().guid;

        // Another thread holds the pub's lock: the publish parks on the
        // blocking pool while the runtime keeps serving other work.
        let handle = f.registry.handle(guid).unwrap();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = std::thread::spawn(move || {
            let _held = handle.lock();
            locked_tx.send(()).unwrap();
            release_rx.recv().ok();
        });
        locked_rx.recv().unwrap();

        let publish = tokio::spawn({
            let ingest = Arc::clone(&ingest);
            let session = session.clone();
            async move {
                ingest
                    .offload_publish(&session, guid, vec![PackEntry::new("x", &Value::Int(1))], 0.0)
                    .await
            }
        });
        let ticked = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            tokio::time::sleep(std::time::Duration::from_millis(20)),
        )
        .await;
        assert!(ticked.is_ok());
        assert!(!publish.is_finished());

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        let ack = publish.await.unwrap().unwrap();
        assert_eq!(ack.committed, 1);
        assert_eq!(f.store.snapshot().vals().len(), 1);
    }

    #[tokio::test]
    async fn test_offloaded_announce_failure_blocks_session() {
        let f = fixture();
        let ingest = Arc::new(IngestHandler::new(
            Arc::clone(&f.registry),
            Arc::clone(&f.store),
        ));
        let mut session = IngestSession::new(1);
        let spec = FieldSpec {
            name: "x".into(),
            type_code: ValType::Int.code(),
            semantic: Semantic::Default,
        };
        let req = AnnounceRequest {
            guid: None,
            info: PubInfo::default(),
            fields: vec![spec],
        };
        let guid = ingest
            .offload_announce(&mut session, req.clone())
            .await
            .unwrap()
            .guid;

        let mut bad = req;
        bad.guid = Some(guid);
        bad.fields[0].type_code = ValType::String.code();
        assert!(ingest.offload_announce(&mut session, bad).await.is_err());
        assert!(session.is_blocked(guid));
    }
}
