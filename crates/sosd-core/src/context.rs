//! The daemon context: every shared component, built once and handed to
//! each connection and admin handler as an `Arc`.
//!
//! ```text
//!   Init ──▶ Running ──▶ Draining ──▶ Stopped
//! ```

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sosd_config::AppConfig;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::feedback::FeedbackHub;
use crate::guid::GuidAllocator;
use crate::ingest::IngestHandler;
use crate::protocol::ProbeReply;
use crate::query::QueryEngine;
use crate::registry::PublisherRegistry;
use crate::stats::DaemonStats;
use crate::store::{StoreError, ValueStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Init,
    Running,
    Draining,
    Stopped,
}

pub struct SosContext {
    pub config: AppConfig,
    pub guids: Arc<GuidAllocator>,
    pub store: Arc<ValueStore>,
    pub registry: Arc<PublisherRegistry>,
    pub ingest: Arc<IngestHandler>,
    pub query: Arc<QueryEngine>,
    pub feedback: Arc<FeedbackHub>,
    pub stats: DaemonStats,
    lifecycle: watch::Sender<Lifecycle>,
    shutdown: CancellationToken,
    started_at: Instant,
}

impl SosContext {
    /// Open the store (replaying its log) and wire every component to it.
    pub fn open(config: AppConfig) -> Result<Self, StoreError> {
        let guids = Arc::new(GuidAllocator::new());
        let store = Arc::new(ValueStore::open(&config.store, Arc::clone(&guids))?);
        let registry = Arc::new(PublisherRegistry::new(
            Arc::clone(&store),
            Arc::clone(&guids),
            config.daemon.guid_block_size,
        ));
        registry.restore();
        let ingest = Arc::new(IngestHandler::new(
            Arc::clone(&registry),
            Arc::clone(&store),
        ));
        let query = Arc::new(QueryEngine::new(
            Arc::clone(&store),
            Arc::clone(&guids),
            &config.query,
        ));
        let feedback = Arc::new(FeedbackHub::new(Arc::clone(&guids)));
        let (lifecycle, _) = watch::channel(Lifecycle::Init);

        Ok(Self {
            config,
            guids,
            store,
            registry,
            ingest,
            query,
            feedback,
            stats: DaemonStats::default(),
            lifecycle,
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        })
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    pub fn subscribe_lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    /// Advance the lifecycle. Moving backwards is ignored.
    pub(crate) fn advance(&self, next: Lifecycle) -> bool {
        let moved = self.lifecycle.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
        if moved {
            info!(lifecycle = ?next, "Daemon lifecycle changed");
        }
        moved
    }

    /// Ask the daemon to drain and stop. Returns false if already asked.
    pub fn request_shutdown(&self, reason: &str) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        warn!(reason, "Shutdown requested");
        self.shutdown.cancel();
        true
    }

    /// Fires once shutdown has been requested.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Whether a wire SHUTDOWN carrying `token` is allowed.
    pub fn authorize_shutdown(&self, token: Option<&str>) -> bool {
        match &self.config.daemon.shutdown_token {
            Some(expected) => token == Some(expected.as_str()),
            None => true,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn probe(&self) -> ProbeReply {
        let store = self.store.stats();
        let (queued, _) = self.query.jobs().counts();
        let (delivered, _) = self.feedback.totals();
        let counters = self.stats.snapshot(delivered);
        ProbeReply {
            version: crate::build_info::version_string(),
            lifecycle: self.lifecycle(),
            uptime_secs: self.uptime_secs(),
            pubs: store.pubs,
            fields: store.fields,
            vals: store.vals,
            max_frame: store.max_frame,
            active_connections: counters.connections_active,
            queued_queries: queued,
            executing_queries: self.query.executing(),
            persistent: store.persistent,
            fault: store.fault,
            counters,
        }
    }

    /// Administrative reset: drop all pubs, fields, and values.
    pub fn reset(&self) -> Result<(), StoreError> {
        self.registry.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BatchEntry;
    use crate::types::{PubInfo, Value};
    use pretty_assertions::assert_eq;

    fn memory_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.store.persist = false;
        config
    }

    #[test]
    fn test_lifecycle_only_moves_forward() {
        let ctx = SosContext::open(memory_config()).unwrap();
        assert_eq!(ctx.lifecycle(), Lifecycle::Init);
        assert!(ctx.advance(Lifecycle::Running));
        assert!(ctx.advance(Lifecycle::Draining));
        assert!(!ctx.advance(Lifecycle::Running));
        assert_eq!(ctx.lifecycle(), Lifecycle::Draining);
    }

    #[test]
    fn test_shutdown_request_and_authorization() {
        let mut config = memory_config();
        config.daemon.shutdown_token = Some("s3cret".into());
        let ctx = SosContext::open(config).unwrap();
        assert!(!ctx.authorize_shutdown(None));
        assert!(!ctx.authorize_shutdown(Some("guess")));
        assert!(ctx.authorize_shutdown(Some("s3cret")));

        assert!(ctx.request_shutdown("test"));
        assert!(!ctx.request_shutdown("again"));
        assert!(ctx.shutdown_token().is_cancelled());
    }

    #[test]
    fn test_probe_and_reset() {
        let ctx = SosContext::open(memory_config()).unwrap();
        ctx.store.announce_pub(500, &PubInfo::default(), &[]).unwrap();
        ctx.store
            .commit_batch(500, 0, &[BatchEntry::new("x", Value::Int(1))])
            .unwrap();

        let probe = ctx.probe();
        assert_eq!(probe.pubs, 1);
        assert_eq!(probe.vals, 1);
        assert_eq!(probe.max_frame, Some(0));
        assert!(!probe.persistent);

        ctx.reset().unwrap();
        assert_eq!(ctx.probe().vals, 0);
        assert!(ctx.registry.is_empty());
    }

    #[test]
    fn test_reopen_restores_publishers() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.store.data_dir = dir.path().display().to_string();

        let guid = {
            let ctx = SosContext::open(config.clone()).unwrap();
            let outcome = ctx
                .registry
                .announce(&crate::registry::AnnounceRequest::default())
                .unwrap();
            ctx.store
                .commit_batch(outcome.guid, 0, &[BatchEntry::new("x", Value::Int(1))])
                .unwrap();
            ctx.store.flush().unwrap();
            outcome.guid
        };

        let ctx = SosContext::open(config).unwrap();
        assert_eq!(ctx.registry.lookup(guid).unwrap().frame, 1);
        assert!(ctx.guids.peek() > guid);
    }
}
