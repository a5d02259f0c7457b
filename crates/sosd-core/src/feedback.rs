//! Feedback channel: daemon-initiated notifications to sensitive sessions.
//!
//! A session declares sensitivity to a named handle. Firing a trigger on
//! that handle queues a [`Feedback`] on every sensitive session's outbound
//! queue; the connection's writer pushes it to the client as a FEEDBACK
//! frame alongside ordinary replies.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::guid::GuidAllocator;
use crate::types::Guid;

/// One notification delivered to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub handle: String,
    pub payload: String,
    /// Session or daemon component that fired the trigger.
    pub source_guid: Guid,
    pub trigger_guid: Guid,
}

pub struct FeedbackHub {
    sessions: DashMap<Guid, mpsc::Sender<Feedback>>,
    sensitivities: DashMap<String, HashSet<Guid>>,
    guids: Arc<GuidAllocator>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl FeedbackHub {
    pub fn new(guids: Arc<GuidAllocator>) -> Self {
        Self {
            sessions: DashMap::new(),
            sensitivities: DashMap::new(),
            guids,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Attach a session's outbound queue.
    pub fn connect(&self, session: Guid, tx: mpsc::Sender<Feedback>) {
        self.sessions.insert(session, tx);
    }

    /// Detach a session and forget all of its sensitivities.
    pub fn disconnect(&self, session: Guid) {
        self.sessions.remove(&session);
        self.sensitivities.retain(|_, sessions| {
            sessions.remove(&session);
            !sessions.is_empty()
        });
    }

    /// Returns false when the session was already sensitive to `handle`.
    pub fn sense(&self, session: Guid, handle: &str) -> bool {
        let added = self
            .sensitivities
            .entry(handle.to_string())
            .or_default()
            .insert(session);
        if added {
            debug!(session, handle, "Sensitivity registered");
        }
        added
    }

    pub fn desensitize(&self, session: Guid, handle: &str) -> bool {
        let removed = self
            .sensitivities
            .get_mut(handle)
            .is_some_and(|mut sessions| sessions.remove(&session));
        self.sensitivities.remove_if(handle, |_, sessions| sessions.is_empty());
        removed
    }

    /// Sessions currently sensitive to `handle`.
    pub fn listeners(&self, handle: &str) -> usize {
        self.sensitivities.get(handle).map_or(0, |s| s.len())
    }

    /// Deliver `payload` to every session sensitive to `handle`.
    ///
    /// Returns how many sessions accepted it. A session whose queue is full
    /// or closed misses this notification.
    pub fn fire(&self, source: Guid, handle: &str, payload: &str) -> usize {
        let targets: Vec<Guid> = match self.sensitivities.get(handle) {
            Some(sessions) => sessions.iter().copied().collect(),
            None => return 0,
        };
        let feedback = Feedback {
            handle: handle.to_string(),
            payload: payload.to_string(),
            source_guid: source,
            trigger_guid: self.guids.next(),
        };

        let mut delivered = 0;
        for session in targets {
            let Some(tx) = self.sessions.get(&session).map(|tx| tx.clone()) else {
                continue;
            };
            match tx.try_send(feedback.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(session, handle, "Feedback queue full, notification dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        debug!(source, handle, delivered, trigger_guid = feedback.trigger_guid, "Trigger fired");
        delivered
    }

    /// (delivered, dropped) totals since startup.
    pub fn totals(&self) -> (u64, u64) {
        (
            self.delivered.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn hub() -> FeedbackHub {
        FeedbackHub::new(Arc::new(GuidAllocator::new()))
    }

    #[tokio::test]
    async fn test_fire_reaches_sensitive_sessions() {
        let hub = hub();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        hub.connect(10, tx_a);
        hub.connect(20, tx_b);

        assert!(hub.sense(10, "steer"));
        assert!(!hub.sense(10, "steer"));
        assert_eq!(hub.listeners("steer"), 1);

        assert_eq!(hub.fire(99, "steer", "dt=0.5"), 1);
        let fb = rx_a.recv().await.unwrap();
        assert_eq!(fb.handle, "steer");
        assert_eq!(fb.payload, "dt=0.5");
        assert_eq!(fb.source_guid, 99);
        assert!(rx_b.try_recv().is_err());
        assert_eq!(hub.fire(99, "nobody", "x"), 0);
    }

    #[tokio::test]
    async fn test_disconnect_drops_sensitivities() {
        let hub = hub();
        let (tx, _rx) = mpsc::channel(4);
        hub.connect(10, tx);
        hub.sense(10, "a");
        hub.sense(10, "b");
        hub.disconnect(10);
        assert_eq!(hub.listeners("a"), 0);
        assert_eq!(hub.fire(1, "a", ""), 0);
    }

    #[tokio::test]
    async fn test_desensitize_and_full_queue() {
        let hub = hub();
        let (tx, mut rx) = mpsc::channel(1);
        hub.connect(10, tx);
        hub.sense(10, "h");

        assert_eq!(hub.fire(1, "h", "first"), 1);
        assert_eq!(hub.fire(1, "h", "second"), 0);
        assert_eq!(hub.totals(), (1, 1));
        assert_eq!(rx.recv().await.unwrap().payload, "first");

        assert!(hub.desensitize(10, "h"));
        assert!(!hub.desensitize(10, "h"));
        assert_eq!(hub.fire(1, "h", "third"), 0);
    }
}
