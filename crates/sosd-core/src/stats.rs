//! Daemon-wide counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct DaemonStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub messages: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub publishes: AtomicU64,
    pub vals: AtomicU64,
    pub queries: AtomicU64,
    pub query_failures: AtomicU64,
    pub triggers: AtomicU64,
    pub protocol_errors: AtomicU64,
}

/// Point-in-time copy of [`DaemonStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub messages: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub publishes: u64,
    pub vals: u64,
    pub queries: u64,
    pub query_failures: u64,
    pub triggers: u64,
    pub feedback_delivered: u64,
    pub protocol_errors: u64,
}

impl DaemonStats {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn connection_opened(&self) {
        Self::incr(&self.connections_total);
        Self::incr(&self.connections_active);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// `feedback_delivered` comes from the feedback hub.
    pub fn snapshot(&self, feedback_delivered: u64) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            connections_total: load(&self.connections_total),
            connections_active: load(&self.connections_active),
            messages: load(&self.messages),
            bytes_in: load(&self.bytes_in),
            bytes_out: load(&self.bytes_out),
            publishes: load(&self.publishes),
            vals: load(&self.vals),
            queries: load(&self.queries),
            query_failures: load(&self.query_failures),
            triggers: load(&self.triggers),
            feedback_delivered,
            protocol_errors: load(&self.protocol_errors),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_gauge() {
        let stats = DaemonStats::default();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        DaemonStats::add(&stats.vals, 5);
        let snap = stats.snapshot(2);
        assert_eq!(snap.connections_total, 2);
        assert_eq!(snap.connections_active, 1);
        assert_eq!(snap.vals, 5);
        assert_eq!(snap.feedback_delivered, 2);
    }
}
