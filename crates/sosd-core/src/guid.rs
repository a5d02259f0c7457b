//! Daemon-wide GUID allocation.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::types::Guid;

/// A half-open range `[start, end)` of GUIDs handed to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidBlock {
    pub start: Guid,
    pub end: Guid,
}

impl GuidBlock {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, guid: Guid) -> bool {
        guid >= self.start && guid < self.end
    }
}

/// Monotonic allocator shared by every component that mints GUIDs.
///
/// GUID 0 is never issued; clients use it to mean "none".
#[derive(Debug)]
pub struct GuidAllocator {
    next: AtomicU64,
}

impl GuidAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> Guid {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn block(&self, size: u64) -> GuidBlock {
        let start = self.next.fetch_add(size, Ordering::Relaxed);
        GuidBlock {
            start,
            end: start + size,
        }
    }

    /// Make sure `guid` is never issued again. Used when replaying the WAL.
    pub fn observe(&self, guid: Guid) {
        self.next.fetch_max(guid.saturating_add(1), Ordering::Relaxed);
    }

    pub fn peek(&self) -> Guid {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for GuidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guids_are_unique_and_nonzero() {
        let alloc = GuidAllocator::new();
        let a = alloc.next();
        let b = alloc.next();
        assert_ne!(a, 0);
        assert!(b > a);
    }

    #[test]
    fn test_block_does_not_overlap_singles() {
        let alloc = GuidAllocator::new();
        let block = alloc.block(16);
        assert_eq!(block.len(), 16);
        let after = alloc.next();
        assert!(!block.contains(after));
        assert_eq!(after, block.end);
    }

    #[test]
    fn test_observe_skips_past_recovered_guids() {
        let alloc = GuidAllocator::new();
        alloc.observe(500);
        assert_eq!(alloc.next(), 501);
        // Observing something older changes nothing.
        alloc.observe(10);
        assert_eq!(alloc.next(), 502);
    }
}
