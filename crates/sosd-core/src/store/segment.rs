//! Segmented, append-only value log.
//!
//! Rows accumulate in an open tail. When the tail reaches `segment_rows`
//! it is sealed into an immutable `Arc<[ValRecord]>`. Readers take a
//! [`ValView`] by cloning the sealed `Arc`s and copying the tail, so a
//! snapshot never costs more than one segment's worth of copying.

use std::sync::Arc;

use super::records::ValRecord;

#[derive(Debug)]
pub struct ValLog {
    sealed: Vec<Arc<[ValRecord]>>,
    tail: Vec<ValRecord>,
    segment_rows: usize,
}

impl ValLog {
    pub fn new(segment_rows: usize) -> Self {
        let segment_rows = segment_rows.max(1);
        Self {
            sealed: Vec::new(),
            tail: Vec::with_capacity(segment_rows),
            segment_rows,
        }
    }

    pub fn len(&self) -> usize {
        self.sealed.len() * self.segment_rows + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row id the next pushed record will receive. Row ids start at 1.
    pub fn next_row_id(&self) -> u64 {
        self.len() as u64 + 1
    }

    pub fn push(&mut self, record: ValRecord) {
        self.tail.push(record);
        if self.tail.len() >= self.segment_rows {
            let full = std::mem::replace(&mut self.tail, Vec::with_capacity(self.segment_rows));
            self.sealed.push(full.into());
        }
    }

    pub fn get(&self, row_id: u64) -> Option<&ValRecord> {
        let idx = usize::try_from(row_id.checked_sub(1)?).ok()?;
        let seg = idx / self.segment_rows;
        if seg < self.sealed.len() {
            self.sealed[seg].get(idx % self.segment_rows)
        } else {
            self.tail.get(idx - self.sealed.len() * self.segment_rows)
        }
    }

    pub fn sealed_segments(&self) -> usize {
        self.sealed.len()
    }

    pub fn view(&self) -> ValView {
        ValView {
            sealed: self.sealed.clone(),
            tail: Arc::from(self.tail.as_slice()),
        }
    }

    pub fn clear(&mut self) {
        self.sealed.clear();
        self.tail.clear();
    }
}

/// Immutable view of the value log at one instant.
#[derive(Debug, Clone)]
pub struct ValView {
    sealed: Vec<Arc<[ValRecord]>>,
    tail: Arc<[ValRecord]>,
}

impl ValView {
    pub fn empty() -> Self {
        Self {
            sealed: Vec::new(),
            tail: Arc::from(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.sealed.iter().map(|s| s.len()).sum::<usize>() + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValRecord> {
        self.sealed
            .iter()
            .flat_map(|s| s.iter())
            .chain(self.tail.iter())
    }
}
