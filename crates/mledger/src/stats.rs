//! Per-ledger operation counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Ledger statistics for monitoring
#[derive(Debug, Default)]
pub struct LedgerStats {
    /// Entries confirmed by the segment store
    pub adds_succeeded: AtomicU64,
    /// Adds completed with an error (timeouts included)
    pub adds_failed: AtomicU64,
    /// Payload bytes confirmed
    pub bytes_added: AtomicU64,
    /// Entries handed to readers
    pub entries_read: AtomicU64,
    /// Segment reads that failed
    pub read_failures: AtomicU64,
    /// Completed segment rollovers
    pub rollovers: AtomicU64,
    /// Completed trim passes that removed at least one segment
    pub trims: AtomicU64,
    /// Segments removed by trimming or discarding
    pub segments_deleted: AtomicU64,
}

impl LedgerStats {
    pub(crate) fn incr(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Reset all statistics
    pub fn reset(&self) {
        for counter in [
            &self.adds_succeeded,
            &self.adds_failed,
            &self.bytes_added,
            &self.entries_read,
            &self.read_failures,
            &self.rollovers,
            &self.trims,
            &self.segments_deleted,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
