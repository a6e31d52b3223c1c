//! Entry cache
//!
//! Each ledger owns an [`EntryCache`] of recently added or read entries,
//! keyed by position. The ledger evicts entries its active cursors have
//! moved past. The process-wide [`EntryCacheManager`] enforces a global
//! memory budget across all caches, evicting the oldest insertions first.

use bytes::Bytes;
use dashmap::DashMap;
use mledger_common::{Position, SegmentId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: AtomicU64,
    /// Number of cache misses
    pub misses: AtomicU64,
    /// Number of entries inserted
    pub inserted: AtomicU64,
    /// Number of entries evicted or invalidated
    pub evicted: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.inserted.store(0, Ordering::Relaxed);
        self.evicted.store(0, Ordering::Relaxed);
    }
}

struct CachedEntry {
    data: Bytes,
    /// Global insertion sequence, used for oldest-first eviction
    seq: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: BTreeMap<Position, CachedEntry>,
    by_seq: BTreeMap<u64, Position>,
}

impl CacheInner {
    fn remove(&mut self, position: Position) -> Option<CachedEntry> {
        let entry = self.entries.remove(&position)?;
        self.by_seq.remove(&entry.seq);
        Some(entry)
    }
}

/// Position-indexed cache of one ledger's entries.
pub struct EntryCache {
    name: String,
    inner: Mutex<CacheInner>,
    size: AtomicU64,
    manager: Weak<EntryCacheManager>,
}

impl EntryCache {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cached bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, position: Position) -> bool {
        self.inner.lock().entries.contains_key(&position)
    }

    /// Insert an entry. Returns false when caching is disabled or the
    /// position is already cached.
    pub fn insert(&self, position: Position, data: Bytes) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        if !manager.is_enabled() {
            return false;
        }
        let len = data.len() as u64;
        {
            let mut inner = self.inner.lock();
            if inner.entries.contains_key(&position) {
                return false;
            }
            let seq = manager.next_seq();
            inner.entries.insert(position, CachedEntry { data, seq });
            inner.by_seq.insert(seq, position);
        }
        self.size.fetch_add(len, Ordering::Relaxed);
        manager.on_inserted(len);
        true
    }

    pub fn get(&self, position: Position) -> Option<Bytes> {
        let data = self
            .inner
            .lock()
            .entries
            .get(&position)
            .map(|e| e.data.clone());
        if let Some(manager) = self.manager.upgrade() {
            let counter = if data.is_some() {
                &manager.stats.hits
            } else {
                &manager.stats.misses
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        data
    }

    /// Drop every entry strictly before `position`.
    /// Returns the number of entries and bytes removed.
    pub fn invalidate_entries_before(&self, position: Position) -> (usize, u64) {
        let removed = {
            let mut inner = self.inner.lock();
            let kept = inner.entries.split_off(&position);
            let removed = std::mem::replace(&mut inner.entries, kept);
            for entry in removed.values() {
                inner.by_seq.remove(&entry.seq);
            }
            removed
        };
        self.account_removed(removed.values().map(|e| e.data.len() as u64))
    }

    /// Drop every entry of one segment.
    pub fn invalidate_segment(&self, segment_id: SegmentId) -> (usize, u64) {
        let lo = Position::new(segment_id, i64::MIN);
        let hi = Position::new(segment_id, i64::MAX);
        let removed: Vec<u64> = {
            let mut inner = self.inner.lock();
            let positions: Vec<Position> = inner.entries.range(lo..=hi).map(|(p, _)| *p).collect();
            positions
                .into_iter()
                .filter_map(|p| inner.remove(p))
                .map(|e| e.data.len() as u64)
                .collect()
        };
        self.account_removed(removed)
    }

    /// Drop everything.
    pub fn clear(&self) -> (usize, u64) {
        let removed = {
            let mut inner = self.inner.lock();
            inner.by_seq.clear();
            std::mem::take(&mut inner.entries)
        };
        self.account_removed(removed.values().map(|e| e.data.len() as u64))
    }

    fn oldest_seq(&self) -> Option<u64> {
        self.inner.lock().by_seq.keys().next().copied()
    }

    /// Evict oldest insertions until `target` bytes are freed or the next
    /// candidate was inserted after `stop_after_seq`.
    fn evict_oldest(&self, target: u64, stop_after_seq: Option<u64>) -> (usize, u64) {
        let mut freed = 0u64;
        let mut sizes = Vec::new();
        {
            let mut inner = self.inner.lock();
            while freed < target {
                let Some((&seq, &position)) = inner.by_seq.iter().next() else {
                    break;
                };
                if stop_after_seq.is_some_and(|stop| seq > stop) && !sizes.is_empty() {
                    break;
                }
                if let Some(entry) = inner.remove(position) {
                    let len = entry.data.len() as u64;
                    freed += len;
                    sizes.push(len);
                } else {
                    inner.by_seq.remove(&seq);
                }
            }
        }
        self.account_removed(sizes)
    }

    fn account_removed(&self, sizes: impl IntoIterator<Item = u64>) -> (usize, u64) {
        let (count, bytes) = sizes
            .into_iter()
            .fold((0usize, 0u64), |(c, b), len| (c + 1, b + len));
        if count > 0 {
            self.size.fetch_sub(bytes, Ordering::Relaxed);
            if let Some(manager) = self.manager.upgrade() {
                manager.on_removed(count, bytes);
            }
        }
        (count, bytes)
    }
}

/// Process-wide registry of entry caches with a shared memory budget.
pub struct EntryCacheManager {
    max_size: u64,
    eviction_watermark: f64,
    size: AtomicU64,
    seq: AtomicU64,
    caches: DashMap<String, Arc<EntryCache>>,
    stats: CacheStats,
}

impl EntryCacheManager {
    /// `max_size` bytes across all caches; 0 disables caching.
    #[must_use]
    pub fn new(max_size: u64, eviction_watermark: f64) -> Arc<Self> {
        Arc::new(Self {
            max_size,
            eviction_watermark: eviction_watermark.clamp(0.0, 1.0),
            size: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            caches: DashMap::new(),
            stats: CacheStats::default(),
        })
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.max_size > 0
    }

    #[must_use]
    pub const fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Bytes cached across all ledgers
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    #[must_use]
    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// The cache for `name`, created on first use.
    pub fn get_or_create(self: &Arc<Self>, name: &str) -> Arc<EntryCache> {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(EntryCache {
                    name: name.to_string(),
                    inner: Mutex::new(CacheInner::default()),
                    size: AtomicU64::new(0),
                    manager: Arc::downgrade(self),
                })
            })
            .clone()
    }

    /// Clear and unregister the cache for `name`.
    pub fn remove(&self, name: &str) {
        if let Some((_, cache)) = self.caches.remove(name) {
            cache.clear();
        }
    }

    pub fn clear(&self) {
        let caches: Vec<Arc<EntryCache>> = self.caches.iter().map(|c| Arc::clone(c.value())).collect();
        for cache in caches {
            cache.clear();
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn on_inserted(&self, len: u64) {
        self.stats.inserted.fetch_add(1, Ordering::Relaxed);
        let size = self.size.fetch_add(len, Ordering::Relaxed) + len;
        if size > self.max_size {
            self.evict_to_watermark();
        }
    }

    fn on_removed(&self, count: usize, bytes: u64) {
        self.stats.evicted.fetch_add(count as u64, Ordering::Relaxed);
        self.size.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Free memory oldest-insertion-first across all caches until usage
    /// drops to the watermark.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn evict_to_watermark(&self) {
        let target = (self.max_size as f64 * self.eviction_watermark) as u64;
        loop {
            let current = self.size();
            if current <= target {
                break;
            }
            let mut candidates: Vec<(u64, Arc<EntryCache>)> = self
                .caches
                .iter()
                .filter_map(|c| c.value().oldest_seq().map(|s| (s, Arc::clone(c.value()))))
                .collect();
            if candidates.is_empty() {
                break;
            }
            candidates.sort_by_key(|(seq, _)| *seq);
            let runner_up = candidates.get(1).map(|(seq, _)| *seq);
            let (_, coldest) = &candidates[0];
            let (count, bytes) = coldest.evict_oldest(current - target, runner_up);
            debug!(
                "Evicted {count} entries ({bytes} bytes) from cache {}",
                coldest.name()
            );
            if count == 0 {
                break;
            }
        }
    }
}
