//! In-memory segment store
//!
//! Keeps every segment in process memory. Used by tests and the bench
//! binary; exposes fault injection hooks (failed creates/appends/reads,
//! delayed or hanging acknowledgements, a store-wide outage).

use crate::store::{SegmentError, SegmentHandle, SegmentResult, SegmentStore};
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use mledger_common::{EnsembleConfig, SegmentId};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Default)]
struct SegmentData {
    entries: Vec<Bytes>,
    length: u64,
    sealed: bool,
}

/// Injected failures. Counters are consumed one per matching call.
#[derive(Default)]
struct Faults {
    fail_creates: u32,
    fail_appends: u32,
    fail_reads: u32,
    append_delay: Option<Duration>,
    hang_appends: bool,
    hang_reads: bool,
    unavailable: bool,
}

struct Inner {
    segments: RwLock<BTreeMap<SegmentId, Arc<Mutex<SegmentData>>>>,
    next_id: AtomicU64,
    faults: Mutex<Faults>,
}

impl Inner {
    fn check_available(&self) -> SegmentResult<()> {
        if self.faults.lock().unavailable {
            return Err(SegmentError::Unavailable("injected outage".into()));
        }
        Ok(())
    }

    fn segment(&self, segment_id: SegmentId) -> SegmentResult<Arc<Mutex<SegmentData>>> {
        self.segments
            .read()
            .get(&segment_id)
            .cloned()
            .ok_or(SegmentError::NotFound(segment_id))
    }
}

/// Segment store held entirely in memory.
#[derive(Clone)]
pub struct MemorySegmentStore {
    inner: Arc<Inner>,
}

impl Default for MemorySegmentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySegmentStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                segments: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                faults: Mutex::new(Faults::default()),
            }),
        }
    }

    /// Fail the next `n` segment creations.
    pub fn fail_next_creates(&self, n: u32) {
        self.inner.faults.lock().fail_creates = n;
    }

    /// Fail the next `n` appends without storing them.
    pub fn fail_next_appends(&self, n: u32) {
        self.inner.faults.lock().fail_appends = n;
    }

    /// Fail the next `n` reads.
    pub fn fail_next_reads(&self, n: u32) {
        self.inner.faults.lock().fail_reads = n;
    }

    /// Delay every append acknowledgement. The entry is stored immediately.
    pub fn set_append_delay(&self, delay: Option<Duration>) {
        self.inner.faults.lock().append_delay = delay;
    }

    /// Store appends but never acknowledge them.
    pub fn set_hang_appends(&self, hang: bool) {
        self.inner.faults.lock().hang_appends = hang;
    }

    /// Never complete reads.
    pub fn set_hang_reads(&self, hang: bool) {
        self.inner.faults.lock().hang_reads = hang;
    }

    /// Make every operation fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.faults.lock().unavailable = unavailable;
    }

    #[must_use]
    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.inner.segments.read().keys().copied().collect()
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.inner.segments.read().len()
    }

    #[must_use]
    pub fn exists(&self, segment_id: SegmentId) -> bool {
        self.inner.segments.read().contains_key(&segment_id)
    }

    #[must_use]
    pub fn is_sealed(&self, segment_id: SegmentId) -> bool {
        self.inner
            .segment(segment_id)
            .is_ok_and(|data| data.lock().sealed)
    }

    /// Number of stored entries, acknowledged or not.
    #[must_use]
    pub fn entry_count(&self, segment_id: SegmentId) -> Option<usize> {
        self.inner
            .segment(segment_id)
            .ok()
            .map(|data| data.lock().entries.len())
    }

    fn handle(&self, segment_id: SegmentId, data: Arc<Mutex<SegmentData>>) -> Arc<dyn SegmentHandle> {
        Arc::new(MemorySegmentHandle {
            segment_id,
            data,
            store: Arc::clone(&self.inner),
        })
    }
}

#[async_trait]
impl SegmentStore for MemorySegmentStore {
    async fn create(&self, _ensemble: &EnsembleConfig) -> SegmentResult<Arc<dyn SegmentHandle>> {
        self.inner.check_available()?;
        {
            let mut faults = self.inner.faults.lock();
            if faults.fail_creates > 0 {
                faults.fail_creates -= 1;
                return Err(SegmentError::Io("injected create failure".into()));
            }
        }
        let segment_id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let data = Arc::new(Mutex::new(SegmentData::default()));
        self.inner
            .segments
            .write()
            .insert(segment_id, Arc::clone(&data));
        debug!("Created segment {segment_id}");
        Ok(self.handle(segment_id, data))
    }

    async fn open(&self, segment_id: SegmentId) -> SegmentResult<Arc<dyn SegmentHandle>> {
        self.inner.check_available()?;
        let data = self.inner.segment(segment_id)?;
        Ok(self.handle(segment_id, data))
    }

    async fn delete(&self, segment_id: SegmentId) -> SegmentResult<()> {
        self.inner.check_available()?;
        if self.inner.segments.write().remove(&segment_id).is_some() {
            debug!("Deleted segment {segment_id}");
        }
        Ok(())
    }
}

struct MemorySegmentHandle {
    segment_id: SegmentId,
    data: Arc<Mutex<SegmentData>>,
    store: Arc<Inner>,
}

impl MemorySegmentHandle {
    fn check_live(&self) -> SegmentResult<()> {
        self.store.check_available()?;
        if self.store.segments.read().contains_key(&self.segment_id) {
            Ok(())
        } else {
            Err(SegmentError::NotFound(self.segment_id))
        }
    }
}

#[async_trait]
impl SegmentHandle for MemorySegmentHandle {
    fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    fn append(&self, data: Bytes) -> BoxFuture<'static, SegmentResult<i64>> {
        if let Err(e) = self.check_live() {
            return futures::future::ready(Err(e)).boxed();
        }
        let (delay, hang) = {
            let mut faults = self.store.faults.lock();
            if faults.fail_appends > 0 {
                faults.fail_appends -= 1;
                return futures::future::ready(Err(SegmentError::Io(
                    "injected append failure".into(),
                )))
                .boxed();
            }
            (faults.append_delay, faults.hang_appends)
        };

        let entry_id = {
            let mut segment = self.data.lock();
            if segment.sealed {
                return futures::future::ready(Err(SegmentError::Sealed(self.segment_id))).boxed();
            }
            segment.length += data.len() as u64;
            segment.entries.push(data);
            #[allow(clippy::cast_possible_wrap)]
            let id = segment.entries.len() as i64 - 1;
            id
        };

        async move {
            if hang {
                futures::future::pending::<()>().await;
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(entry_id)
        }
        .boxed()
    }

    async fn read(&self, first: i64, last: i64) -> SegmentResult<Vec<Bytes>> {
        self.check_live()?;
        let hang = {
            let mut faults = self.store.faults.lock();
            if faults.fail_reads > 0 {
                faults.fail_reads -= 1;
                return Err(SegmentError::Io("injected read failure".into()));
            }
            faults.hang_reads
        };
        if hang {
            std::future::pending::<()>().await;
        }
        let segment = self.data.lock();
        let out_of_range = SegmentError::OutOfRange {
            segment_id: self.segment_id,
            first,
            last,
        };
        let (Ok(start), Ok(end)) = (usize::try_from(first), usize::try_from(last)) else {
            return Err(out_of_range);
        };
        if start > end || end >= segment.entries.len() {
            return Err(out_of_range);
        }
        Ok(segment.entries[start..=end].to_vec())
    }

    async fn seal(&self) -> SegmentResult<()> {
        self.check_live()?;
        self.data.lock().sealed = true;
        Ok(())
    }

    fn last_add_confirmed(&self) -> i64 {
        #[allow(clippy::cast_possible_wrap)]
        let count = self.data.lock().entries.len() as i64;
        count - 1
    }

    fn length(&self) -> u64 {
        self.data.lock().length
    }

    fn is_sealed(&self) -> bool {
        self.data.lock().sealed
    }
}
