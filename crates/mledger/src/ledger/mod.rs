//! Managed ledger
//!
//! A managed ledger stitches segments of the segment store into one
//! unbounded log. It owns the segment list and the writable segment, the
//! pending write queue, the cursor containers and the entry cache, and runs
//! the rollover, trim and inactivity background work.
//!
//! Locking: a cursor's state lock may be held while taking the cursor
//! containers, and those may be held while taking the ledger state lock.
//! The ledger never calls into a cursor while holding either of its own.

mod read;
mod trim;
mod write;

#[cfg(test)]
mod tests;

pub use read::OpReadEntry;
pub use write::{OpAddEntry, PendingWriteQueue};

use crate::cache::{EntryCache, EntryCacheManager};
use crate::cursor::{ManagedCursor, ManagedCursorContainer};
use crate::meta::MetaStore;
use crate::offload::Offloader;
use crate::stats::LedgerStats;
use bytes::Bytes;
use mledger_common::{
    Error, InitialPosition, LedgerInfo, ManagedLedgerConfig, Position, Result, SegmentId,
    SegmentInfo,
};
use mledger_meta_store::{MetadataStore, Version};
use mledger_segment::{SegmentError, SegmentHandle, SegmentStore};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex as AsyncMutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle state of a managed ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    /// A writable segment is installed
    LedgerOpened,
    /// Rolling over to a new segment; adds queue up
    CreatingLedger,
    Closed,
    /// Another owner took over the ledger
    Fenced,
}

impl State {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Fenced)
    }
}

/// Progress of durable cursor recovery at open.
#[derive(Debug, Clone)]
pub(crate) enum CursorRecovery {
    Pending,
    Done,
    Failed(Error),
}

/// Collaborators shared by every ledger of a factory.
#[derive(Clone)]
pub(crate) struct LedgerContext {
    pub segment_store: Arc<dyn SegmentStore>,
    pub metadata_store: Arc<dyn MetadataStore>,
    pub cache_manager: Arc<EntryCacheManager>,
    pub offloader: Option<Arc<dyn Offloader>>,
    pub trim_interval: Duration,
    pub inactive_check_interval: Duration,
}

/// Mutable ledger state, guarded by one lock.
pub(crate) struct LedgerState {
    pub state: State,
    pub segments: BTreeMap<SegmentId, SegmentInfo>,
    pub current: Option<Arc<dyn SegmentHandle>>,
    pub current_created: Instant,
    /// Entries and bytes handed to the current segment, confirmed or not
    pub submitted_entries: u64,
    pub submitted_bytes: u64,
    /// The last rollover failed; the next add retries it
    pub needs_new_segment: bool,
    pub rollover_requested: bool,
    /// An add on the current segment failed; it must be abandoned
    pub suspect: bool,
    pub last_confirmed: Position,
    pub last_add_time: Instant,
    pub pending: PendingWriteQueue,
    pub properties: BTreeMap<String, String>,
    pub read_handles: HashMap<SegmentId, Arc<dyn SegmentHandle>>,
}

impl LedgerState {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            state: State::Uninitialized,
            segments: BTreeMap::new(),
            current: None,
            current_created: now,
            submitted_entries: 0,
            submitted_bytes: 0,
            needs_new_segment: false,
            rollover_requested: false,
            suspect: false,
            last_confirmed: Position::EARLIEST,
            last_add_time: now,
            pending: PendingWriteQueue::default(),
            properties: BTreeMap::new(),
            read_handles: HashMap::new(),
        }
    }

    pub(crate) fn current_id(&self) -> Option<SegmentId> {
        self.current.as_ref().map(|h| h.segment_id())
    }

    pub(crate) fn first_position(&self) -> Position {
        self.segments
            .keys()
            .next()
            .map_or(self.last_confirmed, |id| Position::new(*id, -1))
    }
}

/// The version and content of the last ledger record this instance wrote.
pub(crate) struct MetaSlot {
    pub version: Option<Version>,
    pub persisted: LedgerInfo,
}

type CloseCallback = Box<dyn FnOnce() + Send>;

/// A durable, ordered, multi-consumer log.
pub struct ManagedLedger {
    name: String,
    config: ManagedLedgerConfig,
    segment_store: Arc<dyn SegmentStore>,
    meta: MetaStore,
    cache: Arc<EntryCache>,
    cache_manager: Arc<EntryCacheManager>,
    offloader: Option<Arc<dyn Offloader>>,
    weak: Weak<ManagedLedger>,

    state: Mutex<LedgerState>,
    /// Every cursor, ordered by mark-delete position
    cursors: RwLock<ManagedCursorContainer<Arc<ManagedCursor>>>,
    /// Active cursors, ordered by the position the cache is evicted up to
    active_cursors: RwLock<ManagedCursorContainer<()>>,
    /// Entries before this position are not cached
    eviction_floor: Mutex<Position>,

    /// Serializes rollover, trim, offload and close
    structure_lock: AsyncMutex<()>,
    meta_slot: AsyncMutex<MetaSlot>,
    cursor_open_lock: AsyncMutex<()>,
    trim_scheduled: AtomicBool,

    num_entries: AtomicU64,
    total_size: AtomicU64,
    entries_available: Notify,
    pending_drained: Notify,
    recovery: watch::Sender<CursorRecovery>,

    trim_interval: Duration,
    inactive_check_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    rollover_timer: Mutex<Option<JoinHandle<()>>>,
    on_close: Mutex<Option<CloseCallback>>,
    stats: LedgerStats,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Run a segment store call under a deadline, keeping the store's own
/// error so callers can match on it.
pub(crate) async fn segment_call<T, F>(
    op: &str,
    limit: Duration,
    fut: F,
) -> Result<std::result::Result<T, SegmentError>>
where
    F: Future<Output = std::result::Result<T, SegmentError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::timeout(op))
}

/// Run a store call under a deadline.
pub(crate) async fn with_timeout<T, E, F>(op: &str, limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<Error>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(Error::timeout(op)),
        },
        None => fut.await.map_err(Into::into),
    }
}

impl ManagedLedger {
    /// Open or create the ledger `name` and recover its state.
    pub(crate) async fn open(
        name: &str,
        config: ManagedLedgerConfig,
        ctx: LedgerContext,
    ) -> Result<Arc<Self>> {
        let meta = MetaStore::new(
            Arc::clone(&ctx.metadata_store),
            config.metadata_operations_timeout(),
        );
        let (info, version) = match meta.get_ledger_info(name).await? {
            Some((info, version)) => (info, Some(version)),
            None if config.create_if_missing => (LedgerInfo::default(), None),
            None => return Err(Error::LedgerNotFound(name.to_string())),
        };

        let cache = ctx.cache_manager.get_or_create(name);
        let (recovery, _) = watch::channel(CursorRecovery::Pending);
        let ledger = Arc::new_cyclic(|weak| Self {
            name: name.to_string(),
            config,
            segment_store: Arc::clone(&ctx.segment_store),
            meta,
            cache,
            cache_manager: Arc::clone(&ctx.cache_manager),
            offloader: ctx.offloader.clone(),
            weak: weak.clone(),
            state: Mutex::new(LedgerState::new()),
            cursors: RwLock::new(ManagedCursorContainer::new()),
            active_cursors: RwLock::new(ManagedCursorContainer::new()),
            eviction_floor: Mutex::new(Position::LATEST),
            structure_lock: AsyncMutex::new(()),
            meta_slot: AsyncMutex::new(MetaSlot {
                version: None,
                persisted: LedgerInfo::default(),
            }),
            cursor_open_lock: AsyncMutex::new(()),
            trim_scheduled: AtomicBool::new(false),
            num_entries: AtomicU64::new(0),
            total_size: AtomicU64::new(0),
            entries_available: Notify::new(),
            pending_drained: Notify::new(),
            recovery,
            trim_interval: ctx.trim_interval,
            inactive_check_interval: ctx.inactive_check_interval,
            tasks: Mutex::new(Vec::new()),
            rollover_timer: Mutex::new(None),
            on_close: Mutex::new(None),
            stats: LedgerStats::default(),
        });

        if let Err(e) = ledger.initialize(info, version).await {
            warn!("[{name}] Failed to open managed ledger: {e}");
            ledger.cancel_tasks();
            ledger.state.lock().state = State::Closed;
            ledger.cache_manager.remove(name);
            return Err(e);
        }
        Ok(ledger)
    }

    async fn initialize(&self, info: LedgerInfo, version: Option<Version>) -> Result<()> {
        let op_timeout = Some(self.config.metadata_operations_timeout());
        let mut segments: BTreeMap<SegmentId, SegmentInfo> = info
            .segments
            .into_iter()
            .map(|s| (s.segment_id, s))
            .collect();

        // Seal the segment the previous owner was writing to. This fences it
        // at the segment level and fixes the final entry count.
        if let Some(last) = segments.values_mut().next_back().filter(|s| !s.is_sealed()) {
            let id = last.segment_id;
            let limit = self.config.metadata_operations_timeout();
            match segment_call("open segment", limit, self.segment_store.open(id)).await? {
                Ok(handle) => {
                    with_timeout("seal segment", op_timeout, handle.seal()).await?;
                    last.entry_count = u64::try_from(handle.last_add_confirmed() + 1).unwrap_or(0);
                    last.size_bytes = handle.length();
                }
                Err(SegmentError::NotFound(_)) => {
                    warn!("[{}] Segment {id} is missing from the store", self.name);
                    last.entry_count = 0;
                    last.size_bytes = 0;
                }
                Err(e) => return Err(e.into()),
            }
            last.close_timestamp_ms = now_ms();
            debug!(
                "[{}] Recovered segment {id} with {} entries",
                self.name, last.entry_count
            );
        }

        let empty: Vec<SegmentId> = segments
            .values()
            .filter(|s| s.entry_count == 0)
            .map(|s| s.segment_id)
            .collect();
        for id in &empty {
            segments.remove(id);
        }

        let handle = with_timeout(
            "create segment",
            op_timeout,
            self.segment_store.create(&self.config.ensemble),
        )
        .await?;
        let new_id = handle.segment_id();
        segments.insert(new_id, SegmentInfo::new(new_id));

        let record = LedgerInfo {
            segments: segments.values().cloned().collect(),
            properties: info.properties,
        };
        let version = match self.meta.put_ledger_info(&self.name, &record, version).await {
            Ok(version) => version,
            Err(e) => {
                self.delete_segment_quietly(new_id).await;
                return Err(e);
            }
        };
        for id in empty {
            self.delete_segment_quietly(id).await;
        }

        {
            let mut slot = self.meta_slot.lock().await;
            slot.version = Some(version);
            slot.persisted = record.clone();
        }
        {
            let mut st = self.state.lock();
            let now = Instant::now();
            st.segments = segments;
            st.properties = record.properties;
            st.current = Some(handle);
            st.current_created = now;
            st.last_add_time = now;
            st.last_confirmed = Position::new(new_id, -1);
            st.state = State::LedgerOpened;
            self.recompute_counters(&st);
        }

        self.start_background_tasks();
        if self.config.lazy_cursor_recovery {
            let weak = self.weak.clone();
            tokio::spawn(async move {
                if let Some(ledger) = weak.upgrade() {
                    let result = ledger.recover_cursors().await;
                    ledger.finish_recovery(result);
                }
            });
        } else {
            let result = self.recover_cursors().await;
            self.finish_recovery(result.clone());
            result?;
        }
        self.schedule_trim();

        info!(
            "[{}] Opened managed ledger: {} segments, {} entries, writing to segment {new_id}",
            self.name,
            record.segments.len(),
            self.number_of_entries()
        );
        Ok(())
    }

    async fn recover_cursors(&self) -> Result<()> {
        let names = self.meta.cursor_names(&self.name).await?;
        for name in names {
            let cursor = ManagedCursor::recover(self.weak.clone(), &self.name, &name).await?;
            let md = cursor.mark_deleted_position();
            self.cursors.write().add(&name, md, cursor);
            debug!("[{}] Recovered cursor {name} at {md}", self.name);
        }
        Ok(())
    }

    fn finish_recovery(&self, result: Result<()>) {
        let status = match result {
            Ok(()) => CursorRecovery::Done,
            Err(e) => {
                warn!("[{}] Cursor recovery failed: {e}", self.name);
                CursorRecovery::Failed(e)
            }
        };
        self.recovery.send_replace(status);
    }

    async fn wait_cursors_recovered(&self) -> Result<()> {
        let mut rx = self.recovery.subscribe();
        let status = rx
            .wait_for(|s| !matches!(s, CursorRecovery::Pending))
            .await
            .map_err(|_| Error::closed(&self.name))?
            .clone();
        match status {
            CursorRecovery::Failed(e) => Err(e),
            _ => Ok(()),
        }
    }

    fn cursors_recovered(&self) -> bool {
        matches!(*self.recovery.borrow(), CursorRecovery::Done)
    }

    fn start_background_tasks(&self) {
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(trim_loop(self.weak.clone(), self.trim_interval)));
        if self.config.inactive_segment_rollover_time().is_some() {
            tasks.push(tokio::spawn(inactive_loop(
                self.weak.clone(),
                self.inactive_check_interval,
            )));
        }
        drop(tasks);
        self.schedule_rollover_timer();
    }

    fn cancel_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(timer) = self.rollover_timer.lock().take() {
            timer.abort();
        }
    }

    /// Check again once the current segment reaches its maximum age.
    fn schedule_rollover_timer(&self) {
        let delay = self.config.max_rollover_time();
        let weak = self.weak.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(ledger) = weak.upgrade() {
                ledger.roll_if_full();
            }
        });
        if let Some(previous) = self.rollover_timer.lock().replace(timer) {
            previous.abort();
        }
    }

    pub(crate) fn set_on_close(&self, callback: impl FnOnce() + Send + 'static) {
        *self.on_close.lock() = Some(Box::new(callback));
    }

    fn run_on_close(&self) {
        let callback = self.on_close.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn recompute_counters(&self, st: &LedgerState) {
        let (entries, size) = st
            .segments
            .values()
            .fold((0, 0), |(e, s), info| (e + info.entry_count, s + info.size_bytes));
        self.num_entries.store(entries, Ordering::Relaxed);
        self.total_size.store(size, Ordering::Relaxed);
    }

    async fn delete_segment_quietly(&self, segment_id: SegmentId) {
        let limit = self.config.metadata_operations_timeout();
        match segment_call("delete segment", limit, self.segment_store.delete(segment_id)).await {
            Ok(Ok(())) => LedgerStats::incr(&self.stats.segments_deleted, 1),
            Ok(Err(e)) => warn!("[{}] Failed to delete segment {segment_id}: {e}", self.name),
            Err(e) => warn!("[{}] Failed to delete segment {segment_id}: {e}", self.name),
        }
    }

    fn check_writable(&self, st: &LedgerState) -> Result<()> {
        match st.state {
            State::Fenced => Err(Error::fenced(&self.name)),
            State::Closed => Err(Error::closed(&self.name)),
            State::Uninitialized => Err(Error::internal(format!(
                "ledger {} is not initialized",
                self.name
            ))),
            State::LedgerOpened | State::CreatingLedger => Ok(()),
        }
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        self.check_writable(&self.state.lock())
    }

    /// Run `f` against a consistent view of the segment list.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&LedgerState) -> R) -> R {
        f(&self.state.lock())
    }

    // --- accessors ---

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn config(&self) -> &ManagedLedgerConfig {
        &self.config
    }

    #[must_use]
    pub const fn stats(&self) -> &LedgerStats {
        &self.stats
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.state.lock().state
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().is_terminal()
    }

    pub(crate) const fn meta(&self) -> &MetaStore {
        &self.meta
    }

    pub(crate) fn segment_store(&self) -> &Arc<dyn SegmentStore> {
        &self.segment_store
    }

    pub(crate) const fn entries_available(&self) -> &Notify {
        &self.entries_available
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<EntryCache> {
        &self.cache
    }

    /// Snapshot of the segment list, oldest first.
    #[must_use]
    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.state.lock().segments.values().cloned().collect()
    }

    #[must_use]
    pub fn number_of_entries(&self) -> u64 {
        self.num_entries.load(Ordering::Relaxed)
    }

    /// Payload bytes across all segments
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    // --- cursors ---

    /// Open a durable cursor, starting at the end of the ledger when new.
    pub async fn open_cursor(&self, name: &str) -> Result<Arc<ManagedCursor>> {
        self.open_cursor_with(name, InitialPosition::Latest, BTreeMap::new())
            .await
    }

    /// Open a durable cursor. An existing cursor is returned and activated;
    /// `initial` and `properties` only apply to a new one.
    pub async fn open_cursor_with(
        &self,
        name: &str,
        initial: InitialPosition,
        properties: BTreeMap<String, String>,
    ) -> Result<Arc<ManagedCursor>> {
        self.check_open()?;
        self.wait_cursors_recovered().await?;
        let _guard = self.cursor_open_lock.lock().await;

        let existing = self.cursors.read().get(name);
        if let Some(cursor) = existing {
            self.activate_cursor(&cursor);
            return Ok(cursor);
        }

        let mark_delete = {
            let st = self.state.lock();
            match initial {
                InitialPosition::Latest => st.last_confirmed,
                InitialPosition::Earliest => st.first_position(),
            }
        };
        let cursor =
            ManagedCursor::create(self.weak.clone(), &self.name, name, mark_delete, properties)
                .await?;
        self.register_cursor(&cursor, true);
        info!(
            "[{}] Opened cursor {name} at {mark_delete} ({initial:?})",
            self.name
        );
        Ok(cursor)
    }

    /// Open a cursor that is never persisted. Its mark-delete position is
    /// `start`, clamped to the retained range.
    pub async fn new_non_durable_cursor(&self, start: Position) -> Result<Arc<ManagedCursor>> {
        self.check_open()?;
        self.wait_cursors_recovered().await?;
        let mark_delete = {
            let st = self.state.lock();
            start.max(st.first_position()).min(st.last_confirmed)
        };
        let name = format!("nd-{}", uuid::Uuid::new_v4());
        let cursor = ManagedCursor::non_durable(self.weak.clone(), &self.name, &name, mark_delete);
        self.register_cursor(&cursor, true);
        debug!("[{}] Opened non-durable cursor {name} at {mark_delete}", self.name);
        Ok(cursor)
    }

    fn register_cursor(&self, cursor: &Arc<ManagedCursor>, active: bool) {
        let md = cursor.mark_deleted_position();
        let change = self
            .cursors
            .write()
            .add(cursor.name(), md, Arc::clone(cursor));
        if active {
            self.activate_cursor(cursor);
        }
        if change.changed() {
            self.schedule_trim();
        }
    }

    /// Delete a cursor and its persisted state. Deleting an unknown cursor
    /// succeeds.
    pub async fn delete_cursor(&self, name: &str) -> Result<()> {
        self.check_open()?;
        self.wait_cursors_recovered().await?;
        let removed = self.cursors.write().remove(name);
        self.active_cursors.write().remove(name);
        self.update_cache_eviction();

        match removed {
            Some(cursor) => {
                cursor.mark_closed();
                cursor.remove_persisted().await?;
                info!("[{}] Deleted cursor {name}", self.name);
            }
            None => self.meta.remove_cursor_info(&self.name, name).await?,
        }
        self.schedule_trim();
        Ok(())
    }

    #[must_use]
    pub fn get_cursors(&self) -> Vec<Arc<ManagedCursor>> {
        self.cursors.read().items()
    }

    #[must_use]
    pub fn get_active_cursors(&self) -> Vec<Arc<ManagedCursor>> {
        let names = self.active_cursors.read().names();
        let cursors = self.cursors.read();
        names.iter().filter_map(|n| cursors.get(n)).collect()
    }

    #[must_use]
    pub fn get_cursor(&self, name: &str) -> Option<Arc<ManagedCursor>> {
        self.cursors.read().get(name)
    }

    /// Let the cursor hold entries in the cache.
    pub fn activate_cursor(&self, cursor: &ManagedCursor) {
        let position = self.eviction_position(cursor.mark_deleted_position(), cursor.read_position());
        self.active_cursors.write().add(cursor.name(), position, ());
        self.update_cache_eviction();
    }

    pub fn deactivate_cursor(&self, cursor: &ManagedCursor) {
        self.active_cursors.write().remove(cursor.name());
        self.update_cache_eviction();
    }

    pub(crate) fn is_cursor_active(&self, name: &str) -> bool {
        self.active_cursors.read().contains(name)
    }

    const fn eviction_position(&self, mark_delete: Position, read: Position) -> Position {
        if self.config.cache_eviction_by_mark_delete_position {
            mark_delete.next()
        } else {
            read
        }
    }

    /// Called by a cursor after its positions moved.
    pub(crate) fn cursor_updated(&self, name: &str, mark_delete: Position, read: Position) {
        let slowest_changed = self
            .cursors
            .write()
            .update(name, mark_delete)
            .is_some_and(|c| c.changed());
        let eviction = self.eviction_position(mark_delete, read);
        let evict = self.active_cursors.write().update(name, eviction).is_some();
        if evict {
            self.update_cache_eviction();
        }
        if slowest_changed {
            self.schedule_trim();
        }
    }

    /// Drop cached entries no active cursor still needs.
    fn update_cache_eviction(&self) {
        let floor = self.active_cursors.read().slowest_position();
        match floor {
            Some(floor) => {
                *self.eviction_floor.lock() = floor;
                self.cache.invalidate_entries_before(floor);
            }
            None => {
                *self.eviction_floor.lock() = Position::LATEST;
                self.cache.clear();
            }
        }
    }

    // --- properties ---

    #[must_use]
    pub fn properties(&self) -> BTreeMap<String, String> {
        self.state.lock().properties.clone()
    }

    pub async fn set_property(&self, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.update_ledger_info(move |props, _| {
            props.insert(key.clone(), value.clone());
            Ok(())
        })
        .await
    }

    pub async fn set_properties(&self, properties: BTreeMap<String, String>) -> Result<()> {
        self.update_ledger_info(move |props, _| {
            props.extend(properties.clone());
            Ok(())
        })
        .await
    }

    pub async fn delete_property(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.update_ledger_info(move |props, _| {
            props.remove(&key);
            Ok(())
        })
        .await
    }

    #[must_use]
    pub fn segment_property(&self, segment_id: SegmentId, key: &str) -> Option<String> {
        self.state
            .lock()
            .segments
            .get(&segment_id)
            .and_then(|s| s.properties.get(key).cloned())
    }

    pub async fn set_segment_property(
        &self,
        segment_id: SegmentId,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        let ledger = self.name.clone();
        self.update_ledger_info(move |_, segments| {
            let info = segments.get_mut(&segment_id).ok_or(Error::SegmentNotExist {
                ledger: ledger.clone(),
                segment_id,
            })?;
            info.properties.insert(key.clone(), value.clone());
            Ok(())
        })
        .await
    }

    pub async fn remove_segment_property(&self, segment_id: SegmentId, key: &str) -> Result<()> {
        let key = key.to_string();
        let ledger = self.name.clone();
        self.update_ledger_info(move |_, segments| {
            let info = segments.get_mut(&segment_id).ok_or(Error::SegmentNotExist {
                ledger: ledger.clone(),
                segment_id,
            })?;
            info.properties.remove(&key);
            Ok(())
        })
        .await
    }

    // --- lifecycle ---

    /// Retry work suspended while the metadata session was lost.
    pub fn on_session_reestablished(&self) {
        {
            let mut st = self.state.lock();
            if st.state != State::LedgerOpened {
                return;
            }
            self.submit_pending(&mut st);
        }
        self.schedule_trim();
    }

    /// Close the ledger. Pending adds that were not handed to the segment
    /// store fail with `Closed`; in-flight ones are given time to finish.
    pub async fn close(&self) -> Result<()> {
        let unsubmitted = {
            let mut st = self.state.lock();
            match st.state {
                State::Closed => return Ok(()),
                State::Fenced => return Err(Error::fenced(&self.name)),
                _ => {}
            }
            st.state = State::Closed;
            st.pending.take_unsubmitted()
        };
        for op in unsubmitted {
            op.complete(Err(Error::closed(&self.name)));
        }
        self.wait_in_flight_drained().await;
        self.cancel_tasks();

        let _guard = self.structure_lock.lock().await;
        for cursor in self.get_cursors() {
            if let Err(e) = cursor.flush().await {
                warn!(
                    "[{}] Failed to persist cursor {} on close: {e}",
                    self.name,
                    cursor.name()
                );
            }
        }

        let current = self.state.lock().current.take();
        let mut result = Ok(());
        if let Some(handle) = current {
            result = self.seal_on_close(handle).await;
        }

        self.cache_manager.remove(&self.name);
        self.entries_available.notify_waiters();
        self.run_on_close();
        info!("[{}] Closed managed ledger", self.name);
        result
    }

    async fn seal_on_close(&self, handle: Arc<dyn SegmentHandle>) -> Result<()> {
        let op_timeout = Some(self.config.metadata_operations_timeout());
        let id = handle.segment_id();
        if let Err(e) = with_timeout("seal segment", op_timeout, handle.seal()).await {
            warn!("[{}] Failed to seal segment {id} on close: {e}", self.name);
        }
        let empty = self
            .state
            .lock()
            .segments
            .get(&id)
            .is_none_or(|s| s.entry_count == 0);
        let closed_at = now_ms();
        self.update_ledger_info(move |_, segments| {
            if empty {
                segments.remove(&id);
            } else if let Some(info) = segments.get_mut(&id) {
                info.close_timestamp_ms = closed_at;
            }
            Ok(())
        })
        .await?;
        if empty {
            self.delete_segment_quietly(id).await;
        } else {
            self.state.lock().read_handles.insert(id, handle);
        }
        Ok(())
    }

    async fn wait_in_flight_drained(&self) {
        let limit = self
            .config
            .add_entry_timeout()
            .unwrap_or_else(|| self.config.metadata_operations_timeout());
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let notified = self.pending_drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.lock().pending.in_flight() == 0 {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let abandoned = self.state.lock().pending.drain_all();
                warn!(
                    "[{}] {} adds still in flight at close",
                    self.name,
                    abandoned.len()
                );
                for op in abandoned {
                    op.complete(Err(Error::closed(&self.name)));
                }
                return;
            }
        }
    }

    /// Close the ledger and delete its segments, cursors and metadata.
    pub async fn delete(&self) -> Result<()> {
        self.close().await?;
        let _guard = self.structure_lock.lock().await;

        let cursors: Vec<Arc<ManagedCursor>> = {
            let mut container = self.cursors.write();
            let items = container.items();
            container.clear();
            items
        };
        self.active_cursors.write().clear();
        for cursor in cursors {
            cursor.remove_persisted().await?;
        }
        for name in self.meta.cursor_names(&self.name).await? {
            self.meta.remove_cursor_info(&self.name, &name).await?;
        }

        let segments: Vec<SegmentInfo> = {
            let mut st = self.state.lock();
            st.read_handles.clear();
            std::mem::take(&mut st.segments).into_values().collect()
        };
        for info in &segments {
            self.delete_segment_quietly(info.segment_id).await;
            self.delete_offloaded(info).await;
        }
        self.meta.remove_ledger_info(&self.name).await?;
        self.num_entries.store(0, Ordering::Relaxed);
        self.total_size.store(0, Ordering::Relaxed);
        info!(
            "[{}] Deleted managed ledger and {} segments",
            self.name,
            segments.len()
        );
        Ok(())
    }
}

impl Drop for ManagedLedger {
    fn drop(&mut self) {
        self.cancel_tasks();
    }
}

async fn trim_loop(weak: Weak<ManagedLedger>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(ledger) = weak.upgrade() else {
            break;
        };
        if ledger.is_closed() {
            break;
        }
        if let Err(e) = ledger.trim_consumed_segments().await {
            debug!("[{}] Background trim failed: {e}", ledger.name);
        }
        ledger.maybe_offload().await;
    }
}

async fn inactive_loop(weak: Weak<ManagedLedger>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(ledger) = weak.upgrade() else {
            break;
        };
        if ledger.is_closed() {
            break;
        }
        ledger.check_inactive_segment_and_rollover();
    }
}

impl std::fmt::Debug for ManagedLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedLedger")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Payload helper for callers holding a larger buffer.
pub(crate) fn slice_payload(data: &Bytes, offset: usize, len: usize) -> Result<Bytes> {
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| {
            Error::invalid_argument(format!(
                "range {offset}+{len} out of bounds for a {} byte buffer",
                data.len()
            ))
        })?;
    Ok(data.slice(offset..end))
}
