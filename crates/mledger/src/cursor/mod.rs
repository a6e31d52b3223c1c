//! Managed cursors
//!
//! A cursor tracks one consumer's progress through a ledger: the read
//! position (where the next read starts), the mark-delete position (every
//! entry at or before it is consumed) and the individually deleted ranges
//! beyond it. Durable cursors persist that state through the metadata
//! store; non-durable ones live only in memory.

pub mod container;
mod persist;
pub mod ranges;

pub use container::{ManagedCursorContainer, SlowestChange};
pub use ranges::PositionRangeSet;

use crate::entry::Entry;
use crate::ledger::{LedgerState, ManagedLedger, OpReadEntry};
use mledger_common::{
    CursorSnapshot, Error, Position, PositionBound, PositionRange, Result,
};
use parking_lot::Mutex;
use persist::PersistSlot;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

/// Whether individually deleted entries count towards `skip_entries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndividualDeleted {
    /// Deleted entries are part of the `n` skipped entries
    Include,
    /// Only entries that are still unacknowledged are counted
    Exclude,
}

#[derive(Debug)]
struct CursorState {
    mark_delete: Position,
    read_position: Position,
    deleted: PositionRangeSet,
    properties: BTreeMap<String, String>,
    closed: bool,
}

impl CursorState {
    fn snapshot(&self) -> CursorSnapshot {
        CursorSnapshot {
            mark_delete: self.mark_delete,
            individually_deleted: self.deleted.to_vec(),
            properties: self.properties.clone(),
        }
    }
}

/// A consumer position over a managed ledger.
pub struct ManagedCursor {
    name: String,
    ledger_name: String,
    ledger: Weak<ManagedLedger>,
    durable: bool,
    state: Mutex<CursorState>,
    /// One read at a time
    read_lock: AsyncMutex<()>,
    persist: AsyncMutex<PersistSlot>,
}

impl ManagedCursor {
    fn build(
        ledger: Weak<ManagedLedger>,
        ledger_name: &str,
        name: &str,
        durable: bool,
        state: CursorState,
        slot: PersistSlot,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            ledger_name: ledger_name.to_string(),
            ledger,
            durable,
            state: Mutex::new(state),
            read_lock: AsyncMutex::new(()),
            persist: AsyncMutex::new(slot),
        })
    }

    fn initial_state(
        ledger: &ManagedLedger,
        snapshot: CursorSnapshot,
    ) -> CursorState {
        let read_position = ledger.with_state(|ls| ls.next_valid_position(snapshot.mark_delete));
        CursorState {
            mark_delete: snapshot.mark_delete,
            read_position,
            deleted: PositionRangeSet::from_ranges(&snapshot.individually_deleted),
            properties: snapshot.properties,
            closed: false,
        }
    }

    /// Create a new durable cursor at `mark_delete` and persist it.
    pub(crate) async fn create(
        ledger_ref: Weak<ManagedLedger>,
        ledger_name: &str,
        name: &str,
        mark_delete: Position,
        properties: BTreeMap<String, String>,
    ) -> Result<Arc<Self>> {
        let ledger = ledger_ref
            .upgrade()
            .ok_or_else(|| Error::closed(ledger_name))?;
        let state = Self::initial_state(
            &ledger,
            CursorSnapshot {
                mark_delete,
                individually_deleted: Vec::new(),
                properties,
            },
        );
        let cursor = Self::build(
            ledger_ref,
            ledger_name,
            name,
            true,
            state,
            PersistSlot::default(),
        );
        cursor.persist_initial(&ledger).await?;
        Ok(cursor)
    }

    /// Load a durable cursor from the metadata store.
    pub(crate) async fn recover(
        ledger_ref: Weak<ManagedLedger>,
        ledger_name: &str,
        name: &str,
    ) -> Result<Arc<Self>> {
        let ledger = ledger_ref
            .upgrade()
            .ok_or_else(|| Error::closed(ledger_name))?;
        let (snapshot, slot) = Self::load(&ledger, ledger_name, name).await?;
        let state = Self::initial_state(&ledger, snapshot);
        debug!(
            "[{ledger_name}] Recovered cursor {name}: md={} read={} ranges={}",
            state.mark_delete,
            state.read_position,
            state.deleted.len()
        );
        Ok(Self::build(ledger_ref, ledger_name, name, true, state, slot))
    }

    pub(crate) fn non_durable(
        ledger_ref: Weak<ManagedLedger>,
        ledger_name: &str,
        name: &str,
        mark_delete: Position,
    ) -> Arc<Self> {
        let read_position = ledger_ref
            .upgrade()
            .map_or(mark_delete.next(), |l| {
                l.with_state(|ls| ls.next_valid_position(mark_delete))
            });
        let state = CursorState {
            mark_delete,
            read_position,
            deleted: PositionRangeSet::new(),
            properties: BTreeMap::new(),
            closed: false,
        };
        Self::build(
            ledger_ref,
            ledger_name,
            name,
            false,
            state,
            PersistSlot::default(),
        )
    }

    fn ledger(&self) -> Result<Arc<ManagedLedger>> {
        self.ledger
            .upgrade()
            .ok_or_else(|| Error::closed(&self.ledger_name))
    }

    fn closed_error(&self) -> Error {
        Error::closed(format!("{}/{}", self.ledger_name, self.name))
    }

    fn check_not_closed(&self) -> Result<()> {
        if self.state.lock().closed {
            return Err(self.closed_error());
        }
        Ok(())
    }

    // --- accessors ---

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn ledger_name(&self) -> &str {
        &self.ledger_name
    }

    #[must_use]
    pub const fn is_durable(&self) -> bool {
        self.durable
    }

    #[must_use]
    pub fn mark_deleted_position(&self) -> Position {
        self.state.lock().mark_delete
    }

    #[must_use]
    pub fn read_position(&self) -> Position {
        self.state.lock().read_position
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether this cursor currently keeps entries in the ledger cache.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.ledger
            .upgrade()
            .is_some_and(|l| l.is_cursor_active(&self.name))
    }

    pub fn set_active(&self) {
        if let Some(ledger) = self.ledger.upgrade() {
            ledger.activate_cursor(self);
        }
    }

    pub fn set_inactive(&self) {
        if let Some(ledger) = self.ledger.upgrade() {
            ledger.deactivate_cursor(self);
        }
    }

    /// True if `position` lies in one of the individually deleted ranges.
    #[must_use]
    pub fn is_individually_deleted(&self, position: Position) -> bool {
        self.state.lock().deleted.contains(position)
    }

    /// True if `position` is at or before the mark-delete position or was
    /// individually deleted.
    #[must_use]
    pub fn is_acknowledged(&self, position: Position) -> bool {
        let st = self.state.lock();
        position <= st.mark_delete || st.deleted.contains(position)
    }

    #[must_use]
    pub fn individually_deleted_ranges(&self) -> Vec<PositionRange> {
        self.state.lock().deleted.to_vec()
    }

    #[must_use]
    pub fn properties(&self) -> BTreeMap<String, String> {
        self.state.lock().properties.clone()
    }

    pub async fn set_property(&self, key: &str, value: &str) -> Result<()> {
        {
            let mut st = self.state.lock();
            if st.closed {
                return Err(self.closed_error());
            }
            st.properties.insert(key.to_string(), value.to_string());
        }
        self.persist().await
    }

    pub async fn remove_property(&self, key: &str) -> Result<()> {
        {
            let mut st = self.state.lock();
            if st.closed {
                return Err(self.closed_error());
            }
            st.properties.remove(key);
        }
        self.persist().await
    }

    // --- reading ---

    /// Read up to `count` unacknowledged entries from the read position and
    /// advance it. Returns an empty list when nothing is available.
    pub async fn read_entries(&self, count: i64) -> Result<Vec<Entry>> {
        let max = usize::try_from(count)
            .ok()
            .filter(|c| *c > 0)
            .ok_or_else(|| {
                Error::invalid_argument(format!("read count must be positive, got {count}"))
            })?;
        let ledger = self.ledger()?;
        self.check_not_closed()?;
        let _guard = self.read_lock.lock().await;

        let populate_cache = self.is_active();
        let mut result = Vec::new();
        while result.len() < max {
            let start = self.state.lock().read_position;
            let mut op = OpReadEntry::new(start, max - result.len());
            ledger.read_entries_into(&mut op, populate_cache).await?;
            let next = op.next_read_position();
            let entries = op.into_entries();
            let fetched = entries.len();

            let mut st = self.state.lock();
            if st.read_position != start {
                // Moved by a seek while reading; the new position wins.
                break;
            }
            result.extend(
                entries
                    .into_iter()
                    .filter(|e| e.position() > st.mark_delete && !st.deleted.contains(e.position())),
            );
            st.read_position = next;
            ledger.cursor_updated(&self.name, st.mark_delete, st.read_position);
            if fetched == 0 {
                break;
            }
        }
        Ok(result)
    }

    /// Like [`read_entries`](Self::read_entries), but waits for new entries
    /// when the cursor is caught up.
    pub async fn read_entries_or_wait(&self, count: i64) -> Result<Vec<Entry>> {
        if count <= 0 {
            return Err(Error::invalid_argument(format!(
                "read count must be positive, got {count}"
            )));
        }
        loop {
            let ledger = self.ledger()?;
            let notified = ledger.entries_available().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.has_more_entries() {
                let entries = self.read_entries(count).await?;
                if !entries.is_empty() {
                    return Ok(entries);
                }
            }
            ledger.check_open()?;
            self.check_not_closed()?;
            notified.await;
        }
    }

    /// True if entries exist at or after the read position.
    #[must_use]
    pub fn has_more_entries(&self) -> bool {
        let Some(ledger) = self.ledger.upgrade() else {
            return false;
        };
        let read = self.state.lock().read_position;
        ledger.with_state(|ls| ls.count_entries(ls.previous_position(read), ls.last_confirmed) > 0)
    }

    /// Entries from the read position to the end that are not acknowledged.
    #[must_use]
    pub fn number_of_entries(&self) -> u64 {
        let Some(ledger) = self.ledger.upgrade() else {
            return 0;
        };
        let st = self.state.lock();
        ledger.with_state(|ls| {
            let from = ls.previous_position(st.read_position);
            let all = ls.count_entries(from, ls.last_confirmed);
            all.saturating_sub(deleted_between(ls, &st.deleted, from, ls.last_confirmed))
        })
    }

    /// Entries after the mark-delete position that are not acknowledged.
    #[must_use]
    pub fn number_of_entries_in_backlog(&self) -> u64 {
        let Some(ledger) = self.ledger.upgrade() else {
            return 0;
        };
        let st = self.state.lock();
        ledger.with_state(|ls| {
            let all = ls.count_entries(st.mark_delete, ls.last_confirmed);
            all.saturating_sub(deleted_between(ls, &st.deleted, st.mark_delete, ls.last_confirmed))
        })
    }

    // --- acknowledgement ---

    /// Acknowledge every entry up to and including `position`.
    pub async fn mark_delete(&self, position: Position) -> Result<()> {
        self.mark_delete_with_properties(position, None).await
    }

    /// Like [`mark_delete`](Self::mark_delete), replacing the cursor
    /// properties when `properties` is given.
    pub async fn mark_delete_with_properties(
        &self,
        position: Position,
        properties: Option<BTreeMap<String, String>>,
    ) -> Result<()> {
        let ledger = self.ledger()?;
        {
            let mut st = self.state.lock();
            if st.closed {
                return Err(self.closed_error());
            }
            let lc = ledger.last_confirmed_position();
            if position > lc {
                return Err(Error::invalid_argument(format!(
                    "mark-delete position {position} is beyond the last confirmed entry {lc}"
                )));
            }
            if ledger.is_past_segment_end(position) {
                return Err(Error::invalid_argument(format!(
                    "mark-delete position {position} is past the end of its segment"
                )));
            }
            if position <= st.mark_delete && properties.is_none() {
                return Ok(());
            }
            if position > st.mark_delete {
                self.advance_mark_delete(&ledger, &mut st, position);
            }
            if let Some(properties) = properties {
                st.properties = properties;
            }
        }
        self.persist().await
    }

    /// Acknowledge a single entry.
    pub async fn delete(&self, position: Position) -> Result<()> {
        self.delete_many(&[position]).await
    }

    /// Acknowledge a set of entries. When the ranges reach the entry right
    /// after the mark-delete position, the mark-delete position advances.
    pub async fn delete_many(&self, positions: &[Position]) -> Result<()> {
        let ledger = self.ledger()?;
        let changed = {
            let mut st = self.state.lock();
            if st.closed {
                return Err(self.closed_error());
            }
            let lc = ledger.last_confirmed_position();
            if let Some(p) = positions.iter().find(|p| **p > lc) {
                return Err(Error::invalid_argument(format!(
                    "position {p} is beyond the last confirmed entry {lc}"
                )));
            }
            if let Some(p) = positions.iter().find(|p| ledger.is_past_segment_end(**p)) {
                return Err(Error::invalid_argument(format!(
                    "position {p} is past the end of its segment"
                )));
            }
            let st = &mut *st;
            let (changed, first) = ledger.with_state(|ls| {
                let mut changed = false;
                for &p in positions {
                    if p > st.mark_delete && st.deleted.add(p, |x| ls.next_valid_position(x)) {
                        changed = true;
                    }
                }
                (changed, ls.next_valid_position(st.mark_delete))
            });
            if let Some(range) = st.deleted.first_range().filter(|r| r.first == first) {
                self.advance_mark_delete(&ledger, st, range.last);
            }
            changed
        };
        if changed {
            self.persist().await?;
        }
        Ok(())
    }

    /// Move the mark-delete position forward by `n` entries.
    pub async fn skip_entries(&self, n: i64, mode: IndividualDeleted) -> Result<()> {
        let n = u64::try_from(n)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| Error::invalid_argument(format!("skip count must be positive, got {n}")))?;
        let ledger = self.ledger()?;
        {
            let mut st = self.state.lock();
            if st.closed {
                return Err(self.closed_error());
            }
            let target = ledger.with_state(|ls| {
                let extra = match mode {
                    IndividualDeleted::Include => 0,
                    IndividualDeleted::Exclude => deleted_within_skip(ls, &st, n),
                };
                ls.position_after_n(st.mark_delete, n + extra, PositionBound::StartExcluded)
            });
            if target > st.mark_delete {
                self.advance_mark_delete(&ledger, &mut st, target);
            }
        }
        self.persist().await
    }

    /// Acknowledge everything currently in the ledger.
    pub async fn clear_backlog(&self) -> Result<()> {
        let ledger = self.ledger()?;
        {
            let mut st = self.state.lock();
            if st.closed {
                return Err(self.closed_error());
            }
            let lc = ledger.last_confirmed_position();
            if lc > st.mark_delete {
                self.advance_mark_delete(&ledger, &mut st, lc);
            }
        }
        info!("[{}] Cleared backlog of cursor {}", self.ledger_name, self.name);
        self.persist().await
    }

    /// Advance to `position`, absorb deleted ranges that become contiguous
    /// and keep the read position after the mark-delete position.
    fn advance_mark_delete(&self, ledger: &ManagedLedger, st: &mut CursorState, position: Position) {
        let (md, read) = ledger.with_state(|ls| {
            let mut md = position;
            st.deleted.remove_up_to(md, |p| ls.next_valid_position(p));
            while let Some(range) = st.deleted.take_if_starts_at(ls.next_valid_position(md)) {
                md = range.last;
            }
            let read = if st.read_position <= md {
                ls.next_valid_position(md)
            } else {
                st.read_position
            };
            (md, read)
        });
        st.mark_delete = md;
        st.read_position = read;
        ledger.cursor_updated(&self.name, md, read);
    }

    // --- repositioning ---

    /// Move the read position without touching acknowledgements. The
    /// position is clamped between the mark-delete position and the end.
    pub fn seek(&self, position: Position) -> Result<()> {
        let ledger = self.ledger()?;
        let mut st = self.state.lock();
        if st.closed {
            return Err(self.closed_error());
        }
        let read = ledger.with_state(|ls| {
            position
                .max(ls.next_valid_position(st.mark_delete))
                .min(ls.last_confirmed.next())
        });
        st.read_position = read;
        ledger.cursor_updated(&self.name, st.mark_delete, read);
        Ok(())
    }

    /// Restart reading right after the mark-delete position.
    pub fn rewind(&self) {
        let Some(ledger) = self.ledger.upgrade() else {
            return;
        };
        let mut st = self.state.lock();
        let read = ledger.with_state(|ls| ls.next_valid_position(st.mark_delete));
        st.read_position = read;
        ledger.cursor_updated(&self.name, st.mark_delete, read);
    }

    /// Reposition the cursor so `position` is the next entry read, dropping
    /// all acknowledgements. This may move the cursor backwards.
    pub async fn reset_cursor(&self, position: Position) -> Result<()> {
        let ledger = self.ledger()?;
        {
            let mut st = self.state.lock();
            if st.closed {
                return Err(self.closed_error());
            }
            let (md, read) = ledger
                .with_state(|ls| {
                    let first = ls.first_position();
                    let end = ls.last_confirmed.next();
                    if position < first || position > end {
                        return None;
                    }
                    let md = ls.previous_position(position);
                    Some((md, ls.next_valid_position(md)))
                })
                .ok_or_else(|| {
                    Error::invalid_argument(format!(
                        "reset position {position} is outside the retained entries"
                    ))
                })?;
            st.mark_delete = md;
            st.read_position = read;
            st.deleted.clear();
            ledger.cursor_updated(&self.name, md, read);
        }
        info!(
            "[{}] Reset cursor {} to {position}",
            self.ledger_name, self.name
        );
        self.persist().await
    }

    /// Raise the cursor to `first` after the segments before it were trimmed.
    pub(crate) fn skip_trimmed(&self, first: Position) {
        let Some(ledger) = self.ledger.upgrade() else {
            return;
        };
        let mut st = self.state.lock();
        if st.mark_delete >= first {
            return;
        }
        let st = &mut *st;
        let read = ledger.with_state(|ls| {
            st.deleted.remove_up_to(first, |p| ls.next_valid_position(p));
            st.read_position.max(ls.next_valid_position(first))
        });
        st.mark_delete = first;
        st.read_position = read;
        ledger.cursor_updated(&self.name, first, read);
    }

    // --- lifecycle ---

    /// Persist the current state and stop accepting operations.
    pub async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.persist().await?;
        self.mark_closed();
        if let Some(ledger) = self.ledger.upgrade() {
            ledger.deactivate_cursor(self);
        }
        debug!("[{}] Closed cursor {}", self.ledger_name, self.name);
        Ok(())
    }

    pub(crate) async fn flush(&self) -> Result<()> {
        self.persist().await
    }

    pub(crate) fn mark_closed(&self) {
        self.state.lock().closed = true;
    }

    fn snapshot(&self) -> Option<CursorSnapshot> {
        let st = self.state.lock();
        (!st.closed).then(|| st.snapshot())
    }
}

/// Entries in individually deleted ranges within `(after, up_to]`.
fn deleted_between(
    ls: &LedgerState,
    deleted: &PositionRangeSet,
    after: Position,
    up_to: Position,
) -> u64 {
    deleted
        .iter()
        .filter_map(|r| {
            let first = r.first.max(after.next());
            let last = r.last.min(up_to);
            (first <= last).then(|| ls.count_entries(ls.previous_position(first), last))
        })
        .sum()
}

/// Deleted entries passed over while skipping `n` live entries from the
/// mark-delete position.
fn deleted_within_skip(ls: &LedgerState, st: &CursorState, n: u64) -> u64 {
    let mut remaining = n;
    let mut deleted = 0;
    let mut start = st.mark_delete;
    for range in st.deleted.iter() {
        let gap = ls.count_entries(start, ls.previous_position(range.first));
        if gap >= remaining {
            break;
        }
        remaining -= gap;
        deleted += ls.count_entries(ls.previous_position(range.first), range.last);
        start = range.last;
    }
    deleted
}

impl std::fmt::Debug for ManagedCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("ManagedCursor")
            .field("ledger", &self.ledger_name)
            .field("name", &self.name)
            .field("mark_delete", &st.mark_delete)
            .field("read_position", &st.read_position)
            .field("durable", &self.durable)
            .finish_non_exhaustive()
    }
}
