//! Read path and position arithmetic

use super::{LedgerState, ManagedLedger, State, segment_call, with_timeout};
use crate::entry::Entry;
use crate::stats::LedgerStats;
use mledger_common::{Error, Position, PositionBound, Result, SegmentId};
use mledger_segment::{SegmentError, SegmentHandle};
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::{debug, warn};

/// A read of up to `max` entries starting at a position. It crosses
/// segment boundaries until it is satisfied or reaches the last confirmed
/// entry.
#[derive(Debug)]
pub struct OpReadEntry {
    start: Position,
    max: usize,
    next: Position,
    entries: Vec<Entry>,
}

impl OpReadEntry {
    #[must_use]
    pub const fn new(start: Position, max: usize) -> Self {
        Self {
            start,
            max,
            next: start,
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub const fn start(&self) -> Position {
        self.start
    }

    /// Where a follow-up read should start
    #[must_use]
    pub const fn next_read_position(&self) -> Position {
        self.next
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.max.saturating_sub(self.entries.len())
    }

    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    #[must_use]
    pub fn into_entries(self) -> Vec<Entry> {
        self.entries
    }
}

/// One segment's share of a read.
struct ReadPlan {
    segment_id: SegmentId,
    first: i64,
    last: i64,
    handle: Option<Arc<dyn SegmentHandle>>,
    next: Position,
}

#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
impl LedgerState {
    fn segment_entries(&self, segment_id: SegmentId) -> i64 {
        self.segments
            .get(&segment_id)
            .map_or(0, |s| s.entry_count as i64)
    }

    /// The first readable position after `position`, skipping missing and
    /// empty segments. Never past the slot after the last confirmed entry.
    pub(crate) fn next_valid_position(&self, position: Position) -> Position {
        let cap = self.last_confirmed.next();
        let mut next = position.next();
        loop {
            if next.entry_id >= 0 && next.entry_id < self.segment_entries(next.segment_id) {
                break;
            }
            let following = self
                .segments
                .range(next.segment_id.saturating_add(1)..)
                .next()
                .map(|(id, _)| *id);
            match following {
                Some(id) => next = Position::new(id, 0),
                None => break,
            }
        }
        next.min(cap)
    }

    /// The entry just before `position`, or the slot before the first
    /// retained entry.
    pub(crate) fn previous_position(&self, position: Position) -> Position {
        if position.entry_id > 0 {
            return Position::new(position.segment_id, position.entry_id - 1);
        }
        let mut earlier = self.segments.range(..position.segment_id);
        if let Some((_, info)) = earlier.clone().rev().find(|(_, s)| s.entry_count > 0) {
            return info.last_position();
        }
        let first = earlier.next().map_or(position.segment_id, |(id, _)| *id);
        Position::new(first, -1)
    }

    /// Entries in `(after, up_to]`.
    pub(crate) fn count_entries(&self, after: Position, up_to: Position) -> u64 {
        if after >= up_to {
            return 0;
        }
        if after.segment_id == up_to.segment_id {
            let last = up_to
                .entry_id
                .min(self.segment_entries(up_to.segment_id) - 1);
            return (last - after.entry_id).max(0) as u64;
        }
        let mut count = (self.segment_entries(after.segment_id) - 1 - after.entry_id).max(0) as u64;
        count += self
            .segments
            .range(after.segment_id + 1..up_to.segment_id)
            .map(|(_, s)| s.entry_count)
            .sum::<u64>();
        count += (up_to.entry_id + 1)
            .min(self.segment_entries(up_to.segment_id))
            .max(0) as u64;
        count
    }

    /// The position `n` entries from `start`, clamped to the last confirmed
    /// entry. With `StartIncluded` the start itself counts as the first.
    pub(crate) fn position_after_n(&self, start: Position, n: u64, bound: PositionBound) -> Position {
        let mut current = match bound {
            PositionBound::StartIncluded => start,
            PositionBound::StartExcluded => self.next_valid_position(start),
        };
        let last_segment = self.segments.keys().next_back().copied();
        let mut to_skip = i64::try_from(n).unwrap_or(i64::MAX);
        loop {
            let total = self.segment_entries(current.segment_id);
            let unread = if total > 0 {
                (total - current.entry_id).max(0)
            } else {
                0
            };
            if unread >= to_skip {
                current.entry_id += to_skip;
                break;
            }
            to_skip -= unread;
            let following = self
                .segments
                .range(current.segment_id.saturating_add(1)..)
                .next()
                .map(|(id, _)| *id);
            match following {
                Some(id) if Some(current.segment_id) != last_segment => {
                    current = Position::new(id, 0);
                }
                _ => {
                    current.entry_id = total;
                    break;
                }
            }
        }
        self.previous_position(current).min(self.last_confirmed)
    }

    /// Resolve the next chunk of a read, or `None` past the last entry.
    fn plan_read(&self, start: Position, max: usize) -> Option<ReadPlan> {
        if max == 0 {
            return None;
        }
        let position =
            self.next_valid_position(Position::new(start.segment_id, start.entry_id.max(0) - 1));
        if position > self.last_confirmed {
            return None;
        }
        let entries = self.segment_entries(position.segment_id);
        let wanted = i64::try_from(max).unwrap_or(i64::MAX);
        let last = (entries - 1).min(position.entry_id.saturating_add(wanted - 1));
        let segment_id = position.segment_id;
        let handle = if self.current_id() == Some(segment_id) {
            self.current.clone()
        } else {
            self.read_handles.get(&segment_id).cloned()
        };
        Some(ReadPlan {
            segment_id,
            first: position.entry_id,
            last,
            handle,
            next: self.next_valid_position(Position::new(segment_id, last)),
        })
    }
}

impl ManagedLedger {
    /// Position of the newest durable entry, `(current, -1)` right after a
    /// rollover.
    #[must_use]
    pub fn last_confirmed_position(&self) -> Position {
        self.state.lock().last_confirmed
    }

    /// True when `position` names an entry after the end of a sealed segment.
    pub(crate) fn is_past_segment_end(&self, position: Position) -> bool {
        let st = self.state.lock();
        st.current_id() != Some(position.segment_id)
            && st.segments.get(&position.segment_id).is_some_and(|s| {
                position.entry_id >= i64::try_from(s.entry_count).unwrap_or(i64::MAX)
            })
    }

    /// The slot before the oldest retained entry.
    #[must_use]
    pub fn first_position(&self) -> Position {
        self.state.lock().first_position()
    }

    /// Position of the newest entry across all segments, if any.
    #[must_use]
    pub fn last_entry_position(&self) -> Option<Position> {
        let st = self.state.lock();
        st.segments
            .values()
            .rev()
            .find(|s| s.entry_count > 0)
            .map(mledger_common::SegmentInfo::last_position)
    }

    #[must_use]
    pub fn next_valid_position(&self, position: Position) -> Position {
        self.state.lock().next_valid_position(position)
    }

    #[must_use]
    pub fn previous_position(&self, position: Position) -> Position {
        self.state.lock().previous_position(position)
    }

    #[must_use]
    pub fn position_after_n(&self, start: Position, n: u64, bound: PositionBound) -> Position {
        self.state.lock().position_after_n(start, n, bound)
    }

    /// Entries in `(after, up_to]`.
    #[must_use]
    pub fn count_entries(&self, after: Position, up_to: Position) -> u64 {
        self.state.lock().count_entries(after, up_to)
    }

    /// Entries in the inclusive range.
    #[must_use]
    pub fn number_of_entries_between(&self, range: RangeInclusive<Position>) -> u64 {
        let st = self.state.lock();
        let after = st.previous_position(*range.start());
        st.count_entries(after, *range.end())
    }

    /// True when nothing was written after `position`.
    #[must_use]
    pub fn is_no_messages_after(&self, position: Position) -> bool {
        let st = self.state.lock();
        st.count_entries(position, st.last_confirmed) == 0
    }

    /// Entries after the slowest cursor's mark-delete position.
    #[must_use]
    pub fn number_of_active_entries(&self) -> u64 {
        let Some(slowest) = self.cursors.read().slowest_position() else {
            return 0;
        };
        let st = self.state.lock();
        st.count_entries(slowest, st.last_confirmed)
    }

    /// Bytes not yet acknowledged by the slowest cursor.
    #[must_use]
    pub fn estimated_backlog_size(&self) -> u64 {
        self.cursors
            .read()
            .slowest_position()
            .map_or(0, |p| self.estimated_backlog_size_from(p))
    }

    /// Bytes after `position`. Whole segments are summed; the partially
    /// consumed one is estimated from its average entry size.
    #[must_use]
    pub fn estimated_backlog_size_from(&self, position: Position) -> u64 {
        let st = self.state.lock();
        let later: u64 = st
            .segments
            .range(position.segment_id.saturating_add(1)..)
            .map(|(_, s)| s.size_bytes)
            .sum();
        let partial = st.segments.get(&position.segment_id).map_or(0, |s| {
            if s.entry_count == 0 {
                return 0;
            }
            let consumed = u64::try_from(position.entry_id + 1).unwrap_or(0);
            let remaining = s.entry_count.saturating_sub(consumed);
            s.size_bytes / s.entry_count * remaining
        });
        later + partial
    }

    fn check_readable(&self) -> Result<()> {
        match self.state.lock().state {
            State::Fenced => Err(Error::fenced(&self.name)),
            State::Closed => Err(Error::closed(&self.name)),
            _ => Ok(()),
        }
    }

    /// Trimming removes the oldest segments first, so every trimmed id sits
    /// below the first retained segment. No history of removed ids is kept:
    /// an id below the first segment that this ledger never owned is reported
    /// as gone too.
    fn segment_gone(st: &LedgerState, segment_id: SegmentId) -> bool {
        st.segments.keys().next().is_some_and(|first| segment_id < *first)
    }

    /// Read one entry.
    pub async fn read_entry(&self, position: Position) -> Result<Entry> {
        self.check_readable()?;
        {
            let st = self.state.lock();
            if Self::segment_gone(&st, position.segment_id) {
                return Err(Error::SegmentNotExist {
                    ledger: self.name.clone(),
                    segment_id: position.segment_id,
                });
            }
            if position.entry_id < 0
                || position.entry_id >= st.segment_entries_checked(position.segment_id)
            {
                return Err(Error::PositionNotFound {
                    ledger: self.name.clone(),
                    position,
                });
            }
        }
        let mut op = OpReadEntry::new(position, 1);
        self.read_entries_into(&mut op, false).await?;
        op.into_entries()
            .into_iter()
            .next()
            .filter(|e| e.position() == position)
            .ok_or(Error::PositionNotFound {
                ledger: self.name.clone(),
                position,
            })
    }

    /// Read up to `max` entries starting at `start`.
    pub async fn read_entries(&self, start: Position, max: usize) -> Result<Vec<Entry>> {
        let mut op = OpReadEntry::new(start, max);
        self.read_entries_into(&mut op, false).await?;
        Ok(op.into_entries())
    }

    /// Fill `op`, crossing segments as needed. Entries at or after the
    /// eviction floor are cached when `populate_cache` is set.
    pub(crate) async fn read_entries_into(
        &self,
        op: &mut OpReadEntry,
        populate_cache: bool,
    ) -> Result<()> {
        self.check_readable()?;
        while op.remaining() > 0 {
            let plan = self.state.lock().plan_read(op.next, op.remaining());
            let Some(plan) = plan else {
                break;
            };
            let next = plan.next;
            let entries = match self.read_segment(plan, populate_cache).await {
                Ok(entries) => entries,
                Err(e) => {
                    LedgerStats::incr(&self.stats.read_failures, 1);
                    return Err(e);
                }
            };
            LedgerStats::incr(&self.stats.entries_read, entries.len() as u64);
            op.entries.extend(entries);
            op.next = next;
        }
        Ok(())
    }

    async fn read_segment(&self, plan: ReadPlan, populate_cache: bool) -> Result<Vec<Entry>> {
        let ReadPlan {
            segment_id,
            first,
            last,
            handle,
            ..
        } = plan;
        let mut entries = Vec::new();
        let mut next = first;
        while next <= last {
            let position = Position::new(segment_id, next);
            match self.cache.get(position) {
                Some(data) => entries.push(Entry::new(position, data)),
                None => break,
            }
            next += 1;
        }
        if next > last {
            return Ok(entries);
        }

        let handle = match handle {
            Some(handle) => handle,
            None => self.open_read_handle(segment_id).await?,
        };
        let data = match segment_call(
            "read entries",
            self.config
                .read_entry_timeout()
                .unwrap_or(std::time::Duration::MAX),
            handle.read(next, last),
        )
        .await?
        {
            Ok(data) => data,
            Err(SegmentError::NotFound(_)) => return Err(self.missing_segment(segment_id)),
            Err(e) => return Err(e.into()),
        };

        let floor = *self.eviction_floor.lock();
        for (position, data) in (next..).map(|e| Position::new(segment_id, e)).zip(data) {
            if populate_cache && position >= floor {
                self.cache.insert(position, data.clone());
            }
            entries.push(Entry::new(position, data));
        }
        debug!(
            "[{}] Read {} entries from segment {segment_id} ({next}..={last})",
            self.name,
            entries.len()
        );
        Ok(entries)
    }

    fn missing_segment(&self, segment_id: SegmentId) -> Error {
        let st = self.state.lock();
        if Self::segment_gone(&st, segment_id) {
            Error::SegmentNotExist {
                ledger: self.name.clone(),
                segment_id,
            }
        } else {
            Error::Segment(SegmentError::NotFound(segment_id).to_string())
        }
    }

    /// Open (and remember) a read handle for a sealed segment.
    pub(crate) async fn open_read_handle(&self, segment_id: SegmentId) -> Result<Arc<dyn SegmentHandle>> {
        let limit = self.config.metadata_operations_timeout();
        match segment_call("open segment", limit, self.segment_store.open(segment_id)).await? {
            Ok(handle) => {
                let mut st = self.state.lock();
                if st.segments.contains_key(&segment_id) {
                    st.read_handles.insert(segment_id, Arc::clone(&handle));
                }
                Ok(handle)
            }
            Err(SegmentError::NotFound(_)) => {
                warn!("[{}] Segment {segment_id} is gone from the store", self.name);
                Err(self.missing_segment(segment_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) async fn seal_with_timeout(&self, handle: &Arc<dyn SegmentHandle>) -> Result<()> {
        with_timeout(
            "seal segment",
            Some(self.config.metadata_operations_timeout()),
            handle.seal(),
        )
        .await
    }
}

#[allow(clippy::cast_possible_wrap)]
impl LedgerState {
    /// Entry count of a known segment, -1 when unknown.
    fn segment_entries_checked(&self, segment_id: SegmentId) -> i64 {
        self.segments
            .get(&segment_id)
            .map_or(-1, |s| s.entry_count as i64)
    }
}
