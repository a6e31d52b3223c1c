//! Write path: pending adds, rollover and ledger metadata updates

use super::{LedgerState, ManagedLedger, State, now_ms, slice_payload, with_timeout};
use crate::stats::LedgerStats;
use bytes::Bytes;
use mledger_common::{Error, LedgerInfo, Position, Result, SegmentId, SegmentInfo};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Submissions of one add before a non-timeout failure is reported
const MAX_ADD_ATTEMPTS: u32 = 3;

/// One add waiting for its acknowledgement.
pub struct OpAddEntry {
    seq: u64,
    data: Bytes,
    /// Segment the entry was handed to, `None` while queued
    segment_id: Option<SegmentId>,
    attempts: u32,
    outcome: Option<Result<i64>>,
    callback: Option<oneshot::Sender<Result<Position>>>,
    created: Instant,
}

impl OpAddEntry {
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub const fn is_submitted(&self) -> bool {
        self.segment_id.is_some()
    }

    pub(crate) fn complete(mut self, result: Result<Position>) {
        if let Some(callback) = self.callback.take() {
            // The caller may have stopped waiting.
            let _ = callback.send(result);
        }
    }
}

/// Adds in submission order. Completions are released from the front only,
/// so callers observe them in the order they were issued.
#[derive(Default)]
pub struct PendingWriteQueue {
    ops: VecDeque<OpAddEntry>,
    next_seq: u64,
}

impl PendingWriteQueue {
    pub(crate) fn push(
        &mut self,
        data: Bytes,
        callback: oneshot::Sender<Result<Position>>,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ops.push_back(OpAddEntry {
            seq,
            data,
            segment_id: None,
            attempts: 0,
            outcome: None,
            callback: Some(callback),
            created: Instant::now(),
        });
        seq
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Ops handed to the segment store and not yet released
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.ops.iter().filter(|op| op.is_submitted()).count()
    }

    fn get_mut(&mut self, seq: u64) -> Option<&mut OpAddEntry> {
        let index = self.ops.binary_search_by_key(&seq, |op| op.seq).ok()?;
        self.ops.get_mut(index)
    }

    fn front(&self) -> Option<&OpAddEntry> {
        self.ops.front()
    }

    fn pop_front(&mut self) -> Option<OpAddEntry> {
        self.ops.pop_front()
    }

    fn next_unsubmitted(&mut self) -> Option<&mut OpAddEntry> {
        self.ops.iter_mut().find(|op| !op.is_submitted())
    }

    /// Forget every submission; the ops will be replayed on a new segment.
    fn reset_submitted(&mut self) {
        for op in &mut self.ops {
            op.segment_id = None;
            op.outcome = None;
        }
    }

    pub(crate) fn take_unsubmitted(&mut self) -> Vec<OpAddEntry> {
        let (taken, kept): (Vec<_>, Vec<_>) =
            self.ops.drain(..).partition(|op| !op.is_submitted());
        self.ops = kept.into();
        taken
    }

    pub(crate) fn drain_all(&mut self) -> Vec<OpAddEntry> {
        self.ops.drain(..).collect()
    }
}

fn fail_all(ops: Vec<OpAddEntry>, error: &Error) {
    for op in ops {
        op.complete(Err(error.clone()));
    }
}

impl ManagedLedger {
    /// Append an entry and return its position once it is durable.
    pub async fn add_entry(&self, data: impl Into<Bytes>) -> Result<Position> {
        let rx = self.enqueue_add(data.into())?;
        rx.await.map_err(|_| Error::closed(&self.name))?
    }

    /// Append `len` bytes of `data` starting at `offset`.
    pub async fn add_entry_with_offset(
        &self,
        data: &Bytes,
        offset: usize,
        len: usize,
    ) -> Result<Position> {
        let payload = slice_payload(data, offset, len)?;
        self.add_entry(payload).await
    }

    fn enqueue_add(&self, data: Bytes) -> Result<oneshot::Receiver<Result<Position>>> {
        let mut st = self.state.lock();
        self.check_writable(&st)?;
        if st.suspect && !self.meta.session_available() {
            return Err(Error::StoreUnavailable(format!(
                "ledger {} cannot replace its failed segment without a metadata session",
                self.name
            )));
        }
        let (tx, rx) = oneshot::channel();
        st.pending.push(data, tx);
        self.submit_pending(&mut st);
        Ok(rx)
    }

    /// Whether the current segment must not take more entries.
    fn segment_full(&self, st: &LedgerState) -> bool {
        // Without a session a new segment could not be recorded.
        if !self.meta.session_available() {
            return false;
        }
        if st.rollover_requested {
            return true;
        }
        let age = st.current_created.elapsed();
        if age < self.config.min_rollover_time() {
            return false;
        }
        st.submitted_entries >= self.config.max_entries_per_segment
            || st.submitted_bytes >= self.config.max_segment_size_bytes()
            || (st.submitted_entries > 0 && age >= self.config.max_rollover_time())
    }

    /// Hand queued adds to the current segment, then start a rollover if
    /// one is due.
    pub(super) fn submit_pending(&self, st: &mut LedgerState) {
        while st.state == State::LedgerOpened
            && !st.needs_new_segment
            && !st.suspect
            && !self.segment_full(st)
        {
            let Some(handle) = st.current.clone() else {
                break;
            };
            let Some(op) = st.pending.next_unsubmitted() else {
                break;
            };
            let segment_id = handle.segment_id();
            op.segment_id = Some(segment_id);
            op.attempts += 1;
            let seq = op.seq;
            let len = op.data.len() as u64;
            let ack = handle.append(op.data.clone());
            st.submitted_entries += 1;
            st.submitted_bytes += len;

            let weak = self.weak.clone();
            let limit = self.config.add_entry_timeout();
            tokio::spawn(async move {
                let outcome = with_timeout("add entry", limit, ack).await;
                if let Some(ledger) = weak.upgrade() {
                    ledger.add_complete(seq, segment_id, outcome);
                }
            });
        }
        self.maybe_start_rollover(st);
    }

    /// Record the acknowledgement of one add and release every completed
    /// op at the front of the queue.
    fn add_complete(&self, seq: u64, segment_id: SegmentId, outcome: Result<i64>) {
        let mut confirmed: Vec<(Position, Bytes)> = Vec::new();
        {
            let mut st = self.state.lock();
            match st.pending.get_mut(seq) {
                Some(op) if op.segment_id == Some(segment_id) => op.outcome = Some(outcome),
                // Superseded by a rollover or already failed.
                _ => return,
            }

            while let Some(front) = st.pending.front() {
                let Some(outcome) = front.outcome.clone() else {
                    break;
                };
                match outcome {
                    Ok(entry_id) => {
                        let Some(op) = st.pending.pop_front() else {
                            break;
                        };
                        let segment = op.segment_id.unwrap_or(segment_id);
                        let position = self.apply_confirmed(&mut st, segment, entry_id, &op);
                        confirmed.push((position, op.data.clone()));
                        op.complete(Ok(position));
                    }
                    Err(e) => {
                        self.add_failed(&mut st, e);
                        break;
                    }
                }
            }

            if st.pending.in_flight() == 0 {
                self.pending_drained.notify_waiters();
            }
            self.submit_pending(&mut st);
        }

        if !confirmed.is_empty() {
            let floor = *self.eviction_floor.lock();
            for (position, data) in confirmed {
                if position >= floor {
                    self.cache.insert(position, data);
                }
            }
            self.entries_available.notify_waiters();
        }
    }

    fn apply_confirmed(
        &self,
        st: &mut LedgerState,
        segment_id: SegmentId,
        entry_id: i64,
        op: &OpAddEntry,
    ) -> Position {
        let len = op.data.len() as u64;
        if let Some(info) = st.segments.get_mut(&segment_id) {
            info.entry_count += 1;
            info.size_bytes += len;
        }
        let position = Position::new(segment_id, entry_id);
        st.last_confirmed = st.last_confirmed.max(position);
        st.last_add_time = Instant::now();
        self.num_entries.fetch_add(1, Ordering::Relaxed);
        self.total_size.fetch_add(len, Ordering::Relaxed);
        LedgerStats::incr(&self.stats.adds_succeeded, 1);
        LedgerStats::incr(&self.stats.bytes_added, len);
        debug!(
            "[{}] Add {} confirmed at {position} after {:?}",
            self.name,
            op.seq,
            op.created.elapsed()
        );
        position
    }

    /// The front op failed. Its segment can no longer be trusted: anything
    /// after the failure may or may not have landed, so the segment is
    /// abandoned and the surviving ops are replayed on a new one.
    fn add_failed(&self, st: &mut LedgerState, error: Error) {
        let segment_id = st.current_id();
        let terminal = error.is_timeout()
            || st.state.is_terminal()
            || st.pending.front().is_some_and(|op| op.attempts >= MAX_ADD_ATTEMPTS);
        warn!(
            "[{}] Add failed on segment {segment_id:?}: {error}; abandoning the segment",
            self.name
        );
        if terminal {
            if let Some(op) = st.pending.pop_front() {
                LedgerStats::incr(&self.stats.adds_failed, 1);
                op.complete(Err(error));
            }
        }
        st.suspect = true;
        st.pending.reset_submitted();
        if st.state.is_terminal() {
            let ops = st.pending.drain_all();
            LedgerStats::incr(&self.stats.adds_failed, ops.len() as u64);
            fail_all(ops, &Error::closed(&self.name));
        }
    }

    /// Start a rollover when one is due and nothing is in flight.
    fn maybe_start_rollover(&self, st: &mut LedgerState) {
        if st.state != State::LedgerOpened || st.pending.in_flight() > 0 {
            return;
        }
        let due = st.suspect
            || (st.needs_new_segment && !st.pending.is_empty())
            || self.segment_full(st);
        if !due {
            return;
        }
        if !self.meta.session_available() {
            debug!(
                "[{}] Rollover deferred: metadata session unavailable",
                self.name
            );
            return;
        }
        st.state = State::CreatingLedger;
        let weak = self.weak.clone();
        tokio::spawn(async move {
            if let Some(ledger) = weak.upgrade() {
                ledger.rollover().await;
            }
        });
    }

    /// Re-check the age of the current segment.
    pub(super) fn roll_if_full(&self) {
        let mut st = self.state.lock();
        self.maybe_start_rollover(&mut st);
    }

    /// Ask for the current segment to be replaced after in-flight adds finish.
    pub(super) fn request_rollover(&self, st: &mut LedgerState) {
        st.rollover_requested = true;
        self.maybe_start_rollover(st);
    }

    /// Seal the current segment and switch to a new one.
    async fn rollover(&self) {
        let _guard = self.structure_lock.lock().await;
        let old = {
            let st = self.state.lock();
            if st.state != State::CreatingLedger {
                return;
            }
            st.current.clone()
        };
        let op_timeout = Some(self.config.metadata_operations_timeout());

        let mut old_id = None;
        let mut discard_old = false;
        if let Some(old) = &old {
            let id = old.segment_id();
            if let Err(e) = with_timeout("seal segment", op_timeout, old.seal()).await {
                warn!("[{}] Failed to seal segment {id}: {e}", self.name);
            }
            discard_old = self
                .state
                .lock()
                .segments
                .get(&id)
                .is_none_or(|s| s.entry_count == 0);
            old_id = Some(id);
        }

        let created = with_timeout(
            "create segment",
            op_timeout,
            self.segment_store.create(&self.config.ensemble),
        )
        .await;
        let handle = match created {
            Ok(handle) => handle,
            Err(e) => {
                warn!("[{}] Failed to create a new segment: {e}", self.name);
                self.rollover_failed(&e);
                return;
            }
        };
        let new_id = handle.segment_id();

        let closed_at = now_ms();
        let persisted = self
            .update_ledger_info(move |_, segments| {
                if let Some(id) = old_id {
                    if discard_old {
                        segments.remove(&id);
                    } else if let Some(info) = segments.get_mut(&id) {
                        info.close_timestamp_ms = closed_at;
                    }
                }
                segments.insert(new_id, SegmentInfo::new(new_id));
                Ok(())
            })
            .await;
        if let Err(e) = persisted {
            warn!(
                "[{}] Failed to record segment {new_id}: {e}; deleting it",
                self.name
            );
            self.delete_segment_quietly(new_id).await;
            if !e.is_fenced() {
                self.rollover_failed(&e);
            }
            return;
        }

        {
            let mut st = self.state.lock();
            if let (Some(old), false) = (old, discard_old) {
                st.read_handles.insert(old.segment_id(), old);
            }
            let now = Instant::now();
            st.current = Some(handle);
            st.current_created = now;
            st.last_add_time = now;
            st.submitted_entries = 0;
            st.submitted_bytes = 0;
            st.needs_new_segment = false;
            st.rollover_requested = false;
            st.suspect = false;
            st.last_confirmed = Position::new(new_id, -1);
            if st.state == State::CreatingLedger {
                st.state = State::LedgerOpened;
            }
            self.submit_pending(&mut st);
        }
        if let (Some(id), true) = (old_id, discard_old) {
            self.delete_segment_quietly(id).await;
        }

        LedgerStats::incr(&self.stats.rollovers, 1);
        info!(
            "[{}] Rolled over from segment {old_id:?} to segment {new_id}",
            self.name
        );
        if !self.is_closed() {
            self.schedule_rollover_timer();
        }
        self.schedule_trim();
    }

    fn rollover_failed(&self, error: &Error) {
        let ops = {
            let mut st = self.state.lock();
            if st.state == State::CreatingLedger {
                st.state = State::LedgerOpened;
            }
            st.needs_new_segment = true;
            st.pending.drain_all()
        };
        LedgerStats::incr(&self.stats.adds_failed, ops.len() as u64);
        fail_all(ops, error);
    }

    /// Apply `mutate` to the ledger record and persist it with the expected
    /// version. The live state only changes once the write succeeded.
    ///
    /// A version conflict is retried when the stored record still matches
    /// what this instance last wrote; any other content means another owner
    /// took over and the ledger is fenced.
    pub(crate) async fn update_ledger_info<F>(&self, mutate: F) -> Result<()>
    where
        F: Fn(&mut BTreeMap<String, String>, &mut BTreeMap<SegmentId, SegmentInfo>) -> Result<()>
            + Send,
    {
        let mut slot = self.meta_slot.lock().await;
        let mut conflicts = 0;
        loop {
            let (mut properties, mut segments) = {
                let st = self.state.lock();
                if st.state == State::Fenced {
                    return Err(Error::fenced(&self.name));
                }
                (st.properties.clone(), st.segments.clone())
            };
            mutate(&mut properties, &mut segments)?;
            let record = LedgerInfo {
                segments: segments.into_values().collect(),
                properties,
            };

            match self
                .meta
                .put_ledger_info(&self.name, &record, slot.version)
                .await
            {
                Ok(version) => {
                    slot.version = Some(version);
                    slot.persisted = record;
                    let mut st = self.state.lock();
                    let LedgerState {
                        properties,
                        segments,
                        ..
                    } = &mut *st;
                    return mutate(properties, segments);
                }
                Err(e) if e.is_version_conflict() => {
                    conflicts += 1;
                    let stored = self.meta.get_ledger_info(&self.name).await?;
                    match stored {
                        Some((current, version)) if current == slot.persisted => {
                            if conflicts > self.config.metadata_max_retries {
                                return Err(e);
                            }
                            warn!(
                                "[{}] Ledger record version moved to {version} without changes; retrying",
                                self.name
                            );
                            slot.version = Some(version);
                        }
                        _ => {
                            drop(slot);
                            self.fence();
                            return Err(Error::fenced(&self.name));
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Another owner changed the ledger record: stop all activity.
    pub(crate) fn fence(&self) {
        let ops = {
            let mut st = self.state.lock();
            if st.state == State::Fenced {
                return;
            }
            st.state = State::Fenced;
            st.pending.drain_all()
        };
        error!(
            "[{}] Ledger fenced: its metadata was modified by another owner",
            self.name
        );
        LedgerStats::incr(&self.stats.adds_failed, ops.len() as u64);
        fail_all(ops, &Error::fenced(&self.name));
        self.cancel_tasks();
        self.entries_available.notify_waiters();
        self.pending_drained.notify_waiters();
        self.run_on_close();
    }

    /// Id of the writable segment
    #[must_use]
    pub fn current_segment_id(&self) -> Option<SegmentId> {
        self.state.lock().current_id()
    }

    /// Adds queued or in flight
    #[must_use]
    pub fn pending_add_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(queue: &mut PendingWriteQueue, data: &'static [u8]) -> (u64, oneshot::Receiver<Result<Position>>) {
        let (tx, rx) = oneshot::channel();
        (queue.push(Bytes::from_static(data), tx), rx)
    }

    #[test]
    fn test_queue_order_and_submission() {
        let mut queue = PendingWriteQueue::default();
        let (a, _ra) = op(&mut queue, b"a");
        let (b, _rb) = op(&mut queue, b"bb");
        let (c, _rc) = op(&mut queue, b"ccc");
        assert!(a < b && b < c);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.in_flight(), 0);

        queue.next_unsubmitted().unwrap().segment_id = Some(1);
        queue.next_unsubmitted().unwrap().segment_id = Some(1);
        assert_eq!(queue.in_flight(), 2);
        assert_eq!(queue.next_unsubmitted().unwrap().seq(), c);

        assert_eq!(queue.get_mut(b).unwrap().len(), 2);
        assert!(queue.get_mut(99).is_none());

        let taken = queue.take_unsubmitted();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].seq(), c);
        assert_eq!(queue.len(), 2);

        queue.reset_submitted();
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.front().unwrap().seq(), a);
    }

    #[tokio::test]
    async fn test_complete_delivers_once() {
        let mut queue = PendingWriteQueue::default();
        let (_, rx) = op(&mut queue, b"x");
        let (_, dropped) = op(&mut queue, b"y");
        drop(dropped);

        let ops = queue.drain_all();
        assert!(queue.is_empty());
        fail_all(ops, &Error::closed("l"));
        assert!(matches!(rx.await.unwrap(), Err(Error::Closed { .. })));
    }
}
