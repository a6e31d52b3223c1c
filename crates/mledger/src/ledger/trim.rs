//! Trimming, truncation, offload and inactive segment rollover

use super::{ManagedLedger, State, now_ms};
use crate::stats::LedgerStats;
use mledger_common::{Error, Position, Result, SegmentId, SegmentInfo};
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

impl ManagedLedger {
    /// Run a trim in the background. Requests made while one is queued
    /// are coalesced.
    pub fn schedule_trim(&self) {
        if self.trim_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = self.weak.clone();
        tokio::spawn(async move {
            let Some(ledger) = weak.upgrade() else {
                return;
            };
            if let Err(e) = ledger.trim_consumed_segments().await {
                if !e.is_fenced() && !matches!(e, Error::Closed { .. }) {
                    warn!("[{}] Trim failed: {e}", ledger.name);
                }
            }
        });
    }

    /// Delete consumed segments that fell out of the retention window.
    pub async fn trim_consumed_segments(&self) -> Result<()> {
        self.internal_trim(false).await
    }

    /// Delete every segment consumed by all cursors, ignoring retention.
    pub async fn truncate(&self) -> Result<()> {
        self.check_open()?;
        self.wait_cursors_recovered().await?;
        self.internal_trim(true).await
    }

    async fn internal_trim(&self, ignore_retention: bool) -> Result<()> {
        let _guard = self.structure_lock.lock().await;
        self.trim_scheduled.store(false, Ordering::Release);
        self.check_open()?;
        if !self.cursors_recovered() {
            debug!("[{}] Trim skipped: cursors not recovered yet", self.name);
            return Ok(());
        }
        if !self.meta.session_available() {
            debug!("[{}] Trim skipped: metadata session unavailable", self.name);
            return Ok(());
        }

        let slowest = self.cursors.read().slowest_position();
        let doomed = self.segments_to_trim(slowest, ignore_retention);
        if doomed.is_empty() {
            return Ok(());
        }

        let ids: Vec<SegmentId> = doomed.iter().map(|s| s.segment_id).collect();
        let removed = ids.clone();
        self.update_ledger_info(move |_, segments| {
            for id in &removed {
                segments.remove(id);
            }
            Ok(())
        })
        .await?;

        let first = {
            let mut st = self.state.lock();
            for id in &ids {
                st.read_handles.remove(id);
            }
            self.recompute_counters(&st);
            st.first_position()
        };
        for info in &doomed {
            self.cache.invalidate_segment(info.segment_id);
            self.delete_segment_quietly(info.segment_id).await;
            self.delete_offloaded(info).await;
        }
        LedgerStats::incr(&self.stats.trims, 1);
        info!(
            "[{}] Trimmed {} segments {ids:?}; {} entries remain",
            self.name,
            ids.len(),
            self.number_of_entries()
        );

        for cursor in self.get_cursors() {
            cursor.skip_trimmed(first);
        }
        Ok(())
    }

    /// Oldest-first run of sealed segments that every cursor consumed and
    /// retention no longer protects.
    fn segments_to_trim(&self, slowest: Option<Position>, ignore_retention: bool) -> Vec<SegmentInfo> {
        let retention_time = self.config.retention_time_ms;
        let retention_size = self.config.retention_size_bytes();
        let now = now_ms();

        let st = self.state.lock();
        let bound = slowest.unwrap_or(st.last_confirmed);
        let current = st.current_id();
        let total: u64 = st.segments.values().map(|s| s.size_bytes).sum();

        let mut doomed = Vec::new();
        let mut size_to_delete = 0;
        for info in st.segments.values() {
            if Some(info.segment_id) == current || !info.is_sealed() {
                break;
            }
            let consumed =
                info.segment_id < bound.segment_id || info.last_position() <= bound;
            if !consumed {
                break;
            }
            let expired = match retention_time {
                t if t < 0 => false,
                0 => true,
                t => now.saturating_sub(info.close_timestamp_ms) > t.unsigned_abs(),
            };
            let over_quota =
                retention_size.is_some_and(|limit| total - size_to_delete > limit);
            if !(ignore_retention || expired || over_quota) {
                break;
            }
            size_to_delete += info.size_bytes;
            doomed.push(info.clone());
        }
        doomed
    }

    pub(super) async fn delete_offloaded(&self, info: &SegmentInfo) {
        let (Some(offloader), Some(_)) = (&self.offloader, &info.offload) else {
            return;
        };
        if let Err(e) = offloader.delete_offloaded(&self.name, info).await {
            warn!(
                "[{}] Failed to delete offloaded copy of segment {}: {e}",
                self.name, info.segment_id
            );
        }
    }

    /// Offload every sealed segment that lies entirely before `up_to`.
    /// Returns the first position that is still only in the segment store.
    pub async fn offload_prefix(&self, up_to: Position) -> Result<Position> {
        let Some(offloader) = self.offloader.clone() else {
            return Err(Error::invalid_argument(format!(
                "ledger {} has no offloader configured",
                self.name
            )));
        };
        self.check_open()?;
        let _guard = self.structure_lock.lock().await;

        let candidates: Vec<SegmentInfo> = {
            let st = self.state.lock();
            let current = st.current_id();
            st.segments
                .values()
                .filter(|s| {
                    s.segment_id < up_to.segment_id
                        && Some(s.segment_id) != current
                        && s.is_sealed()
                        && s.offload.is_none()
                })
                .cloned()
                .collect()
        };

        for info in candidates {
            let id = info.segment_id;
            let handle = self.open_read_handle(id).await?;
            let result = offloader.offload(&self.name, &info, handle).await?;
            debug!(
                "[{}] Offloaded segment {id} to {}",
                self.name, result.location
            );
            self.update_ledger_info(move |_, segments| {
                if let Some(segment) = segments.get_mut(&id) {
                    segment.offload = Some(result.clone());
                }
                Ok(())
            })
            .await?;
        }

        let st = self.state.lock();
        let first_kept = st
            .segments
            .values()
            .find(|s| s.offload.is_none())
            .map_or(st.last_confirmed.next(), |s| Position::new(s.segment_id, 0));
        Ok(first_kept)
    }

    /// Offload the oldest segments once the ledger grows past the
    /// configured threshold.
    pub(super) async fn maybe_offload(&self) {
        let Ok(threshold) = u64::try_from(self.config.offload_threshold_bytes) else {
            return;
        };
        if self.offloader.is_none() || self.total_size() <= threshold {
            return;
        }
        let up_to = {
            let st = self.state.lock();
            let current = st.current_id();
            let mut kept = 0u64;
            let mut boundary = None;
            for info in st.segments.values().rev() {
                if Some(info.segment_id) == current {
                    continue;
                }
                kept += info.size_bytes;
                if kept > threshold {
                    boundary = Some(Position::new(info.segment_id + 1, 0));
                    break;
                }
            }
            boundary
        };
        if let Some(up_to) = up_to {
            if let Err(e) = self.offload_prefix(up_to).await {
                warn!("[{}] Threshold offload failed: {e}", self.name);
            }
        }
    }

    /// Roll the current segment over if it has entries and saw no adds for
    /// the configured inactivity window. Returns whether a rollover was
    /// requested.
    pub fn check_inactive_segment_and_rollover(&self) -> bool {
        let Some(window) = self.config.inactive_segment_rollover_time() else {
            return false;
        };
        let mut st = self.state.lock();
        if st.state != State::LedgerOpened
            || st.pending.in_flight() > 0
            || st.last_add_time.elapsed() < window
            || !self.meta.session_available()
        {
            return false;
        }
        let has_entries = st
            .current_id()
            .and_then(|id| st.segments.get(&id))
            .is_some_and(|s| s.entry_count > 0);
        if !has_entries {
            return false;
        }
        debug!(
            "[{}] Current segment inactive for {:?}; rolling over",
            self.name,
            st.last_add_time.elapsed()
        );
        self.request_rollover(&mut st);
        true
    }
}
