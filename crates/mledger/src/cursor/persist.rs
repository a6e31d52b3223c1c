//! Cursor state persistence
//!
//! A cursor with few individually deleted ranges is stored inline in its
//! metadata record. Past `max_unacked_ranges_inline` ranges the state goes
//! to a segment owned by the cursor instead, one snapshot per entry framed
//! as `[crc32c u32 LE][bincode CursorSnapshot]`, and the record only points
//! at that segment. The record is rewritten when the segment changes.

use super::ManagedCursor;
use crate::ledger::{ManagedLedger, segment_call, with_timeout};
use bytes::Bytes;
use mledger_common::{CursorInfo, CursorSnapshot, Error, Result, SegmentId};
use mledger_meta_store::Version;
use mledger_segment::{SegmentError, SegmentHandle};
use std::sync::Arc;
use tracing::{debug, info, warn};

const CRC_LEN: usize = 4;

/// What this cursor last wrote to the metadata store.
#[derive(Default)]
pub(crate) struct PersistSlot {
    version: Option<Version>,
    /// Segment currently receiving snapshots
    segment: Option<Arc<dyn SegmentHandle>>,
    /// Metadata segments no longer referenced by the record
    stale_segments: Vec<SegmentId>,
    last: Option<CursorSnapshot>,
}

pub(crate) fn encode_snapshot(snapshot: &CursorSnapshot) -> Result<Bytes> {
    let body = bincode::serialize(snapshot).map_err(|e| Error::Serialization(e.to_string()))?;
    let mut buf = Vec::with_capacity(CRC_LEN + body.len());
    buf.extend_from_slice(&crc32c::crc32c(&body).to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(Bytes::from(buf))
}

pub(crate) fn decode_snapshot(data: &[u8]) -> Result<CursorSnapshot> {
    if data.len() < CRC_LEN {
        return Err(Error::Serialization(format!(
            "cursor snapshot too short: {} bytes",
            data.len()
        )));
    }
    let (crc, body) = data.split_at(CRC_LEN);
    let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
    let actual = crc32c::crc32c(body);
    if actual != expected {
        return Err(Error::Serialization(format!(
            "cursor snapshot checksum mismatch: expected {expected:08x}, got {actual:08x}"
        )));
    }
    bincode::deserialize(body).map_err(|e| Error::Serialization(e.to_string()))
}

impl ManagedCursor {
    /// Write the record of a new cursor. A leftover record with the same
    /// name is overwritten.
    pub(super) async fn persist_initial(&self, ledger: &ManagedLedger) -> Result<()> {
        let Some(snapshot) = self.snapshot() else {
            return Ok(());
        };
        let info = CursorInfo {
            snapshot: snapshot.clone(),
            metadata_segment: None,
        };
        let meta = ledger.meta();
        let version = match meta
            .put_cursor_info(&self.ledger_name, &self.name, &info, None)
            .await
        {
            Ok(version) => version,
            Err(e) if e.is_version_conflict() => {
                let stale = meta.get_cursor_info(&self.ledger_name, &self.name).await?;
                let expected = stale.as_ref().map(|(_, v)| *v);
                warn!(
                    "[{}] Overwriting stale record of cursor {}",
                    self.ledger_name, self.name
                );
                let version = meta
                    .put_cursor_info(&self.ledger_name, &self.name, &info, expected)
                    .await?;
                if let Some(id) = stale.and_then(|(old, _)| old.metadata_segment) {
                    delete_segment(ledger, id).await;
                }
                version
            }
            Err(e) => return Err(e),
        };
        let mut slot = self.persist.lock().await;
        slot.version = Some(version);
        slot.last = Some(snapshot);
        Ok(())
    }

    /// Read the persisted state of a durable cursor.
    pub(super) async fn load(
        ledger: &ManagedLedger,
        ledger_name: &str,
        name: &str,
    ) -> Result<(CursorSnapshot, PersistSlot)> {
        let (info, version) = ledger
            .meta()
            .get_cursor_info(ledger_name, name)
            .await?
            .ok_or_else(|| Error::CursorNotFound {
                ledger: ledger_name.to_string(),
                cursor: name.to_string(),
            })?;

        let mut snapshot = info.snapshot;
        let mut stale_segments = Vec::new();
        if let Some(segment_id) = info.metadata_segment {
            match read_last_snapshot(ledger, segment_id).await {
                Ok(Some(full)) => snapshot = full,
                Ok(None) => warn!(
                    "[{ledger_name}] Metadata segment {segment_id} of cursor {name} is empty; using the inline mark-delete position"
                ),
                Err(e) => warn!(
                    "[{ledger_name}] Failed to read metadata segment {segment_id} of cursor {name}: {e}; using the inline mark-delete position"
                ),
            }
            // Sealed by the read; the next write goes elsewhere.
            stale_segments.push(segment_id);
        }

        let slot = PersistSlot {
            version: Some(version),
            segment: None,
            stale_segments,
            last: Some(snapshot.clone()),
        };
        Ok((snapshot, slot))
    }

    /// Persist the current state if it changed since the last write.
    pub(super) async fn persist(&self) -> Result<()> {
        if !self.durable {
            return Ok(());
        }
        let ledger = self.ledger()?;
        let mut slot = self.persist.lock().await;
        let Some(snapshot) = self.snapshot() else {
            return Ok(());
        };
        if slot.last.as_ref() == Some(&snapshot) {
            return Ok(());
        }

        let config = ledger.config();
        let max_retries = config.metadata_max_retries;
        let mut conflicts = 0;
        loop {
            let result = if snapshot.individually_deleted.len() <= config.max_unacked_ranges_inline {
                self.write_inline(&ledger, &mut slot, &snapshot).await
            } else {
                self.write_to_segment(&ledger, &mut slot, &snapshot).await
            };
            match result {
                Ok(()) => {
                    slot.last = Some(snapshot);
                    return Ok(());
                }
                Err(e) if e.is_version_conflict() && conflicts < max_retries => {
                    conflicts += 1;
                    warn!(
                        "[{}] Cursor {} record changed underneath us, retrying ({conflicts}/{max_retries})",
                        self.ledger_name, self.name
                    );
                    self.recover_version(&ledger, &mut slot).await?;
                }
                Err(e) => {
                    warn!(
                        "[{}] Failed to persist cursor {} at {}: {e}",
                        self.ledger_name, self.name, snapshot.mark_delete
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn write_inline(
        &self,
        ledger: &ManagedLedger,
        slot: &mut PersistSlot,
        snapshot: &CursorSnapshot,
    ) -> Result<()> {
        let info = CursorInfo {
            snapshot: snapshot.clone(),
            metadata_segment: None,
        };
        let version = ledger
            .meta()
            .put_cursor_info(&self.ledger_name, &self.name, &info, slot.version)
            .await?;
        slot.version = Some(version);
        if let Some(old) = slot.segment.take() {
            slot.stale_segments.push(old.segment_id());
        }
        delete_stale_segments(ledger, slot).await;
        Ok(())
    }

    async fn write_to_segment(
        &self,
        ledger: &ManagedLedger,
        slot: &mut PersistSlot,
        snapshot: &CursorSnapshot,
    ) -> Result<()> {
        if let Some(handle) = slot.segment.clone() {
            let payload = encode_snapshot(snapshot)?;
            match with_timeout(
                "append cursor snapshot",
                ledger.config().add_entry_timeout(),
                handle.append(payload),
            )
            .await
            {
                Ok(_) => return Ok(()),
                Err(e) => warn!(
                    "[{}] Cursor {} failed to append to metadata segment {}: {e}; switching",
                    self.ledger_name,
                    self.name,
                    handle.segment_id()
                ),
            }
        }
        self.switch_segment(ledger, slot, snapshot).await
    }

    /// Start a new metadata segment holding `snapshot` and point the record
    /// at it.
    async fn switch_segment(
        &self,
        ledger: &ManagedLedger,
        slot: &mut PersistSlot,
        snapshot: &CursorSnapshot,
    ) -> Result<()> {
        let config = ledger.config();
        let handle = with_timeout(
            "create metadata segment",
            Some(config.metadata_operations_timeout()),
            ledger.segment_store().create(&config.ensemble),
        )
        .await?;
        let segment_id = handle.segment_id();

        let payload = encode_snapshot(snapshot)?;
        if let Err(e) = with_timeout(
            "append cursor snapshot",
            config.add_entry_timeout(),
            handle.append(payload),
        )
        .await
        {
            delete_segment(ledger, segment_id).await;
            return Err(e);
        }

        let pointer = CursorInfo {
            snapshot: CursorSnapshot {
                mark_delete: snapshot.mark_delete,
                individually_deleted: Vec::new(),
                properties: snapshot.properties.clone(),
            },
            metadata_segment: Some(segment_id),
        };
        match ledger
            .meta()
            .put_cursor_info(&self.ledger_name, &self.name, &pointer, slot.version)
            .await
        {
            Ok(version) => {
                slot.version = Some(version);
                if let Some(old) = slot.segment.replace(handle) {
                    slot.stale_segments.push(old.segment_id());
                }
                delete_stale_segments(ledger, slot).await;
                info!(
                    "[{}] Cursor {} now persists to metadata segment {segment_id}",
                    self.ledger_name, self.name
                );
                Ok(())
            }
            Err(e) => {
                delete_segment(ledger, segment_id).await;
                Err(e)
            }
        }
    }

    /// Re-read the record version after a conflicting write.
    async fn recover_version(&self, ledger: &ManagedLedger, slot: &mut PersistSlot) -> Result<()> {
        let stored = ledger
            .meta()
            .get_cursor_info(&self.ledger_name, &self.name)
            .await?;
        slot.version = stored.map(|(_, version)| version);
        if let Some(old) = slot.segment.take() {
            slot.stale_segments.push(old.segment_id());
        }
        Ok(())
    }

    /// Remove the metadata record and any metadata segment of this cursor.
    pub(crate) async fn remove_persisted(&self) -> Result<()> {
        if !self.durable {
            return Ok(());
        }
        let ledger = self.ledger()?;
        let mut slot = self.persist.lock().await;
        if let Some(old) = slot.segment.take() {
            slot.stale_segments.push(old.segment_id());
        }
        let meta = ledger.meta();
        if let Some((info, _)) = meta.get_cursor_info(&self.ledger_name, &self.name).await? {
            slot.stale_segments.extend(info.metadata_segment);
        }
        meta.remove_cursor_info(&self.ledger_name, &self.name).await?;
        delete_stale_segments(&ledger, &mut slot).await;
        slot.version = None;
        slot.last = None;
        Ok(())
    }
}

/// Seal a metadata segment and decode its last snapshot.
async fn read_last_snapshot(
    ledger: &ManagedLedger,
    segment_id: SegmentId,
) -> Result<Option<CursorSnapshot>> {
    let limit = ledger.config().metadata_operations_timeout();
    let handle = match segment_call(
        "open metadata segment",
        limit,
        ledger.segment_store().open(segment_id),
    )
    .await?
    {
        Ok(handle) => handle,
        Err(SegmentError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    ledger.seal_with_timeout(&handle).await?;
    let last = handle.last_add_confirmed();
    if last < 0 {
        return Ok(None);
    }
    let data = with_timeout("read cursor snapshot", Some(limit), handle.read(last, last)).await?;
    data.first().map(|d| decode_snapshot(d)).transpose()
}

async fn delete_stale_segments(ledger: &ManagedLedger, slot: &mut PersistSlot) {
    let mut ids = std::mem::take(&mut slot.stale_segments);
    ids.sort_unstable();
    ids.dedup();
    for id in ids {
        delete_segment(ledger, id).await;
    }
}

async fn delete_segment(ledger: &ManagedLedger, segment_id: SegmentId) {
    let limit = ledger.config().metadata_operations_timeout();
    match segment_call(
        "delete metadata segment",
        limit,
        ledger.segment_store().delete(segment_id),
    )
    .await
    {
        Ok(Ok(())) => {
            debug!("[{}] Deleted metadata segment {segment_id}", ledger.name());
        }
        Ok(Err(e)) => warn!(
            "[{}] Failed to delete metadata segment {segment_id}: {e}",
            ledger.name()
        ),
        Err(e) => warn!(
            "[{}] Failed to delete metadata segment {segment_id}: {e}",
            ledger.name()
        ),
    }
}
