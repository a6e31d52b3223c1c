//! Cold storage for sealed segments
//!
//! An [`Offloader`] copies a sealed segment somewhere cheaper. The ledger
//! records the returned [`OffloadInfo`] in the segment's metadata and asks
//! the driver to delete the copy when the segment is trimmed.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use mledger_common::{Error, OffloadInfo, Result, SegmentId, SegmentInfo};
use mledger_segment::SegmentHandle;
use std::sync::Arc;

use crate::ledger::now_ms;

/// Cold storage driver.
#[async_trait]
pub trait Offloader: Send + Sync {
    /// Driver name, used in logs
    fn name(&self) -> &str;

    /// Copy every entry of the sealed segment `handle`.
    async fn offload(
        &self,
        ledger: &str,
        segment: &SegmentInfo,
        handle: Arc<dyn SegmentHandle>,
    ) -> Result<OffloadInfo>;

    /// Delete a copy made by [`offload`](Self::offload). Deleting a missing
    /// copy succeeds.
    async fn delete_offloaded(&self, ledger: &str, segment: &SegmentInfo) -> Result<()>;
}

/// Offloader keeping copies in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryOffloader {
    copies: Arc<DashMap<(String, SegmentId), Vec<Bytes>>>,
}

impl MemoryOffloader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries of an offloaded segment
    #[must_use]
    pub fn entries(&self, ledger: &str, segment_id: SegmentId) -> Option<Vec<Bytes>> {
        self.copies
            .get(&(ledger.to_string(), segment_id))
            .map(|c| c.value().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.copies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }
}

#[async_trait]
impl Offloader for MemoryOffloader {
    fn name(&self) -> &str {
        "memory"
    }

    async fn offload(
        &self,
        ledger: &str,
        segment: &SegmentInfo,
        handle: Arc<dyn SegmentHandle>,
    ) -> Result<OffloadInfo> {
        if !handle.is_sealed() {
            return Err(Error::invalid_argument(format!(
                "segment {} must be sealed before offload",
                segment.segment_id
            )));
        }
        let last = handle.last_add_confirmed();
        let entries = if last < 0 {
            Vec::new()
        } else {
            handle.read(0, last).await?
        };
        self.copies
            .insert((ledger.to_string(), segment.segment_id), entries);
        Ok(OffloadInfo {
            location: format!("memory://{ledger}/{}", segment.segment_id),
            completed_at_ms: now_ms(),
        })
    }

    async fn delete_offloaded(&self, ledger: &str, segment: &SegmentInfo) -> Result<()> {
        self.copies.remove(&(ledger.to_string(), segment.segment_id));
        Ok(())
    }
}
