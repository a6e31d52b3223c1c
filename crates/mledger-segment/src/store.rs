//! Segment store contract

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use mledger_common::{EnsembleConfig, Error, SegmentId};
use std::sync::Arc;

/// Error type for segment store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum SegmentError {
    #[error("segment {0} not found")]
    NotFound(SegmentId),

    /// The segment was sealed, possibly by another writer.
    #[error("segment {0} is sealed")]
    Sealed(SegmentId),

    #[error("entries {first}..={last} out of range for segment {segment_id}")]
    OutOfRange {
        segment_id: SegmentId,
        first: i64,
        last: i64,
    },

    #[error("segment store unavailable: {0}")]
    Unavailable(String),

    #[error("segment store I/O error: {0}")]
    Io(String),
}

pub type SegmentResult<T> = Result<T, SegmentError>;

impl From<SegmentError> for Error {
    fn from(e: SegmentError) -> Self {
        match e {
            SegmentError::Unavailable(msg) => Self::StoreUnavailable(msg),
            other => Self::Segment(other.to_string()),
        }
    }
}

/// Factory for segments.
#[async_trait]
pub trait SegmentStore: Send + Sync + 'static {
    /// Create a new writable segment. Ids increase across calls.
    async fn create(&self, ensemble: &EnsembleConfig) -> SegmentResult<Arc<dyn SegmentHandle>>;

    /// Open an existing segment for reading or recovery.
    async fn open(&self, segment_id: SegmentId) -> SegmentResult<Arc<dyn SegmentHandle>>;

    /// Delete a segment. Deleting a segment that does not exist succeeds.
    async fn delete(&self, segment_id: SegmentId) -> SegmentResult<()>;
}

/// Access to one segment.
#[async_trait]
pub trait SegmentHandle: Send + Sync {
    fn segment_id(&self) -> SegmentId;

    /// Submit an append and return a future for its acknowledgement.
    ///
    /// The entry index is assigned when this method is called, so appends
    /// submitted in sequence land in that sequence even though their
    /// acknowledgements may complete in any order.
    fn append(&self, data: Bytes) -> BoxFuture<'static, SegmentResult<i64>>;

    /// Read the inclusive range `first..=last`.
    async fn read(&self, first: i64, last: i64) -> SegmentResult<Vec<Bytes>>;

    /// Seal the segment. Idempotent; later appends fail with `Sealed`.
    async fn seal(&self) -> SegmentResult<()>;

    /// Index of the last durable entry, -1 when empty.
    fn last_add_confirmed(&self) -> i64;

    /// Total bytes of durable entries.
    fn length(&self) -> u64;

    fn is_sealed(&self) -> bool;
}
