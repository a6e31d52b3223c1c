//! Error types for the managed ledger
//!
//! One error enum is shared by every public operation. It is `Clone` so a
//! single failure (fencing, a failed rollover) can complete every queued
//! operation it affects.

use crate::position::Position;
use thiserror::Error;

/// Common result type for managed ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for managed ledger operations
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("managed ledger {ledger} is fenced by another owner")]
    Fenced { ledger: String },

    #[error("managed ledger {ledger} is closed")]
    Closed { ledger: String },

    #[error("managed ledger not found: {0}")]
    LedgerNotFound(String),

    #[error("cursor not found: {ledger}/{cursor}")]
    CursorNotFound { ledger: String, cursor: String },

    #[error("segment {segment_id} of {ledger} no longer exists")]
    SegmentNotExist { ledger: String, segment_id: u64 },

    #[error("position {position} not found in {ledger}")]
    PositionNotFound { ledger: String, position: Position },

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("metadata version conflict on {path}")]
    VersionConflict { path: String },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("segment store error: {0}")]
    Segment(String),

    #[error("metadata store error: {0}")]
    Metadata(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification of [`Error`] for callers that branch on failure type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Fenced,
    Closed,
    NotFound,
    Timeout,
    VersionConflict,
    StoreUnavailable,
    InvalidArgument,
    Other,
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a timeout error naming the operation
    pub fn timeout(op: impl Into<String>) -> Self {
        Self::Timeout(op.into())
    }

    pub fn fenced(ledger: impl Into<String>) -> Self {
        Self::Fenced {
            ledger: ledger.into(),
        }
    }

    pub fn closed(ledger: impl Into<String>) -> Self {
        Self::Closed {
            ledger: ledger.into(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Fenced { .. } => ErrorKind::Fenced,
            Self::Closed { .. } => ErrorKind::Closed,
            Self::LedgerNotFound(_)
            | Self::CursorNotFound { .. }
            | Self::SegmentNotExist { .. }
            | Self::PositionNotFound { .. } => ErrorKind::NotFound,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::VersionConflict { .. } => ErrorKind::VersionConflict,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Segment(_) | Self::Metadata(_) | Self::Serialization(_) | Self::Internal(_) => {
                ErrorKind::Other
            }
        }
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::StoreUnavailable | ErrorKind::VersionConflict
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound)
    }

    #[must_use]
    pub const fn is_fenced(&self) -> bool {
        matches!(self, Self::Fenced { .. })
    }

    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    #[must_use]
    pub const fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}
