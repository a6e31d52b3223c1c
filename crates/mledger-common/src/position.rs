//! Entry positions
//!
//! A position identifies one entry: the segment it lives in and its index
//! inside that segment. Positions order lexicographically, so segment ids
//! must be assigned in increasing order.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Location of an entry inside a managed ledger.
///
/// `entry_id == -1` denotes the slot just before the first entry of a
/// segment; it is used for mark-delete and last-confirmed positions of
/// empty segments.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[display("{segment_id}:{entry_id}")]
pub struct Position {
    pub segment_id: u64,
    pub entry_id: i64,
}

impl Position {
    /// Sorts before every real position.
    pub const EARLIEST: Self = Self {
        segment_id: 0,
        entry_id: -1,
    };

    /// Sorts after every real position.
    pub const LATEST: Self = Self {
        segment_id: u64::MAX,
        entry_id: i64::MAX,
    };

    #[must_use]
    pub const fn new(segment_id: u64, entry_id: i64) -> Self {
        Self {
            segment_id,
            entry_id,
        }
    }

    /// The next slot in the same segment. Does not consult segment bounds.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self::new(self.segment_id, self.entry_id + 1)
    }

    /// True for the "before first entry" slot of a segment.
    #[must_use]
    pub const fn is_segment_start(&self) -> bool {
        self.entry_id < 0
    }
}

/// Whether the start position of a walk counts as the first entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PositionBound {
    StartIncluded,
    StartExcluded,
}
