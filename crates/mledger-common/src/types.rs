//! Persisted metadata records
//!
//! These are the values stored in the metadata store for each ledger and
//! cursor. They are encoded with bincode by the engine.

use crate::position::Position;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Segment identifier assigned by the segment store. Monotonically increasing.
pub type SegmentId = u64;

/// Where a new cursor starts when no persisted state exists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitialPosition {
    /// Start after the last confirmed entry; no backlog.
    #[default]
    Latest,
    /// Start before the first retained entry.
    Earliest,
}

/// Result of moving a sealed segment to cold storage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffloadInfo {
    /// Driver-specific location of the offloaded copy
    pub location: String,
    /// Wall-clock time of completion (ms since epoch)
    pub completed_at_ms: u64,
}

/// Metadata for one segment of a managed ledger.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub segment_id: SegmentId,
    /// Number of confirmed entries
    pub entry_count: u64,
    /// Sum of confirmed payload sizes (bytes)
    pub size_bytes: u64,
    /// When the segment was sealed (ms since epoch). 0 while open.
    pub close_timestamp_ms: u64,
    /// Set once the segment has been copied to cold storage
    pub offload: Option<OffloadInfo>,
    /// User properties attached to this segment
    pub properties: BTreeMap<String, String>,
}

impl SegmentInfo {
    #[must_use]
    pub fn new(segment_id: SegmentId) -> Self {
        Self {
            segment_id,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.close_timestamp_ms != 0
    }

    /// Position of the last entry, or `(id, -1)` when empty.
    #[must_use]
    pub fn last_position(&self) -> Position {
        #[allow(clippy::cast_possible_wrap)]
        Position::new(self.segment_id, self.entry_count as i64 - 1)
    }
}

/// The persisted state of a managed ledger.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerInfo {
    /// Segments in ascending id order; the last one is the writable segment
    /// while the ledger is open.
    pub segments: Vec<SegmentInfo>,
    pub properties: BTreeMap<String, String>,
}

/// An inclusive run of individually deleted positions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRange {
    pub first: Position,
    pub last: Position,
}

impl PositionRange {
    #[must_use]
    pub const fn new(first: Position, last: Position) -> Self {
        Self { first, last }
    }

    #[must_use]
    pub fn contains(&self, position: Position) -> bool {
        self.first <= position && position <= self.last
    }
}

/// The acknowledgement state of a cursor at one point in time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorSnapshot {
    pub mark_delete: Position,
    pub individually_deleted: Vec<PositionRange>,
    pub properties: BTreeMap<String, String>,
}

/// The persisted record of a durable cursor.
///
/// Small states are stored inline. Large ones live in the cursor's own
/// metadata segment and `snapshot` keeps only the mark-delete position.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorInfo {
    pub snapshot: CursorSnapshot,
    pub metadata_segment: Option<SegmentId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_info_last_position() {
        let mut info = SegmentInfo::new(4);
        assert_eq!(info.last_position(), Position::new(4, -1));
        assert!(!info.is_sealed());

        info.entry_count = 10;
        info.close_timestamp_ms = 1;
        assert_eq!(info.last_position(), Position::new(4, 9));
        assert!(info.is_sealed());
    }

    #[test]
    fn test_range_contains() {
        let range = PositionRange::new(Position::new(1, 3), Position::new(2, 1));
        assert!(range.contains(Position::new(1, 3)));
        assert!(range.contains(Position::new(1, 100)));
        assert!(range.contains(Position::new(2, 1)));
        assert!(!range.contains(Position::new(2, 2)));
        assert!(!range.contains(Position::new(1, 2)));
    }

    #[test]
    fn test_cursor_info_encoding() {
        let mut snapshot = CursorSnapshot {
            mark_delete: Position::new(3, 7),
            ..CursorSnapshot::default()
        };
        snapshot
            .individually_deleted
            .push(PositionRange::new(Position::new(3, 9), Position::new(3, 12)));
        snapshot.properties.insert("owner".into(), "a".into());
        let info = CursorInfo {
            snapshot,
            metadata_segment: Some(11),
        };

        let bytes = bincode::serialize(&info).unwrap();
        let decoded: CursorInfo = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, info);
    }
}
