//! Individually deleted position ranges
//!
//! Acknowledgements beyond a cursor's mark-delete position are kept as
//! disjoint inclusive ranges. Adjacency is decided by the ledger's
//! `next_valid_position`, so a range may span a segment boundary.

use mledger_common::{Position, PositionRange};
use std::collections::BTreeMap;

/// Disjoint inclusive ranges keyed by their first position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionRangeSet {
    ranges: BTreeMap<Position, Position>,
}

impl PositionRangeSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_ranges(ranges: &[PositionRange]) -> Self {
        Self {
            ranges: ranges.iter().map(|r| (r.first, r.last)).collect(),
        }
    }

    /// Number of ranges
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    #[must_use]
    pub fn contains(&self, position: Position) -> bool {
        self.ranges
            .range(..=position)
            .next_back()
            .is_some_and(|(_, last)| *last >= position)
    }

    #[must_use]
    pub fn first_range(&self) -> Option<PositionRange> {
        self.ranges
            .iter()
            .next()
            .map(|(first, last)| PositionRange::new(*first, *last))
    }

    pub fn iter(&self) -> impl Iterator<Item = PositionRange> + '_ {
        self.ranges
            .iter()
            .map(|(first, last)| PositionRange::new(*first, *last))
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<PositionRange> {
        self.iter().collect()
    }

    /// Add one position, merging with adjacent ranges.
    /// Returns false when it was already present.
    pub fn add(&mut self, position: Position, next_valid: impl Fn(Position) -> Position) -> bool {
        if self.contains(position) {
            return false;
        }
        let mut first = position;
        let mut last = position;

        if let Some((&prev_first, &prev_last)) = self.ranges.range(..position).next_back() {
            if next_valid(prev_last) == position {
                self.ranges.remove(&prev_first);
                first = prev_first;
            }
        }
        let following = next_valid(position);
        if let Some(next_last) = self.ranges.remove(&following) {
            last = next_last;
        }
        self.ranges.insert(first, last);
        true
    }

    /// Drop every position at or before `position`. A range straddling it
    /// is cut to start at `next_valid(position)`.
    pub fn remove_up_to(&mut self, position: Position, next_valid: impl Fn(Position) -> Position) {
        let kept = self.ranges.split_off(&position.next());
        let straddling = self
            .ranges
            .iter()
            .next_back()
            .filter(|(_, last)| **last > position)
            .map(|(_, last)| *last);
        self.ranges = kept;
        if let Some(last) = straddling {
            self.ranges.insert(next_valid(position), last);
        }
    }

    /// Remove and return the first range if it starts at `position`.
    pub fn take_if_starts_at(&mut self, position: Position) -> Option<PositionRange> {
        let (&first, _) = self.ranges.iter().next()?;
        if first != position {
            return None;
        }
        self.ranges
            .remove(&first)
            .map(|last| PositionRange::new(first, last))
    }
}
