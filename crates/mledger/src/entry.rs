//! Entries returned by reads

use bytes::Bytes;
use mledger_common::Position;

/// One entry read from a managed ledger.
///
/// The payload is reference counted and may be shared with the entry
/// cache. Dropping the entry (or calling [`Entry::release`]) gives up this
/// reader's reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    position: Position,
    data: Bytes,
}

impl Entry {
    #[must_use]
    pub const fn new(position: Position, data: Bytes) -> Self {
        Self { position, data }
    }

    #[must_use]
    pub const fn position(&self) -> Position {
        self.position
    }

    #[must_use]
    pub const fn segment_id(&self) -> u64 {
        self.position.segment_id
    }

    #[must_use]
    pub const fn entry_id(&self) -> i64 {
        self.position.entry_id
    }

    #[must_use]
    pub const fn data(&self) -> &Bytes {
        &self.data
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
    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Give up this reader's reference to the payload.
    pub fn release(self) {}
}
