//! Segment store
//!
//! A segment is a bounded, append-only sequence of entries. Segments are
//! created, appended to by a single writer, sealed, read and deleted. The
//! managed ledger stitches many segments into one unbounded log.

pub mod memory;
pub mod store;

pub use memory::MemorySegmentStore;
pub use store::{SegmentError, SegmentHandle, SegmentResult, SegmentStore};
