//! Managed ledger
//!
//! A durable, append-only, multi-consumer log built from bounded segments
//! of a segment store, with its layout and consumer positions kept in a
//! versioned metadata store.
//!
//! # Features
//!
//! - **Ordered appends**: positions are assigned in submission order and
//!   confirmed in that order, across segment rollovers
//! - **Durable cursors**: mark-delete positions plus individually deleted
//!   ranges survive restarts
//! - **Retention and trimming**: consumed segments are dropped by age and size
//! - **Fencing**: a second owner of the same ledger fences the first
//! - **Shared entry cache**: recently written entries are served to active
//!   cursors from memory under one process-wide budget
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │ ManagedLedgerFactory │  registry, cache manager, session watcher
//! └──────────┬───────────┘
//!            │
//! ┌──────────▼───────────┐     ┌────────────────┐
//! │    ManagedLedger     │────▶│ ManagedCursor  │ (one per consumer)
//! │  - PendingWriteQueue │     └────────────────┘
//! │  - EntryCache        │
//! └─────┬──────────┬─────┘
//!       │          │
//! ┌─────▼─────┐ ┌──▼────────────┐
//! │ Segment   │ │ Metadata      │
//! │ store     │ │ store         │
//! └───────────┘ └───────────────┘
//! ```

pub mod blocking;
pub mod cache;
pub mod cursor;
pub mod entry;
pub mod factory;
pub mod ledger;
pub mod meta;
pub mod offload;
pub mod stats;

pub use blocking::{BlockingCursor, BlockingFactory, BlockingLedger};
pub use cache::{CacheStats, EntryCache, EntryCacheManager};
pub use cursor::{
    IndividualDeleted, ManagedCursor, ManagedCursorContainer, PositionRangeSet, SlowestChange,
};
pub use entry::Entry;
pub use factory::ManagedLedgerFactory;
pub use ledger::{ManagedLedger, OpAddEntry, OpReadEntry, PendingWriteQueue, State};
pub use meta::MetaStore;
pub use offload::{MemoryOffloader, Offloader};
pub use stats::LedgerStats;

pub use mledger_common::{
    Error, ErrorKind, FactoryConfig, InitialPosition, ManagedLedgerConfig, Position,
    PositionBound, Result,
};
