//! Versioned metadata store
//!
//! A small key/value store with optimistic concurrency: every value carries
//! a version and conditional writes fail when the caller's expected version
//! is stale. Session events tell the engine when the store's coordination
//! session is lost or re-established.

pub mod memory;
pub mod redb_store;
pub mod store;
pub mod tables;

pub use memory::MemoryMetadataStore;
pub use redb_store::RedbMetadataStore;
pub use store::{MetaStoreError, MetaStoreResult, MetadataStore, SessionEvent, Version, Versioned};
