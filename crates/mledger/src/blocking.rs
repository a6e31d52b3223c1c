//! Synchronous wrappers
//!
//! Each call parks the calling thread until the async operation finishes
//! on the given runtime. They must not be called from a runtime worker
//! thread.

use crate::cursor::{IndividualDeleted, ManagedCursor};
use crate::entry::Entry;
use crate::factory::ManagedLedgerFactory;
use crate::ledger::ManagedLedger;
use bytes::Bytes;
use mledger_common::{InitialPosition, ManagedLedgerConfig, Position, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Blocking front end of a [`ManagedLedgerFactory`].
#[derive(Debug, Clone)]
pub struct BlockingFactory {
    handle: Handle,
    inner: Arc<ManagedLedgerFactory>,
}

impl BlockingFactory {
    #[must_use]
    pub const fn new(handle: Handle, inner: Arc<ManagedLedgerFactory>) -> Self {
        Self { handle, inner }
    }

    #[must_use]
    pub const fn inner(&self) -> &Arc<ManagedLedgerFactory> {
        &self.inner
    }

    pub fn open(&self, name: &str) -> Result<BlockingLedger> {
        let ledger = self.handle.block_on(self.inner.open(name))?;
        Ok(BlockingLedger::new(self.handle.clone(), ledger))
    }

    pub fn open_with_config(&self, name: &str, config: ManagedLedgerConfig) -> Result<BlockingLedger> {
        let ledger = self
            .handle
            .block_on(self.inner.open_with_config(name, config))?;
        Ok(BlockingLedger::new(self.handle.clone(), ledger))
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        self.handle.block_on(self.inner.delete(name))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.handle.block_on(self.inner.shutdown())
    }
}

/// Blocking front end of a [`ManagedLedger`].
#[derive(Debug, Clone)]
pub struct BlockingLedger {
    handle: Handle,
    inner: Arc<ManagedLedger>,
}

impl BlockingLedger {
    #[must_use]
    pub const fn new(handle: Handle, inner: Arc<ManagedLedger>) -> Self {
        Self { handle, inner }
    }

    #[must_use]
    pub const fn inner(&self) -> &Arc<ManagedLedger> {
        &self.inner
    }

    pub fn add_entry(&self, data: impl Into<Bytes>) -> Result<Position> {
        self.handle.block_on(self.inner.add_entry(data))
    }

    pub fn read_entry(&self, position: Position) -> Result<Entry> {
        self.handle.block_on(self.inner.read_entry(position))
    }

    pub fn open_cursor(&self, name: &str) -> Result<BlockingCursor> {
        let cursor = self.handle.block_on(self.inner.open_cursor(name))?;
        Ok(BlockingCursor::new(self.handle.clone(), cursor))
    }

    pub fn open_cursor_with(
        &self,
        name: &str,
        initial: InitialPosition,
        properties: BTreeMap<String, String>,
    ) -> Result<BlockingCursor> {
        let cursor = self
            .handle
            .block_on(self.inner.open_cursor_with(name, initial, properties))?;
        Ok(BlockingCursor::new(self.handle.clone(), cursor))
    }

    pub fn delete_cursor(&self, name: &str) -> Result<()> {
        self.handle.block_on(self.inner.delete_cursor(name))
    }

    pub fn set_property(&self, key: &str, value: &str) -> Result<()> {
        self.handle.block_on(self.inner.set_property(key, value))
    }

    pub fn truncate(&self) -> Result<()> {
        self.handle.block_on(self.inner.truncate())
    }

    pub fn close(&self) -> Result<()> {
        self.handle.block_on(self.inner.close())
    }

    pub fn delete(&self) -> Result<()> {
        self.handle.block_on(self.inner.delete())
    }
}

/// Blocking front end of a [`ManagedCursor`].
#[derive(Debug, Clone)]
pub struct BlockingCursor {
    handle: Handle,
    inner: Arc<ManagedCursor>,
}

impl BlockingCursor {
    #[must_use]
    pub const fn new(handle: Handle, inner: Arc<ManagedCursor>) -> Self {
        Self { handle, inner }
    }

    #[must_use]
    pub const fn inner(&self) -> &Arc<ManagedCursor> {
        &self.inner
    }

    pub fn read_entries(&self, count: i64) -> Result<Vec<Entry>> {
        self.handle.block_on(self.inner.read_entries(count))
    }

    pub fn read_entries_or_wait(&self, count: i64) -> Result<Vec<Entry>> {
        self.handle.block_on(self.inner.read_entries_or_wait(count))
    }

    pub fn mark_delete(&self, position: Position) -> Result<()> {
        self.handle.block_on(self.inner.mark_delete(position))
    }

    pub fn delete(&self, position: Position) -> Result<()> {
        self.handle.block_on(self.inner.delete(position))
    }

    pub fn skip_entries(&self, n: i64, mode: IndividualDeleted) -> Result<()> {
        self.handle.block_on(self.inner.skip_entries(n, mode))
    }

    pub fn reset_cursor(&self, position: Position) -> Result<()> {
        self.handle.block_on(self.inner.reset_cursor(position))
    }

    pub fn clear_backlog(&self) -> Result<()> {
        self.handle.block_on(self.inner.clear_backlog())
    }

    pub fn close(&self) -> Result<()> {
        self.handle.block_on(self.inner.close())
    }
}
