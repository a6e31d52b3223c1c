//! Metadata adapter
//!
//! Maps ledger and cursor records onto paths of the versioned metadata
//! store and applies the per-operation deadline. Records are bincode.

use mledger_common::{CursorInfo, Error, LedgerInfo, Result};
use mledger_meta_store::{MetaStoreError, MetadataStore, SessionEvent, Version};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Root of all managed ledger nodes
pub const LEDGERS_ROOT: &str = "/managed-ledgers";

/// Escape a name so it forms exactly one path component.
fn encode_component(name: &str) -> String {
    name.replace('%', "%25").replace('/', "%2F")
}

fn decode_component(component: &str) -> String {
    component.replace("%2F", "/").replace("%25", "%")
}

#[must_use]
pub fn ledger_path(ledger: &str) -> String {
    format!("{LEDGERS_ROOT}/{}", encode_component(ledger))
}

#[must_use]
pub fn cursor_path(ledger: &str, cursor: &str) -> String {
    format!("{}/{}", ledger_path(ledger), encode_component(cursor))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned + Default>(bytes: &[u8]) -> Result<T> {
    // Nodes created without a body decode as an empty record.
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    bincode::deserialize(bytes).map_err(|e| Error::Serialization(e.to_string()))
}

/// Ledger and cursor persistence over a [`MetadataStore`].
#[derive(Clone)]
pub struct MetaStore {
    store: Arc<dyn MetadataStore>,
    op_timeout: Duration,
}

impl MetaStore {
    #[must_use]
    pub fn new(store: Arc<dyn MetadataStore>, op_timeout: Duration) -> Self {
        Self { store, op_timeout }
    }

    async fn timed<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, MetaStoreError>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::timeout(op)),
        }
    }

    async fn remove(&self, op: &str, path: &str) -> Result<()> {
        let delete = async {
            match self.store.delete(path, None).await {
                Err(MetaStoreError::NotFound(_)) => Ok(()),
                other => other,
            }
        };
        self.timed(op, delete).await
    }

    pub async fn get_ledger_info(&self, ledger: &str) -> Result<Option<(LedgerInfo, Version)>> {
        let path = ledger_path(ledger);
        let node = self.timed("get ledger info", self.store.get(&path)).await?;
        node.map(|n| Ok((decode(&n.value)?, n.version))).transpose()
    }

    /// Write the ledger record. `expected == None` creates it.
    pub async fn put_ledger_info(
        &self,
        ledger: &str,
        info: &LedgerInfo,
        expected: Option<Version>,
    ) -> Result<Version> {
        let path = ledger_path(ledger);
        let bytes = encode(info)?;
        self.timed("put ledger info", self.store.put(&path, bytes, expected))
            .await
    }

    /// Delete the ledger record. A missing record is not an error.
    pub async fn remove_ledger_info(&self, ledger: &str) -> Result<()> {
        self.remove("remove ledger info", &ledger_path(ledger)).await
    }

    pub async fn get_cursor_info(
        &self,
        ledger: &str,
        cursor: &str,
    ) -> Result<Option<(CursorInfo, Version)>> {
        let path = cursor_path(ledger, cursor);
        let node = self.timed("get cursor info", self.store.get(&path)).await?;
        node.map(|n| Ok((decode(&n.value)?, n.version))).transpose()
    }

    pub async fn put_cursor_info(
        &self,
        ledger: &str,
        cursor: &str,
        info: &CursorInfo,
        expected: Option<Version>,
    ) -> Result<Version> {
        let path = cursor_path(ledger, cursor);
        let bytes = encode(info)?;
        self.timed("put cursor info", self.store.put(&path, bytes, expected))
            .await
    }

    pub async fn remove_cursor_info(&self, ledger: &str, cursor: &str) -> Result<()> {
        self.remove("remove cursor info", &cursor_path(ledger, cursor))
            .await
    }

    /// Names of the durable cursors recorded for `ledger`.
    pub async fn cursor_names(&self, ledger: &str) -> Result<Vec<String>> {
        let path = ledger_path(ledger);
        let children = self.timed("list cursors", self.store.children(&path)).await?;
        Ok(children.iter().map(|c| decode_component(c)).collect())
    }

    /// Names of every ledger with a metadata record.
    pub async fn ledger_names(&self) -> Result<Vec<String>> {
        let children = self
            .timed("list ledgers", self.store.children(LEDGERS_ROOT))
            .await?;
        Ok(children.iter().map(|c| decode_component(c)).collect())
    }

    #[must_use]
    pub fn session(&self) -> watch::Receiver<SessionEvent> {
        self.store.session()
    }

    /// Whether the metadata session is currently established.
    #[must_use]
    pub fn session_available(&self) -> bool {
        self.store.session().borrow().is_available()
    }
}
