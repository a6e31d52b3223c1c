//! Metadata store contract

use async_trait::async_trait;
use mledger_common::Error;
use tokio::sync::watch;

/// Monotonic per-node version. A node is created at version 0.
pub type Version = u64;

/// A value together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

/// State of the store's coordination session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    SessionReestablished,
    SessionLost,
}

impl SessionEvent {
    #[must_use]
    pub const fn is_available(self) -> bool {
        matches!(self, Self::SessionReestablished)
    }
}

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("node not found: {0}")]
    NotFound(String),
    #[error("bad version on {path}: expected {expected:?}, found {actual:?}")]
    BadVersion {
        path: String,
        expected: Option<Version>,
        actual: Option<Version>,
    },
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("background task failed: {0}")]
    Task(String),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for Error {
    fn from(e: MetaStoreError) -> Self {
        match e {
            MetaStoreError::BadVersion { path, .. } => Self::VersionConflict { path },
            MetaStoreError::Unavailable(msg) => Self::StoreUnavailable(msg),
            other => Self::Metadata(other.to_string()),
        }
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// Hierarchical, versioned key/value store.
///
/// Paths are `/`-separated. Writes are conditional: `expected == None`
/// requires the node to be absent, `Some(v)` requires its version to be `v`.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    async fn get(&self, path: &str) -> MetaStoreResult<Option<Versioned<Vec<u8>>>>;

    /// Conditionally write a node and return its new version.
    async fn put(&self, path: &str, value: Vec<u8>, expected: Option<Version>)
    -> MetaStoreResult<Version>;

    /// Delete a node. `expected == None` deletes unconditionally.
    async fn delete(&self, path: &str, expected: Option<Version>) -> MetaStoreResult<()>;

    async fn exists(&self, path: &str) -> MetaStoreResult<bool> {
        Ok(self.get(path).await?.is_some())
    }

    /// Names of the direct children of `path`, sorted.
    async fn children(&self, path: &str) -> MetaStoreResult<Vec<String>>;

    /// Session state; the receiver observes every transition.
    fn session(&self) -> watch::Receiver<SessionEvent>;
}

/// Direct child name of `parent` for `key`, if `key` is one.
pub(crate) fn child_name<'a>(parent: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(parent)?.strip_prefix('/')?;
    if rest.is_empty() || rest.contains('/') {
        None
    } else {
        Some(rest)
    }
}
