//! Persistent metadata store backed by redb.
//!
//! Every node is stored as a bincode-encoded [`StoredNode`] (version plus
//! payload) in a single table keyed by path. Conditional writes compare the
//! stored version inside the write transaction, so the check and the write
//! commit atomically. Blocking redb calls run on the blocking thread pool.

use crate::store::{
    MetaStoreError, MetaStoreResult, MetadataStore, SessionEvent, Version, Versioned, child_name,
};
use crate::tables;
use async_trait::async_trait;
use redb::{Database, ReadableTable};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
struct StoredNode {
    version: Version,
    data: Vec<u8>,
}

/// Metadata store persisted to a local redb file.
pub struct RedbMetadataStore {
    db: Arc<Database>,
    session: watch::Sender<SessionEvent>,
}

impl RedbMetadataStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::NODES)?;
        }
        write_txn.commit()?;
        info!("Opened metadata store at {:?}", path);

        let (session, _) = watch::channel(SessionEvent::SessionReestablished);
        Ok(Self {
            db: Arc::new(db),
            session,
        })
    }

    async fn blocking<T, F>(&self, f: F) -> MetaStoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> MetaStoreResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| MetaStoreError::Task(e.to_string()))?
    }
}

fn read_node(db: &Database, path: &str) -> MetaStoreResult<Option<StoredNode>> {
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(tables::NODES)?;
    let node = match table.get(path)? {
        Some(bytes) => Some(bincode::deserialize::<StoredNode>(bytes.value())?),
        None => None,
    };
    Ok(node)
}

fn conditional_put(
    db: &Database,
    path: &str,
    data: Vec<u8>,
    expected: Option<Version>,
) -> MetaStoreResult<Version> {
    let write_txn = db.begin_write()?;
    let version = {
        let mut table = write_txn.open_table(tables::NODES)?;
        // Read and compare, then drop the guard before mutating
        let actual = match table.get(path)? {
            Some(bytes) => Some(bincode::deserialize::<StoredNode>(bytes.value())?.version),
            None => None,
        };
        if actual != expected {
            return Err(MetaStoreError::BadVersion {
                path: path.to_string(),
                expected,
                actual,
            });
        }
        let version = actual.map_or(0, |v| v + 1);
        let bytes = bincode::serialize(&StoredNode { version, data })?;
        table.insert(path, bytes.as_slice())?;
        version
    };
    write_txn.commit()?;
    Ok(version)
}

fn conditional_delete(db: &Database, path: &str, expected: Option<Version>) -> MetaStoreResult<()> {
    let write_txn = db.begin_write()?;
    {
        let mut table = write_txn.open_table(tables::NODES)?;
        let actual = match table.get(path)? {
            Some(bytes) => bincode::deserialize::<StoredNode>(bytes.value())?.version,
            None => return Err(MetaStoreError::NotFound(path.to_string())),
        };
        if let Some(expected) = expected {
            if expected != actual {
                return Err(MetaStoreError::BadVersion {
                    path: path.to_string(),
                    expected: Some(expected),
                    actual: Some(actual),
                });
            }
        }
        table.remove(path)?;
    }
    write_txn.commit()?;
    Ok(())
}

fn list_children(db: &Database, parent: &str) -> MetaStoreResult<Vec<String>> {
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(tables::NODES)?;
    let mut result = Vec::new();
    for entry in table.range(parent..)? {
        let entry = entry?;
        let key = entry.0.value();
        if !key.starts_with(parent) {
            break;
        }
        if let Some(name) = child_name(parent, key) {
            result.push(name.to_string());
        }
    }
    Ok(result)
}

#[async_trait]
impl MetadataStore for RedbMetadataStore {
    async fn get(&self, path: &str) -> MetaStoreResult<Option<Versioned<Vec<u8>>>> {
        let path = path.to_string();
        let node = self.blocking(move |db| read_node(db, &path)).await?;
        Ok(node.map(|n| Versioned {
            value: n.data,
            version: n.version,
        }))
    }

    async fn put(
        &self,
        path: &str,
        value: Vec<u8>,
        expected: Option<Version>,
    ) -> MetaStoreResult<Version> {
        let path = path.to_string();
        self.blocking(move |db| conditional_put(db, &path, value, expected))
            .await
    }

    async fn delete(&self, path: &str, expected: Option<Version>) -> MetaStoreResult<()> {
        let path = path.to_string();
        self.blocking(move |db| conditional_delete(db, &path, expected))
            .await
    }

    async fn children(&self, path: &str) -> MetaStoreResult<Vec<String>> {
        let path = path.to_string();
        self.blocking(move |db| list_children(db, &path)).await
    }

    fn session(&self) -> watch::Receiver<SessionEvent> {
        self.session.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbMetadataStore::open(dir.path().join("meta.redb")).unwrap();

        assert!(store.get("/ml/a").await.unwrap().is_none());
        assert_eq!(store.put("/ml/a", b"one".to_vec(), None).await.unwrap(), 0);
        assert_eq!(
            store.put("/ml/a", b"two".to_vec(), Some(0)).await.unwrap(),
            1
        );
        assert!(matches!(
            store.put("/ml/a", b"three".to_vec(), Some(0)).await,
            Err(MetaStoreError::BadVersion { .. })
        ));

        let node = store.get("/ml/a").await.unwrap().unwrap();
        assert_eq!(node.value, b"two".to_vec());
        assert_eq!(node.version, 1);
    }

    #[tokio::test]
    async fn test_children_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbMetadataStore::open(dir.path().join("meta.redb")).unwrap();
        store.put("/ml/a", vec![], None).await.unwrap();
        store.put("/ml/a/c1", vec![1], None).await.unwrap();
        store.put("/ml/a/c2", vec![2], None).await.unwrap();
        store.put("/ml/b/c3", vec![3], None).await.unwrap();

        assert_eq!(store.children("/ml/a").await.unwrap(), vec!["c1", "c2"]);

        store.delete("/ml/a/c1", Some(0)).await.unwrap();
        assert!(matches!(
            store.delete("/ml/a/c1", None).await,
            Err(MetaStoreError::NotFound(_))
        ));
        assert_eq!(store.children("/ml/a").await.unwrap(), vec!["c2"]);
    }

    #[tokio::test]
    async fn test_reopen_keeps_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.redb");
        {
            let store = RedbMetadataStore::open(&path).unwrap();
            store.put("/ml/a", b"x".to_vec(), None).await.unwrap();
            store.put("/ml/a", b"y".to_vec(), Some(0)).await.unwrap();
        }
        let store = RedbMetadataStore::open(&path).unwrap();
        let node = store.get("/ml/a").await.unwrap().unwrap();
        assert_eq!(node.version, 1);
        assert_eq!(node.value, b"y".to_vec());
        assert!(store.session().borrow().is_available());
    }
}
