//! In-memory metadata store
//!
//! A process-local implementation of [`MetadataStore`] with hooks to inject
//! outages, failed writes and session events.

use crate::store::{
    MetaStoreError, MetaStoreResult, MetadataStore, SessionEvent, Version, Versioned, child_name,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Default)]
struct Faults {
    unavailable: bool,
    /// (path prefix, remaining failures)
    failing_puts: Vec<(String, u32)>,
}

struct Inner {
    nodes: Mutex<BTreeMap<String, (Vec<u8>, Version)>>,
    faults: Mutex<Faults>,
    session: watch::Sender<SessionEvent>,
}

/// Metadata store held in process memory.
#[derive(Clone)]
pub struct MemoryMetadataStore {
    inner: Arc<Inner>,
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMetadataStore {
    #[must_use]
    pub fn new() -> Self {
        let (session, _) = watch::channel(SessionEvent::SessionReestablished);
        Self {
            inner: Arc::new(Inner {
                nodes: Mutex::new(BTreeMap::new()),
                faults: Mutex::new(Faults::default()),
                session,
            }),
        }
    }

    /// Make every operation fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.faults.lock().unavailable = unavailable;
    }

    /// Fail the next `count` writes to paths starting with `prefix`.
    pub fn fail_next_puts(&self, prefix: impl Into<String>, count: u32) {
        self.inner
            .faults
            .lock()
            .failing_puts
            .push((prefix.into(), count));
    }

    /// Publish a session transition to every watcher.
    pub fn trigger_session_event(&self, event: SessionEvent) {
        self.inner.session.send_replace(event);
    }

    /// Current version of a node.
    #[must_use]
    pub fn version(&self, path: &str) -> Option<Version> {
        self.inner.nodes.lock().get(path).map(|(_, v)| *v)
    }

    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        self.inner.nodes.lock().keys().cloned().collect()
    }

    fn check_available(&self) -> MetaStoreResult<()> {
        if self.inner.faults.lock().unavailable {
            return Err(MetaStoreError::Unavailable("injected outage".into()));
        }
        Ok(())
    }

    fn take_put_failure(&self, path: &str) -> bool {
        let mut faults = self.inner.faults.lock();
        let hit = faults
            .failing_puts
            .iter_mut()
            .find(|(prefix, remaining)| *remaining > 0 && path.starts_with(prefix.as_str()));
        match hit {
            Some((_, remaining)) => {
                *remaining -= 1;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, path: &str) -> MetaStoreResult<Option<Versioned<Vec<u8>>>> {
        self.check_available()?;
        Ok(self.inner.nodes.lock().get(path).map(|(value, version)| Versioned {
            value: value.clone(),
            version: *version,
        }))
    }

    async fn put(
        &self,
        path: &str,
        value: Vec<u8>,
        expected: Option<Version>,
    ) -> MetaStoreResult<Version> {
        self.check_available()?;
        if self.take_put_failure(path) {
            return Err(MetaStoreError::Unavailable(format!(
                "injected write failure on {path}"
            )));
        }
        let mut nodes = self.inner.nodes.lock();
        let actual = nodes.get(path).map(|(_, v)| *v);
        if actual != expected {
            return Err(MetaStoreError::BadVersion {
                path: path.to_string(),
                expected,
                actual,
            });
        }
        let version = actual.map_or(0, |v| v + 1);
        nodes.insert(path.to_string(), (value, version));
        Ok(version)
    }

    async fn delete(&self, path: &str, expected: Option<Version>) -> MetaStoreResult<()> {
        self.check_available()?;
        let mut nodes = self.inner.nodes.lock();
        let Some((_, actual)) = nodes.get(path) else {
            return Err(MetaStoreError::NotFound(path.to_string()));
        };
        if let Some(expected) = expected {
            if *actual != expected {
                return Err(MetaStoreError::BadVersion {
                    path: path.to_string(),
                    expected: Some(expected),
                    actual: Some(*actual),
                });
            }
        }
        nodes.remove(path);
        Ok(())
    }

    async fn children(&self, path: &str) -> MetaStoreResult<Vec<String>> {
        self.check_available()?;
        let nodes = self.inner.nodes.lock();
        Ok(nodes
            .range(path.to_string()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(path))
            .filter_map(|key| child_name(path, key).map(str::to_string))
            .collect())
    }

    fn session(&self) -> watch::Receiver<SessionEvent> {
        self.inner.session.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_versioned_put() {
        let store = MemoryMetadataStore::new();
        let v0 = store.put("/l", b"a".to_vec(), None).await.unwrap();
        assert_eq!(v0, 0);

        // Create over an existing node conflicts.
        let err = store.put("/l", b"b".to_vec(), None).await.unwrap_err();
        assert!(matches!(err, MetaStoreError::BadVersion { .. }));

        let v1 = store.put("/l", b"b".to_vec(), Some(v0)).await.unwrap();
        assert_eq!(v1, 1);

        let err = store.put("/l", b"c".to_vec(), Some(v0)).await.unwrap_err();
        assert!(matches!(
            err,
            MetaStoreError::BadVersion {
                actual: Some(1),
                ..
            }
        ));

        let node = store.get("/l").await.unwrap().unwrap();
        assert_eq!(node.value, b"b".to_vec());
        assert_eq!(node.version, 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryMetadataStore::new();
        store.put("/l", vec![], None).await.unwrap();
        assert!(store.delete("/l", Some(5)).await.is_err());
        store.delete("/l", Some(0)).await.unwrap();
        assert!(matches!(
            store.delete("/l", None).await,
            Err(MetaStoreError::NotFound(_))
        ));
        assert!(!store.exists("/l").await.unwrap());
    }

    #[tokio::test]
    async fn test_children() {
        let store = MemoryMetadataStore::new();
        store.put("/ml/a", vec![], None).await.unwrap();
        store.put("/ml/a/c1", vec![], None).await.unwrap();
        store.put("/ml/a/c2", vec![], None).await.unwrap();
        store.put("/ml/a/c2/x", vec![], None).await.unwrap();
        store.put("/ml/ab/c3", vec![], None).await.unwrap();

        assert_eq!(store.children("/ml/a").await.unwrap(), vec!["c1", "c2"]);
        assert!(store.children("/ml/none").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_faults_and_session() {
        let store = MemoryMetadataStore::new();
        store.fail_next_puts("/ml/", 1);
        assert!(matches!(
            store.put("/ml/x", vec![], None).await,
            Err(MetaStoreError::Unavailable(_))
        ));
        store.put("/ml/x", vec![], None).await.unwrap();

        let session = store.session();
        assert!(session.borrow().is_available());
        store.trigger_session_event(SessionEvent::SessionLost);
        assert!(!session.borrow().is_available());

        store.set_unavailable(true);
        assert!(store.get("/ml/x").await.is_err());
    }
}
