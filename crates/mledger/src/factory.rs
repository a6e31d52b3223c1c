//! Managed ledger factory
//!
//! The factory owns the process-wide pieces (the entry cache manager, the
//! metadata session watcher) and keeps one [`ManagedLedger`] per name.
//! Concurrent opens of the same name share a single initialization.

use crate::cache::EntryCacheManager;
use crate::ledger::{LedgerContext, ManagedLedger};
use crate::meta::MetaStore;
use crate::offload::Offloader;
use mledger_common::{Error, FactoryConfig, ManagedLedgerConfig, Result};
use mledger_meta_store::{MetadataStore, SessionEvent};
use mledger_segment::SegmentStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{OnceCell, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type LedgerCell = Arc<OnceCell<Arc<ManagedLedger>>>;
type Registry = Mutex<HashMap<String, LedgerCell>>;

/// Opens and tracks managed ledgers over one segment store and one
/// metadata store.
pub struct ManagedLedgerFactory {
    segment_store: Arc<dyn SegmentStore>,
    metadata_store: Arc<dyn MetadataStore>,
    meta: MetaStore,
    config: FactoryConfig,
    cache_manager: Arc<EntryCacheManager>,
    offloader: Option<Arc<dyn Offloader>>,
    ledgers: Arc<Registry>,
    session_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ManagedLedgerFactory {
    /// Create a factory. Must be called from within a tokio runtime.
    pub fn new(
        segment_store: Arc<dyn SegmentStore>,
        metadata_store: Arc<dyn MetadataStore>,
        config: FactoryConfig,
    ) -> Self {
        let meta = MetaStore::new(
            Arc::clone(&metadata_store),
            config.default_ledger.metadata_operations_timeout(),
        );
        let cache_manager =
            EntryCacheManager::new(config.cache_max_size_bytes(), config.cache_eviction_watermark);
        let ledgers: Arc<Registry> = Arc::new(Mutex::new(HashMap::new()));
        let session_task = tokio::spawn(watch_session(
            metadata_store.session(),
            Arc::downgrade(&ledgers),
        ));
        info!(
            "Managed ledger factory started: cache {} bytes, trim every {:?}",
            config.cache_max_size_bytes(),
            config.trim_interval()
        );
        Self {
            segment_store,
            metadata_store,
            meta,
            config,
            cache_manager,
            offloader: None,
            ledgers,
            session_task: Mutex::new(Some(session_task)),
            closed: AtomicBool::new(false),
        }
    }

    /// Offload sealed segments of ledgers opened from now on through `offloader`.
    #[must_use]
    pub fn with_offloader(mut self, offloader: Arc<dyn Offloader>) -> Self {
        self.offloader = Some(offloader);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &FactoryConfig {
        &self.config
    }

    /// Open a ledger with the factory's default ledger configuration.
    pub async fn open(&self, name: &str) -> Result<Arc<ManagedLedger>> {
        self.open_with_config(name, self.config.default_ledger.clone())
            .await
    }

    /// Open a ledger. If it is already open, the existing instance is
    /// returned and `config` is ignored.
    pub async fn open_with_config(
        &self,
        name: &str,
        config: ManagedLedgerConfig,
    ) -> Result<Arc<ManagedLedger>> {
        if name.is_empty() {
            return Err(Error::invalid_argument("ledger name must not be empty"));
        }
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::closed("managed ledger factory"));
            }
            let cell = Arc::clone(
                self.ledgers
                    .lock()
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            );
            let result = cell
                .get_or_try_init(|| self.create_ledger(name, config.clone(), Arc::clone(&cell)))
                .await
                .cloned();
            match result {
                Ok(ledger) if ledger.is_closed() => {
                    // Closed but its callback has not run yet.
                    self.remove_cell(name, &cell);
                }
                Ok(ledger) => return Ok(ledger),
                Err(e) => {
                    if !cell.initialized() {
                        self.remove_cell(name, &cell);
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn create_ledger(
        &self,
        name: &str,
        config: ManagedLedgerConfig,
        cell: LedgerCell,
    ) -> Result<Arc<ManagedLedger>> {
        let ctx = LedgerContext {
            segment_store: Arc::clone(&self.segment_store),
            metadata_store: Arc::clone(&self.metadata_store),
            cache_manager: Arc::clone(&self.cache_manager),
            offloader: self.offloader.clone(),
            trim_interval: self.config.trim_interval(),
            inactive_check_interval: self.config.inactive_check_interval(),
        };
        let ledger = ManagedLedger::open(name, config, ctx).await?;

        let registry = Arc::downgrade(&self.ledgers);
        let key = name.to_string();
        let cell = Arc::downgrade(&cell);
        ledger.set_on_close(move || {
            let (Some(registry), Some(cell)) = (registry.upgrade(), cell.upgrade()) else {
                return;
            };
            let mut ledgers = registry.lock();
            if ledgers.get(&key).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
                ledgers.remove(&key);
                debug!("[{key}] Removed from the factory registry");
            }
        });
        Ok(ledger)
    }

    fn remove_cell(&self, name: &str, cell: &LedgerCell) {
        let mut ledgers = self.ledgers.lock();
        if ledgers.get(name).is_some_and(|c| Arc::ptr_eq(c, cell)) {
            ledgers.remove(name);
        }
    }

    /// The open ledger named `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ManagedLedger>> {
        self.ledgers
            .lock()
            .get(name)
            .and_then(|c| c.get().cloned())
            .filter(|l| !l.is_closed())
    }

    /// Every ledger currently open in this factory.
    #[must_use]
    pub fn open_ledgers(&self) -> Vec<Arc<ManagedLedger>> {
        open_ledgers(&self.ledgers)
    }

    /// Delete a ledger with all of its segments and cursors.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let config = self
            .config
            .default_ledger
            .clone()
            .with_create_if_missing(false);
        let ledger = self.open_with_config(name, config).await?;
        ledger.delete().await
    }

    /// Names of every ledger recorded in the metadata store.
    pub async fn ledger_names(&self) -> Result<Vec<String>> {
        self.meta.ledger_names().await
    }

    #[must_use]
    pub const fn cache_manager(&self) -> &Arc<EntryCacheManager> {
        &self.cache_manager
    }

    #[must_use]
    pub fn is_metadata_service_available(&self) -> bool {
        self.meta.session_available()
    }

    /// Close every open ledger and stop the factory. Opens fail afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(task) = self.session_task.lock().take() {
            task.abort();
        }
        let ledgers: Vec<Arc<ManagedLedger>> = self
            .ledgers
            .lock()
            .drain()
            .filter_map(|(_, cell)| cell.get().cloned())
            .collect();

        let results = futures::future::join_all(ledgers.iter().map(|l| l.close())).await;
        let mut first_error = None;
        for (ledger, result) in ledgers.iter().zip(results) {
            match result {
                Ok(()) => {}
                Err(e) if e.is_fenced() => {
                    debug!("[{}] Skipping fenced ledger at shutdown", ledger.name());
                }
                Err(e) => {
                    warn!("[{}] Failed to close ledger at shutdown: {e}", ledger.name());
                    first_error.get_or_insert(e);
                }
            }
        }
        self.cache_manager.clear();
        info!(
            "Managed ledger factory shut down, closed {} ledgers",
            ledgers.len()
        );
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for ManagedLedgerFactory {
    fn drop(&mut self) {
        if let Some(task) = self.session_task.lock().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ManagedLedgerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedLedgerFactory")
            .field("ledgers", &self.ledgers.lock().len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn open_ledgers(registry: &Registry) -> Vec<Arc<ManagedLedger>> {
    registry
        .lock()
        .values()
        .filter_map(|c| c.get().cloned())
        .collect()
}

/// Forward metadata session transitions to the open ledgers.
async fn watch_session(mut session: watch::Receiver<SessionEvent>, registry: Weak<Registry>) {
    while session.changed().await.is_ok() {
        let event = *session.borrow_and_update();
        let Some(registry) = registry.upgrade() else {
            break;
        };
        match event {
            SessionEvent::SessionReestablished => {
                let ledgers = open_ledgers(&registry);
                info!(
                    "Metadata session re-established, resuming {} ledgers",
                    ledgers.len()
                );
                for ledger in ledgers {
                    ledger.on_session_reestablished();
                }
            }
            SessionEvent::SessionLost => {
                warn!("Metadata session lost, rollover and trim are suspended");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mledger_meta_store::MemoryMetadataStore;
    use mledger_segment::MemorySegmentStore;

    fn factory() -> (ManagedLedgerFactory, MemoryMetadataStore) {
        let meta = MemoryMetadataStore::new();
        let factory = ManagedLedgerFactory::new(
            Arc::new(MemorySegmentStore::new()),
            Arc::new(meta.clone()),
            FactoryConfig::default(),
        );
        (factory, meta)
    }

    #[tokio::test]
    async fn test_concurrent_opens_share_instance() {
        let (factory, _) = factory();
        let (a, b) = tokio::join!(factory.open("orders"), factory.open("orders"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &factory.get("orders").unwrap()));
        assert_eq!(factory.ledger_names().await.unwrap(), vec!["orders"]);
    }

    #[tokio::test]
    async fn test_failed_open_leaves_no_entry() {
        let (factory, _) = factory();
        let config = ManagedLedgerConfig::default().with_create_if_missing(false);
        let err = factory.open_with_config("missing", config).await.unwrap_err();
        assert!(matches!(err, Error::LedgerNotFound(_)));
        assert!(factory.get("missing").is_none());
        assert!(factory.open_ledgers().is_empty());
        assert!(factory.open("").await.is_err());
    }

    #[tokio::test]
    async fn test_close_removes_from_registry() {
        let (factory, _) = factory();
        let first = factory.open("orders").await.unwrap();
        first.close().await.unwrap();
        assert!(factory.get("orders").is_none());

        let second = factory.open("orders").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_delete_and_shutdown() {
        let (factory, meta) = factory();
        let ledger = factory.open("orders").await.unwrap();
        ledger.add_entry("a").await.unwrap();
        ledger.open_cursor("c1").await.unwrap();
        factory.delete("orders").await.unwrap();
        assert!(meta.paths().is_empty());
        assert!(factory.ledger_names().await.unwrap().is_empty());

        factory.open("other").await.unwrap();
        factory.shutdown().await.unwrap();
        assert!(factory.open("other").await.is_err());
        factory.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_metadata_availability() {
        let (factory, meta) = factory();
        assert!(factory.is_metadata_service_available());
        meta.trigger_session_event(SessionEvent::SessionLost);
        assert!(!factory.is_metadata_service_available());
        meta.trigger_session_event(SessionEvent::SessionReestablished);
        assert!(factory.is_metadata_service_available());
    }
}
