//! Install and activate transitions of one engine generation.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use swcache_common::{retry_with_backoff, RetryConfig};
use swcache_net::Fetch;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::ClientRegistry;
use crate::store::{CacheStorage, StoreVersion};
use crate::{EngineError, Result};

/// Lifecycle state of this engine generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkerState {
    /// Constructed, nothing run yet.
    #[default]
    Parsed,
    /// Precaching.
    Installing,
    /// Precache complete, ready to activate.
    Installed,
    /// Removing stale stores and claiming clients.
    Activating,
    /// Intercepting traffic.
    Activated,
    /// Install failed; this generation never becomes active.
    Redundant,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Parsed => "parsed",
            WorkerState::Installing => "installing",
            WorkerState::Installed => "installed",
            WorkerState::Activating => "activating",
            WorkerState::Activated => "activated",
            WorkerState::Redundant => "redundant",
        };
        f.write_str(s)
    }
}

/// Lifecycle notifications for the hosting runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// State changed.
    StateChange { store: String, state: WorkerState },
    /// A client is now controlled by this generation.
    ControllerChange { client_id: String },
    /// A superseded store was removed.
    StaleStoreDeleted { store: String },
}

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub store: String,
    pub precached: usize,
    /// Activation may start right away instead of waiting for clients of
    /// the previous generation to close.
    pub skip_waiting: bool,
}

/// Result of an activation. Deletion failures are collected, not raised.
#[derive(Debug, Default)]
pub struct ActivationReport {
    pub current: String,
    pub deleted: Vec<String>,
    pub failures: Vec<EngineError>,
    pub claimed: Vec<String>,
}

/// Drives install and activate for the configured store version.
pub struct LifecycleController {
    version: StoreVersion,
    manifest: Vec<Url>,
    scope: Url,
    storage: CacheStorage,
    fetcher: Arc<dyn Fetch>,
    clients: Arc<dyn ClientRegistry>,
    state: RwLock<WorkerState>,
    event_tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl LifecycleController {
    pub fn new(
        version: StoreVersion,
        manifest: Vec<Url>,
        scope: Url,
        storage: CacheStorage,
        fetcher: Arc<dyn Fetch>,
        clients: Arc<dyn ClientRegistry>,
    ) -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                version,
                manifest,
                scope,
                storage,
                fetcher,
                clients,
                state: RwLock::new(WorkerState::Parsed),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn version(&self) -> &StoreVersion {
        &self.version
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    /// Fetch interception only happens once activated.
    pub async fn is_active(&self) -> bool {
        self.state().await == WorkerState::Activated
    }

    async fn set_state(&self, state: WorkerState) {
        *self.state.write().await = state;
        debug!(store = %self.version, %state, "Lifecycle state changed");
        self.emit(LifecycleEvent::StateChange {
            store: self.version.name(),
            state,
        });
    }

    fn emit(&self, event: LifecycleEvent) {
        // Nobody listening is fine.
        let _ = self.event_tx.send(event);
    }

    /// Open the current store and precache the manifest.
    ///
    /// On failure the generation becomes redundant and the error is returned
    /// so the runtime can retry the install later.
    pub async fn install(&self) -> Result<InstallReport> {
        let current = self.state().await;
        if !matches!(current, WorkerState::Parsed | WorkerState::Redundant) {
            return Err(EngineError::InvalidState {
                expected: "parsed or redundant",
                actual: current,
            });
        }

        self.set_state(WorkerState::Installing).await;
        let store = self.version.name();
        info!(store = %store, urls = self.manifest.len(), "Installing");

        let outcome = match self.storage.open(&store).await {
            Ok(cache) => cache.add_all(self.fetcher.as_ref(), &self.manifest).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(precached) => {
                self.set_state(WorkerState::Installed).await;
                info!(store = %store, precached, "Install complete, skipping wait");
                Ok(InstallReport {
                    store,
                    precached,
                    skip_waiting: true,
                })
            }
            Err(e) => {
                warn!(store = %store, error = %e, category = e.category(), "Install failed");
                self.set_state(WorkerState::Redundant).await;
                Err(e)
            }
        }
    }

    /// Install, retrying with backoff while the failure is retryable.
    pub async fn install_with_retry(&self, retry: &RetryConfig) -> Result<InstallReport> {
        retry_with_backoff(retry, EngineError::is_retryable, |attempt| async move {
            debug!(attempt, "Install attempt");
            self.install().await
        })
        .await
    }

    /// Delete every stale store, then claim open clients.
    pub async fn activate(&self) -> Result<ActivationReport> {
        let current = self.state().await;
        if !matches!(current, WorkerState::Installed | WorkerState::Activated) {
            return Err(EngineError::InvalidState {
                expected: "installed",
                actual: current,
            });
        }

        self.set_state(WorkerState::Activating).await;
        let store = self.version.name();
        let mut report = ActivationReport {
            current: store.clone(),
            ..Default::default()
        };

        let stale: Vec<String> = match self.storage.list_versions(&self.version.family()).await {
            Ok(versions) => versions.into_iter().filter(|tag| *tag != store).collect(),
            Err(e) => {
                warn!(error = %e, "Could not enumerate stores, skipping cleanup");
                report.failures.push(e);
                Vec::new()
            }
        };

        let deletions = stale.iter().map(|tag| async move {
            (tag, self.storage.delete(tag).await)
        });
        for (tag, outcome) in join_all(deletions).await {
            match outcome {
                Ok(_) => {
                    self.emit(LifecycleEvent::StaleStoreDeleted { store: tag.clone() });
                    report.deleted.push(tag.clone());
                }
                Err(e) => {
                    warn!(store = %tag, error = %e, "Stale store deletion failed");
                    report.failures.push(EngineError::StaleStoreDeletion {
                        tag: tag.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        match self.clients.claim(&self.scope).await {
            Ok(claimed) => {
                for client_id in &claimed {
                    self.emit(LifecycleEvent::ControllerChange {
                        client_id: client_id.clone(),
                    });
                }
                report.claimed = claimed;
            }
            Err(e) => {
                warn!(error = %e, "Claiming clients failed");
                report.failures.push(e);
            }
        }

        self.set_state(WorkerState::Activated).await;
        info!(
            store = %store,
            deleted = report.deleted.len(),
            failures = report.failures.len(),
            claimed = report.claimed.len(),
            "Activated"
        );
        Ok(report)
    }

    /// Resume a generation that was installed and activated by an earlier
    /// run, without precaching again.
    pub async fn resume(&self) -> Result<()> {
        let store = self.version.name();
        if !self.storage.has(&store).await? {
            return Err(EngineError::InvalidState {
                expected: "an installed store for this version",
                actual: self.state().await,
            });
        }
        self.set_state(WorkerState::Activated).await;
        info!(store = %store, "Resumed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ClientWindow, WindowClients};
    use crate::store::{CacheBackend, MemoryBackend, RequestIdentity, ResponseSnapshot};
    use crate::test_support::StubFetcher;
    use async_trait::async_trait;
    use std::time::Duration;

    const ORIGIN: &str = "https://kjfc.example/";

    fn url(path: &str) -> Url {
        Url::parse(ORIGIN).unwrap().join(path).unwrap()
    }

    fn manifest() -> Vec<Url> {
        vec![url("/"), url("/index.html"), url("/manifest.json")]
    }

    fn full_site() -> StubFetcher {
        StubFetcher::new()
            .route("https://kjfc.example/", 200, "root")
            .route("https://kjfc.example/index.html", 200, "index")
            .route("https://kjfc.example/manifest.json", 200, "{}")
    }

    fn controller(
        storage: CacheStorage,
        fetcher: StubFetcher,
        clients: Arc<WindowClients>,
    ) -> (LifecycleController, mpsc::UnboundedReceiver<LifecycleEvent>) {
        LifecycleController::new(
            StoreVersion::new("kjfc-cache", "v2"),
            manifest(),
            url("/"),
            storage,
            Arc::new(fetcher),
            clients,
        )
    }

    #[tokio::test]
    async fn test_install_precaches_manifest() {
        let storage = CacheStorage::in_memory();
        let (lifecycle, mut events) =
            controller(storage.clone(), full_site(), Arc::new(WindowClients::new()));

        let report = lifecycle.install().await.unwrap();
        assert_eq!(report.store, "kjfc-cache-v2");
        assert_eq!(report.precached, 3);
        assert!(report.skip_waiting);
        assert_eq!(lifecycle.state().await, WorkerState::Installed);
        assert_eq!(storage.cache("kjfc-cache-v2").keys().await.unwrap().len(), 3);

        assert_eq!(
            events.recv().await,
            Some(LifecycleEvent::StateChange {
                store: "kjfc-cache-v2".into(),
                state: WorkerState::Installing,
            })
        );
    }

    #[tokio::test]
    async fn test_failed_install_is_redundant_and_cannot_activate() {
        let fetcher = StubFetcher::new()
            .route("https://kjfc.example/", 200, "root")
            .route("https://kjfc.example/index.html", 200, "index");
        let (lifecycle, _events) =
            controller(CacheStorage::in_memory(), fetcher, Arc::new(WindowClients::new()));

        assert!(matches!(
            lifecycle.install().await,
            Err(EngineError::PartialPopulation { .. })
        ));
        assert_eq!(lifecycle.state().await, WorkerState::Redundant);
        assert!(matches!(
            lifecycle.activate().await,
            Err(EngineError::InvalidState { .. })
        ));
        assert!(!lifecycle.is_active().await);
    }

    #[tokio::test]
    async fn test_install_with_retry_retries_then_gives_up() {
        let (lifecycle, _events) = controller(
            CacheStorage::in_memory(),
            StubFetcher::new(),
            Arc::new(WindowClients::new()),
        );
        let retry = RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            ..Default::default()
        };

        assert!(lifecycle.install_with_retry(&retry).await.is_err());
        assert_eq!(lifecycle.state().await, WorkerState::Redundant);
    }

    #[tokio::test]
    async fn test_activate_deletes_stale_and_keeps_current() {
        let storage = CacheStorage::in_memory();
        let old = storage.open("kjfc-cache-v1").await.unwrap();
        old.put(
            RequestIdentity::get(&url("/")),
            ResponseSnapshot::capture(&swcache_net::Response::new(url("/"), http::StatusCode::OK)),
        )
        .await
        .unwrap();
        storage.open("unrelated-store").await.unwrap();

        let clients = Arc::new(WindowClients::new());
        clients.add(ClientWindow::window("tab-1", url("/games"))).await;

        let (lifecycle, _events) = controller(storage.clone(), full_site(), clients.clone());
        lifecycle.install().await.unwrap();
        let before = storage.cache("kjfc-cache-v2").keys().await.unwrap();

        let report = lifecycle.activate().await.unwrap();
        assert_eq!(report.deleted, vec!["kjfc-cache-v1".to_string()]);
        assert!(report.failures.is_empty());
        assert_eq!(report.claimed, vec!["tab-1".to_string()]);
        assert!(lifecycle.is_active().await);

        assert!(!storage.has("kjfc-cache-v1").await.unwrap());
        assert!(storage.has("unrelated-store").await.unwrap());
        assert_eq!(storage.cache("kjfc-cache-v2").keys().await.unwrap(), before);
    }

    /// Backend whose deletes fail for one named store.
    #[derive(Debug)]
    struct StuckDelete {
        inner: MemoryBackend,
        stuck: &'static str,
    }

    #[async_trait]
    impl CacheBackend for StuckDelete {
        async fn open(&self, name: &str) -> Result<bool> {
            self.inner.open(name).await
        }
        async fn has(&self, name: &str) -> Result<bool> {
            self.inner.has(name).await
        }
        async fn names(&self) -> Result<Vec<String>> {
            self.inner.names().await
        }
        async fn delete(&self, name: &str) -> Result<bool> {
            if name == self.stuck {
                return Err(EngineError::store_io("device busy"));
            }
            self.inner.delete(name).await
        }
        async fn get(
            &self,
            name: &str,
            identity: &RequestIdentity,
        ) -> Result<Option<ResponseSnapshot>> {
            self.inner.get(name, identity).await
        }
        async fn put(
            &self,
            name: &str,
            identity: RequestIdentity,
            snapshot: ResponseSnapshot,
        ) -> Result<()> {
            self.inner.put(name, identity, snapshot).await
        }
        async fn keys(&self, name: &str) -> Result<Vec<RequestIdentity>> {
            self.inner.keys(name).await
        }
    }

    #[tokio::test]
    async fn test_one_failed_deletion_does_not_block_others() {
        let storage = CacheStorage::new(Arc::new(StuckDelete {
            inner: MemoryBackend::new(),
            stuck: "kjfc-cache-v0",
        }));
        storage.open("kjfc-cache-v0").await.unwrap();
        storage.open("kjfc-cache-v1").await.unwrap();

        let (lifecycle, _events) =
            controller(storage.clone(), full_site(), Arc::new(WindowClients::new()));
        lifecycle.install().await.unwrap();
        let report = lifecycle.activate().await.unwrap();

        assert_eq!(report.deleted, vec!["kjfc-cache-v1".to_string()]);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            &report.failures[0],
            EngineError::StaleStoreDeletion { tag, .. } if tag == "kjfc-cache-v0"
        ));
        assert_eq!(lifecycle.state().await, WorkerState::Activated);
    }

    #[tokio::test]
    async fn test_resume_requires_existing_store() {
        let storage = CacheStorage::in_memory();
        let (lifecycle, _events) =
            controller(storage.clone(), full_site(), Arc::new(WindowClients::new()));
        assert!(lifecycle.resume().await.is_err());

        storage.open("kjfc-cache-v2").await.unwrap();
        lifecycle.resume().await.unwrap();
        assert!(lifecycle.is_active().await);
    }
}
