//! The engine: one handler per event kind plus a dispatcher over them.

use std::sync::Arc;

use bytes::Bytes;
use swcache_common::RetryConfig;
use swcache_net::{BypassList, Fetch, HttpFetcher, LoaderConfig, Request};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::clients::{ClientRegistry, WindowClients};
use crate::config::EngineConfig;
use crate::lifecycle::{
    ActivationReport, InstallReport, LifecycleController, LifecycleEvent, WorkerState,
};
use crate::notification::{
    ClickOutcome, DisplayedNotification, NotificationClick, NotificationLog, NotificationRouter,
    NotificationSink,
};
use crate::router::{FetchOutcome, RequestRouter};
use crate::store::{CacheBackend, CacheStorage, MemoryBackend, StoreVersion};
use crate::strategy::{Retrieval, WriteBehind};
use crate::Result;

/// An event delivered by the hosting runtime.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Install,
    Activate,
    Fetch(Request),
    Push(Option<Bytes>),
    NotificationClick(NotificationClick),
}

/// Result of handling an [`EngineEvent`].
#[derive(Debug)]
pub enum EventOutcome {
    Installed(InstallReport),
    Activated(ActivationReport),
    Fetched(FetchOutcome),
    Pushed(Option<DisplayedNotification>),
    Clicked(ClickOutcome),
}

/// Caching engine for one store version.
pub struct Engine {
    config: EngineConfig,
    storage: CacheStorage,
    lifecycle: LifecycleController,
    router: RequestRouter,
    retrieval: Retrieval,
    notifications: NotificationRouter,
}

impl Engine {
    /// Builder with default configuration.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    pub fn version(&self) -> &StoreVersion {
        self.lifecycle.version()
    }

    pub async fn state(&self) -> WorkerState {
        self.lifecycle.state().await
    }

    // ==================== Lifecycle ====================

    /// Precache the manifest into the current store.
    pub async fn install(&self) -> Result<InstallReport> {
        self.lifecycle.install().await
    }

    pub async fn install_with_retry(&self, retry: &RetryConfig) -> Result<InstallReport> {
        self.lifecycle.install_with_retry(retry).await
    }

    /// Remove stale stores and claim clients.
    pub async fn activate(&self) -> Result<ActivationReport> {
        self.lifecycle.activate().await
    }

    /// Install, then activate straight away.
    pub async fn start(&self) -> Result<ActivationReport> {
        let installed = self.install().await?;
        debug!(store = %installed.store, skip_waiting = installed.skip_waiting, "Activating after install");
        self.activate().await
    }

    /// Pick up a store installed by an earlier run.
    pub async fn resume(&self) -> Result<()> {
        self.lifecycle.resume().await
    }

    // ==================== Events ====================

    /// Answer an intercepted request. Until activation every request passes
    /// through untouched.
    pub async fn fetch(&self, request: &Request) -> Result<FetchOutcome> {
        if !self.lifecycle.is_active().await {
            trace!(url = %request.url, "Not active, passing through");
            return Ok(FetchOutcome::PassThrough);
        }
        self.router.route(request, &self.retrieval).await
    }

    pub async fn push(&self, payload: Option<&[u8]>) -> Result<Option<DisplayedNotification>> {
        self.notifications.handle_push(payload).await
    }

    pub async fn notification_click(&self, click: &NotificationClick) -> Result<ClickOutcome> {
        self.notifications.handle_click(click).await
    }

    /// Dispatch an event to its handler. Resolves once the handler settles.
    pub async fn handle(&self, event: EngineEvent) -> Result<EventOutcome> {
        match event {
            EngineEvent::Install => self.install().await.map(EventOutcome::Installed),
            EngineEvent::Activate => self.activate().await.map(EventOutcome::Activated),
            EngineEvent::Fetch(request) => self.fetch(&request).await.map(EventOutcome::Fetched),
            EngineEvent::Push(payload) => self
                .push(payload.as_deref())
                .await
                .map(EventOutcome::Pushed),
            EngineEvent::NotificationClick(click) => self
                .notification_click(&click)
                .await
                .map(EventOutcome::Clicked),
        }
    }

    /// Wait for outstanding write-throughs. Returns how many were awaited.
    pub async fn settle_writes(&self) -> usize {
        self.retrieval.writes().settle().await
    }
}

/// Builder for Engine.
pub struct EngineBuilder {
    config: EngineConfig,
    loader: LoaderConfig,
    fetcher: Option<Arc<dyn Fetch>>,
    backend: Option<Arc<dyn CacheBackend>>,
    sink: Option<Arc<dyn NotificationSink>>,
    clients: Option<Arc<dyn ClientRegistry>>,
}

impl EngineBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            loader: LoaderConfig::default(),
            fetcher: None,
            backend: None,
            sink: None,
            clients: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// HTTP settings for the default fetcher. Ignored when a fetcher is set.
    pub fn loader_config(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetch>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn clients(mut self, clients: Arc<dyn ClientRegistry>) -> Self {
        self.clients = Some(clients);
        self
    }

    /// Build the engine and the receiving end of its lifecycle events.
    pub fn build(self) -> Result<(Engine, mpsc::UnboundedReceiver<LifecycleEvent>)> {
        let config = self.config;
        config.validate()?;
        let origin = config.origin_url()?;
        let manifest = config.precache_manifest()?;
        let version = config.store_version();

        let fetcher: Arc<dyn Fetch> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new(self.loader)?),
        };
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(MemoryBackend::new()));
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(NotificationLog::new()));
        let clients = self
            .clients
            .unwrap_or_else(|| Arc::new(WindowClients::new()));

        let storage = CacheStorage::new(backend);
        let retrieval = Retrieval::new(
            storage.cache(&version.name()),
            Arc::clone(&fetcher),
            Arc::new(WriteBehind::new()),
        );
        let router = RequestRouter::new(BypassList::from_substrings(&config.bypass_hosts));
        let notifications = NotificationRouter::new(
            config.notifications.clone(),
            origin.clone(),
            config.app_root.clone(),
            sink,
            Arc::clone(&clients),
        );
        let (lifecycle, events) = LifecycleController::new(
            version.clone(),
            manifest,
            origin,
            storage.clone(),
            fetcher,
            clients,
        );

        info!(store = %version, origin = %config.origin, "Engine ready");
        Ok((
            Engine {
                config,
                storage,
                lifecycle,
                router,
                retrieval,
                notifications,
            },
            events,
        ))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
