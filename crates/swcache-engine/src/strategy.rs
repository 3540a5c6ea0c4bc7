//! Retrieval strategies over the current store and the network.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use swcache_net::{Fetch, Request, Response};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::store::{Cache, RequestIdentity, ResponseSnapshot};
use crate::Result;

/// How a request is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Fresh content when reachable, stored copy when offline.
    NetworkFirst,
    /// Stored copy when present, network only on a miss.
    CacheFirst,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::NetworkFirst => f.write_str("network-first"),
            Strategy::CacheFirst => f.write_str("cache-first"),
        }
    }
}

// ==================== Write-behind ====================

/// Detached store writes.
///
/// Handles are kept only so failures get logged and so a runtime can drain
/// them before shutting down. Nothing on the response path waits here.
#[derive(Debug, Default)]
pub struct WriteBehind {
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl WriteBehind {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a write of `snapshot` into `cache`.
    pub async fn spawn_write(
        &self,
        cache: Cache,
        identity: RequestIdentity,
        snapshot: ResponseSnapshot,
    ) {
        let handle = tokio::spawn(async move {
            let store = cache.name().to_string();
            match cache.put(identity.clone(), snapshot).await {
                Ok(()) => trace!(store = %store, identity = %identity, "Write-through stored"),
                Err(e) => error!(
                    store = %store,
                    identity = %identity,
                    error = %e,
                    "Write-through failed"
                ),
            }
        });

        let mut pending = self.pending.lock().await;
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Number of writes not yet finished.
    pub async fn in_flight(&self) -> usize {
        self.pending
            .lock()
            .await
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Wait for every write spawned so far. Returns how many were awaited.
    pub async fn settle(&self) -> usize {
        let handles = std::mem::take(&mut *self.pending.lock().await);
        let count = handles.len();
        for outcome in join_all(handles).await {
            if let Err(e) = outcome {
                error!(error = %e, "Write-through task aborted");
            }
        }
        count
    }
}

// ==================== Retrieval ====================

/// Strategies bound to the current store.
#[derive(Clone)]
pub struct Retrieval {
    cache: Cache,
    fetcher: Arc<dyn Fetch>,
    writes: Arc<WriteBehind>,
}

impl Retrieval {
    pub fn new(cache: Cache, fetcher: Arc<dyn Fetch>, writes: Arc<WriteBehind>) -> Self {
        Self {
            cache,
            fetcher,
            writes,
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn writes(&self) -> &Arc<WriteBehind> {
        &self.writes
    }

    pub async fn run(&self, strategy: Strategy, request: &Request) -> Result<Response> {
        match strategy {
            Strategy::NetworkFirst => self.network_first(request).await,
            Strategy::CacheFirst => self.cache_first(request).await,
        }
    }

    /// Network, falling back to the current store when the fetch fails.
    ///
    /// Any status the network returns counts as success and is written
    /// through. Without a stored copy the fetch error is returned.
    pub async fn network_first(&self, request: &Request) -> Result<Response> {
        let identity = RequestIdentity::from_request(request);

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                debug!(url = %request.url, status = %response.status, "Network-first: network response");
                self.write_through(identity, &response).await;
                Ok(response)
            }
            Err(e) => match self.cache.match_request(&identity).await? {
                Some(snapshot) => {
                    warn!(url = %request.url, error = %e, "Network-first: offline, serving stored copy");
                    snapshot.to_response()
                }
                None => {
                    warn!(url = %request.url, error = %e, "Network-first: offline, no stored copy");
                    Err(e.into())
                }
            },
        }
    }

    /// Current store, falling back to the network on a miss.
    ///
    /// Only 2xx network responses are written through. Failed fetches and
    /// error statuses reach the caller unchanged.
    pub async fn cache_first(&self, request: &Request) -> Result<Response> {
        let identity = RequestIdentity::from_request(request);

        if let Some(snapshot) = self.cache.match_request(&identity).await? {
            debug!(url = %request.url, "Cache-first: hit");
            return snapshot.to_response();
        }

        debug!(url = %request.url, "Cache-first: miss, fetching");
        let response = self.fetcher.fetch(request).await?;
        if response.ok() {
            self.write_through(identity, &response).await;
        } else {
            debug!(url = %request.url, status = %response.status, "Cache-first: not storing error status");
        }
        Ok(response)
    }

    async fn write_through(&self, identity: RequestIdentity, response: &Response) {
        if !identity.is_storable() {
            trace!(identity = %identity, "Method not storable, skipping write-through");
            return;
        }
        let snapshot = ResponseSnapshot::capture(response);
        self.writes
            .spawn_write(self.cache.clone(), identity, snapshot)
            .await;
    }
}
