//! Versioned request → response stores.
//!
//! A [`CacheStorage`] holds any number of named stores; the engine only ever
//! writes to the one named by its [`StoreVersion`]. Storage itself lives
//! behind [`CacheBackend`] so the same handles work in memory and on disk.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use swcache_net::{Fetch, Request, Response, ResponseSource};
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::{EngineError, Result};

// ==================== Naming ====================

/// One generation of cached content: `<prefix>-<version>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreVersion {
    prefix: String,
    version: String,
}

impl StoreVersion {
    pub fn new(prefix: &str, version: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            version: version.to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Store name of this generation.
    pub fn name(&self) -> String {
        format!("{}-{}", self.prefix, self.version)
    }

    /// Name prefix shared by every generation.
    pub fn family(&self) -> String {
        format!("{}-", self.prefix)
    }
}

impl fmt::Display for StoreVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

// ==================== Entries ====================

/// Canonical lookup key: upper-cased method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestIdentity {
    method: String,
    url: String,
}

impl RequestIdentity {
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_ascii_uppercase(),
            url: url.into(),
        }
    }

    /// Identity of a plain GET.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    pub fn from_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Only GET responses are storable.
    pub fn is_storable(&self) -> bool {
        self.method == "GET"
    }

    /// Stable hex digest, used as the on-disk entry name.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.method.as_bytes());
        hasher.update(b" ");
        hasher.update(self.url.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for RequestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// Immutable capture of a response at the moment it was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    /// Final response URL.
    pub url: String,

    /// Response status.
    pub status: u16,

    /// Response headers in the order received, values as raw bytes.
    #[serde(with = "header_values_base64")]
    pub headers: Vec<(String, Bytes)>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Bytes,

    /// Captured at timestamp (ms since epoch).
    pub stored_at: u64,
}

impl ResponseSnapshot {
    /// Capture a response without consuming it.
    pub fn capture(response: &Response) -> Self {
        Self {
            url: response.url.to_string(),
            status: response.status.as_u16(),
            headers: response
                .headers
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        Bytes::copy_from_slice(value.as_bytes()),
                    )
                })
                .collect(),
            body: response.body().clone(),
            stored_at: now_millis(),
        }
    }

    /// Rebuild a response marked as served from the store.
    pub fn to_response(&self) -> Result<Response> {
        let url = Url::parse(&self.url)?;
        let status = StatusCode::from_u16(self.status).map_err(|e| {
            EngineError::store_io_with_source(format!("corrupt status for {}", self.url), e)
        })?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (raw_name, raw_value) in &self.headers {
            let name = HeaderName::from_bytes(raw_name.as_bytes()).map_err(|e| {
                EngineError::store_io_with_source(
                    format!("corrupt header name {:?} for {}", raw_name, self.url),
                    e,
                )
            })?;
            let value = HeaderValue::from_bytes(raw_value).map_err(|e| {
                EngineError::store_io_with_source(
                    format!("corrupt value of header {} for {}", name, self.url),
                    e,
                )
            })?;
            headers.append(name, value);
        }

        let mut response = Response::new(url, status)
            .with_body(self.body.clone())
            .with_source(ResponseSource::Cache);
        response.headers = headers;
        Ok(response)
    }

    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

mod header_values_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        headers: &[(String, Bytes)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(
            headers
                .iter()
                .map(|(name, value)| (name, STANDARD.encode(value))),
        )
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, Bytes)>, D::Error> {
        Vec::<(String, String)>::deserialize(deserializer)?
            .into_iter()
            .map(|(name, encoded)| {
                STANDARD
                    .decode(encoded)
                    .map(|value| (name, Bytes::from(value)))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

// ==================== Backend ====================

/// Storage behind every named store.
#[async_trait]
pub trait CacheBackend: Send + Sync + fmt::Debug {
    /// Create the store if absent. Returns `true` if it was created.
    async fn open(&self, name: &str) -> Result<bool>;

    async fn has(&self, name: &str) -> Result<bool>;

    /// Names of every existing store.
    async fn names(&self) -> Result<Vec<String>>;

    /// Remove a store and all its entries. Returns `false` if it was absent.
    async fn delete(&self, name: &str) -> Result<bool>;

    async fn get(&self, name: &str, identity: &RequestIdentity) -> Result<Option<ResponseSnapshot>>;

    /// Insert or overwrite, creating the store if needed.
    async fn put(&self, name: &str, identity: RequestIdentity, snapshot: ResponseSnapshot)
        -> Result<()>;

    async fn keys(&self, name: &str) -> Result<Vec<RequestIdentity>>;
}

type Entries = HashMap<RequestIdentity, ResponseSnapshot>;

/// Process-local backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    stores: RwLock<HashMap<String, Entries>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn open(&self, name: &str) -> Result<bool> {
        let mut stores = self.stores.write().await;
        if stores.contains_key(name) {
            return Ok(false);
        }
        stores.insert(name.to_string(), Entries::new());
        Ok(true)
    }

    async fn has(&self, name: &str) -> Result<bool> {
        Ok(self.stores.read().await.contains_key(name))
    }

    async fn names(&self) -> Result<Vec<String>> {
        Ok(self.stores.read().await.keys().cloned().collect())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.stores.write().await.remove(name).is_some())
    }

    async fn get(&self, name: &str, identity: &RequestIdentity) -> Result<Option<ResponseSnapshot>> {
        Ok(self
            .stores
            .read()
            .await
            .get(name)
            .and_then(|entries| entries.get(identity))
            .cloned())
    }

    async fn put(
        &self,
        name: &str,
        identity: RequestIdentity,
        snapshot: ResponseSnapshot,
    ) -> Result<()> {
        self.stores
            .write()
            .await
            .entry(name.to_string())
            .or_default()
            .insert(identity, snapshot);
        Ok(())
    }

    async fn keys(&self, name: &str) -> Result<Vec<RequestIdentity>> {
        Ok(self
            .stores
            .read()
            .await
            .get(name)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }
}

// ==================== Cache Storage ====================

/// All named stores.
#[derive(Debug, Clone)]
pub struct CacheStorage {
    backend: Arc<dyn CacheBackend>,
}

impl CacheStorage {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Storage backed by a fresh [`MemoryBackend`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Open a store, creating it if it doesn't exist.
    pub async fn open(&self, tag: &str) -> Result<Cache> {
        if self.backend.open(tag).await? {
            debug!(store = %tag, "Store created");
        }
        Ok(self.cache(tag))
    }

    /// Handle to a store without touching the backend. Writes create it
    /// lazily; reads of an absent store miss.
    pub fn cache(&self, tag: &str) -> Cache {
        Cache {
            name: tag.to_string(),
            backend: Arc::clone(&self.backend),
        }
    }

    pub async fn has(&self, tag: &str) -> Result<bool> {
        self.backend.has(tag).await
    }

    /// Every existing store whose name starts with `prefix`.
    pub async fn list_versions(&self, prefix: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .backend
            .names()
            .await?
            .into_iter()
            .filter(|name| name.starts_with(prefix))
            .collect())
    }

    /// Delete a store. Deleting an absent tag succeeds with `false`.
    pub async fn delete(&self, tag: &str) -> Result<bool> {
        let removed = self.backend.delete(tag).await?;
        if removed {
            info!(store = %tag, "Store deleted");
        }
        Ok(removed)
    }
}

// ==================== Cache ====================

/// Handle to one named store.
#[derive(Debug, Clone)]
pub struct Cache {
    name: String,
    backend: Arc<dyn CacheBackend>,
}

impl Cache {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request.
    pub async fn match_request(&self, identity: &RequestIdentity) -> Result<Option<ResponseSnapshot>> {
        self.backend.get(&self.name, identity).await
    }

    /// Add entry. Last write for an identity wins.
    pub async fn put(&self, identity: RequestIdentity, snapshot: ResponseSnapshot) -> Result<()> {
        trace!(store = %self.name, identity = %identity, "Storing snapshot");
        self.backend.put(&self.name, identity, snapshot).await
    }

    pub async fn keys(&self) -> Result<Vec<RequestIdentity>> {
        self.backend.keys(&self.name).await
    }

    /// Fetch and store every URL.
    ///
    /// Fetches run concurrently. Successful entries are kept even when
    /// another URL fails; any failure or non-2xx status fails the whole
    /// call with [`EngineError::PartialPopulation`]. A store write error is
    /// returned as-is.
    pub async fn add_all(&self, fetcher: &dyn Fetch, urls: &[Url]) -> Result<usize> {
        let fetches = urls.iter().map(|url| async move {
            let request = Request::get(url.clone());
            (url, fetcher.fetch(&request).await)
        });

        let mut failed = Vec::new();
        let mut stored = 0;
        for (url, outcome) in join_all(fetches).await {
            match outcome {
                Ok(response) if response.ok() => {
                    self.put(RequestIdentity::get(url), ResponseSnapshot::capture(&response))
                        .await?;
                    stored += 1;
                }
                Ok(response) => {
                    warn!(url = %url, status = %response.status, "Precache fetch returned error status");
                    failed.push(format!("{} ({})", url, response.status.as_u16()));
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "Precache fetch failed");
                    failed.push(format!("{} ({})", url, e));
                }
            }
        }

        if failed.is_empty() {
            Ok(stored)
        } else {
            Err(EngineError::PartialPopulation {
                store: self.name.clone(),
                failed,
            })
        }
    }
}
