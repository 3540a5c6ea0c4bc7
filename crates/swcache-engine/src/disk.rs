//! On-disk store backend.
//!
//! Layout: one directory per store under the root, one JSON file per entry
//! named by the identity digest. Entries are written to a temporary file and
//! renamed into place, so concurrent writers to one identity resolve to
//! whichever rename lands last.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::store::{CacheBackend, RequestIdentity, ResponseSnapshot};
use crate::{EngineError, Result};

const ENTRY_EXTENSION: &str = "json";

#[derive(Debug, Serialize, Deserialize)]
struct DiskEntry {
    identity: RequestIdentity,
    snapshot: ResponseSnapshot,
}

/// Stores persisted as directories of JSON entries.
#[derive(Debug, Clone)]
pub struct DiskBackend {
    root: PathBuf,
}

impl DiskBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Platform cache directory joined with `swcache`.
    pub fn default_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("swcache")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn store_dir(&self, name: &str) -> Result<PathBuf> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(EngineError::store_io(format!(
                "store name '{}' is not a valid directory name",
                name
            )));
        }
        Ok(self.root.join(name))
    }

    fn entry_path(&self, name: &str, identity: &RequestIdentity) -> Result<PathBuf> {
        Ok(self
            .store_dir(name)?
            .join(format!("{}.{}", identity.digest(), ENTRY_EXTENSION)))
    }

    async fn read_entry(path: &Path) -> Result<Option<DiskEntry>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("read entry", path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| EngineError::store_io_with_source(format!("corrupt entry {}", path.display()), e))
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> EngineError {
    EngineError::store_io_with_source(format!("failed to {} at {}", action, path.display()), e)
}

fn temp_suffix() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!(
        "tmp-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

#[async_trait]
impl CacheBackend for DiskBackend {
    async fn open(&self, name: &str) -> Result<bool> {
        let dir = self.store_dir(name)?;
        let existed = fs::try_exists(&dir)
            .await
            .map_err(|e| io_error("stat store", &dir, e))?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create store", &dir, e))?;
        Ok(!existed)
    }

    async fn has(&self, name: &str) -> Result<bool> {
        let dir = self.store_dir(name)?;
        match fs::metadata(&dir).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error("stat store", &dir, e)),
        }
    }

    async fn names(&self) -> Result<Vec<String>> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("list stores", &self.root, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| io_error("list stores", &self.root, e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if let (true, Some(name)) = (is_dir, entry.file_name().to_str()) {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let dir = self.store_dir(name)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error("delete store", &dir, e)),
        }
    }

    async fn get(&self, name: &str, identity: &RequestIdentity) -> Result<Option<ResponseSnapshot>> {
        let path = self.entry_path(name, identity)?;
        match Self::read_entry(&path).await? {
            Some(entry) if entry.identity == *identity => Ok(Some(entry.snapshot)),
            Some(entry) => {
                warn!(expected = %identity, found = %entry.identity, "Digest collision on disk entry");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        name: &str,
        identity: RequestIdentity,
        snapshot: ResponseSnapshot,
    ) -> Result<()> {
        let dir = self.store_dir(name)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create store", &dir, e))?;

        let path = self.entry_path(name, &identity)?;
        let tmp = path.with_extension(temp_suffix());
        let json = serde_json::to_vec(&DiskEntry { identity, snapshot })
            .map_err(|e| EngineError::store_io_with_source("failed to encode entry", e))?;

        fs::write(&tmp, json)
            .await
            .map_err(|e| io_error("write entry", &tmp, e))?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_error("commit entry", &path, e));
        }
        debug!(path = %path.display(), "Entry written");
        Ok(())
    }

    async fn keys(&self, name: &str) -> Result<Vec<RequestIdentity>> {
        let store = self.store_dir(name)?;
        let mut dir = match fs::read_dir(&store).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("list entries", &store, e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| io_error("list entries", &store, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            if let Some(stored) = Self::read_entry(&path).await? {
                keys.push(stored.identity);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
