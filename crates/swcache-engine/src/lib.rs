//! # swcache engine
//!
//! Caching policy engine for an offline-capable web application shell.
//!
//! ## Features
//!
//! - **Versioned stores**: `<prefix>-<version>` caches, in memory or on disk
//! - **Lifecycle**: install (precache), activate (drop stale stores, claim clients)
//! - **Routing**: bypass, network-first for documents, cache-first for assets
//! - **Notifications**: push payload decoding, click-to-focus-or-open
//!
//! ## Architecture
//!
//! ```text
//! Engine (one handler per event kind)
//!     │
//!     ├── LifecycleController ── CacheStorage ── CacheBackend (memory | disk)
//!     │                                  └── Cache (RequestIdentity → ResponseSnapshot)
//!     ├── RequestRouter ── Retrieval (NetworkFirst | CacheFirst) ── Fetch
//!     └── NotificationRouter ── NotificationSink
//!                            └── ClientRegistry
//! ```

use thiserror::Error;

pub mod clients;
pub mod config;
pub mod disk;
pub mod engine;
pub mod lifecycle;
pub mod notification;
pub mod router;
pub mod store;
pub mod strategy;

#[cfg(test)]
pub(crate) mod test_support;

pub use clients::{ClientMatchOptions, ClientRegistry, ClientType, ClientWindow, WindowClients};
pub use config::{EngineConfig, NotificationDefaults};
pub use disk::DiskBackend;
pub use engine::{Engine, EngineBuilder, EngineEvent, EventOutcome};
pub use lifecycle::{ActivationReport, InstallReport, LifecycleController, LifecycleEvent, WorkerState};
pub use notification::{
    ClickOutcome, DisplayedNotification, NotificationClick, NotificationData, NotificationLog,
    NotificationOptions, NotificationRequest, NotificationRouter, NotificationSink, PushPayload,
};
pub use router::{FetchOutcome, RequestClass, RequestRouter};
pub use store::{
    Cache, CacheBackend, CacheStorage, MemoryBackend, RequestIdentity, ResponseSnapshot,
    StoreVersion,
};
pub use strategy::{Retrieval, Strategy, WriteBehind};

pub use swcache_net::{Fetch, NetError, Request, RequestMode, Response, ResponseSource};

/// Boxed source error carried by store failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The persistent store is unavailable. Fatal to the invoking operation.
    #[error("Store I/O error: {message}")]
    StoreIo {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Push payload is not structured data: {0}")]
    PayloadDecode(String),

    #[error("Precache of '{store}' failed for {} URL(s): {}", .failed.len(), .failed.join(", "))]
    PartialPopulation { store: String, failed: Vec<String> },

    #[error("Failed to delete stale store '{tag}': {reason}")]
    StaleStoreDeletion { tag: String, reason: String },

    #[error("Invalid state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: WorkerState,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Client error: {0}")]
    Client(String),

    #[error("Notification display error: {0}")]
    Display(String),
}

impl EngineError {
    /// Create a store error without a source.
    pub fn store_io(message: impl Into<String>) -> Self {
        Self::StoreIo {
            message: message.into(),
            source: None,
        }
    }

    /// Create a store error with source.
    pub fn store_io_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::StoreIo {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether re-running the failed operation later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Network(_) | EngineError::PartialPopulation { .. }
        )
    }

    /// Get the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::StoreIo { .. } => "store_io",
            EngineError::Network(_) => "network",
            EngineError::PayloadDecode(_) => "payload_decode",
            EngineError::PartialPopulation { .. } => "partial_population",
            EngineError::StaleStoreDeletion { .. } => "stale_store_deletion",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::Config(_) => "config",
            EngineError::InvalidUrl(_) => "invalid_url",
            EngineError::Client(_) => "client",
            EngineError::Display(_) => "display",
        }
    }
}

impl From<url::ParseError> for EngineError {
    fn from(e: url::ParseError) -> Self {
        EngineError::InvalidUrl(e.to_string())
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(EngineError::store_io("disk full").category(), "store_io");
        assert_eq!(
            EngineError::Network(NetError::Offline("down".into())).category(),
            "network"
        );
        assert_eq!(
            EngineError::PayloadDecode("not json".into()).category(),
            "payload_decode"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(EngineError::Network(NetError::Offline("down".into())).is_retryable());
        assert!(EngineError::PartialPopulation {
            store: "kjfc-cache-v1".into(),
            failed: vec!["/manifest.json".into()],
        }
        .is_retryable());
        assert!(!EngineError::store_io("disk full").is_retryable());
        assert!(!EngineError::Config("empty prefix".into()).is_retryable());
    }

    #[test]
    fn test_partial_population_message_lists_failures() {
        let err = EngineError::PartialPopulation {
            store: "kjfc-cache-v1".into(),
            failed: vec!["https://kjfc.example/manifest.json (404)".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("kjfc-cache-v1"));
        assert!(msg.contains("1 URL(s)"));
        assert!(msg.contains("manifest.json"));
    }
}
