//! # swcache common
//!
//! Shared plumbing for the swcache crates.
//!
//! ## Features
//!
//! - Logging configuration and subscriber setup
//! - Retry with exponential backoff, gated by a retryability predicate

pub mod logging;
pub mod retry;

pub use logging::{init_logging, try_init_logging, LogConfig, LogFormat, LoggingError};
pub use retry::{retry_with_backoff, RetryConfig};
