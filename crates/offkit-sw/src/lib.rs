//! # OffKit Service Worker
//!
//! Offline-first request handling for a web application.
//!
//! ## Features
//!
//! - **Strategy selection**: navigation, same-origin and cross-origin image
//!   requests each get their own caching strategy
//! - **Versioned caches**: one active cache per version, stale versions
//!   removed at activation
//! - **Lifecycle**: install seeds the cache all-or-nothing, activate cleans
//!   up and claims open clients
//! - **Pluggable storage and network**: [`CacheBackend`] and
//!   [`offkit_net::Fetcher`]
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorker
//!     ├── Classifier ──▶ Strategy
//!     ├── Strategies (network-first, cache-first, stale-while-revalidate)
//!     │       └── StoreManager ──▶ CacheBackend
//!     └── LifecycleController (install, activate)
//!             ├── StoreManager
//!             └── ClientRegistry
//! ```

use offkit_common::OffKitError;
use thiserror::Error;

pub mod classify;
pub mod clients;
pub mod config;
pub mod key;
pub mod lifecycle;
pub mod store;
pub mod strategy;
pub mod worker;

pub use classify::{Classifier, Strategy};
pub use clients::{Client, ClientRegistry};
pub use config::{AssetManifest, ConfigError, WorkerConfig};
pub use key::RequestKey;
pub use lifecycle::{Activation, LifecycleController, LifecycleError, WorkerEvent, WorkerState};
pub use store::{CacheBackend, MemoryBackend, SqliteBackend, StoreManager, StoredResponse};
pub use strategy::{BackgroundTasks, Strategies, OFFLINE_BODY};
pub use worker::{FetchOutcome, ServiceWorker};

/// Errors raised by cache storage.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The store cannot be opened, read or written (quota, disk, lock).
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Not cacheable: {0}")]
    NotCacheable(String),

    /// A stored row no longer decodes into a response.
    #[error("Corrupt entry: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Storage task failed: {0}")]
    Join(String),
}

impl From<CacheError> for OffKitError {
    fn from(err: CacheError) -> Self {
        OffKitError::storage_with_source("cache operation failed", err)
    }
}

impl From<ConfigError> for OffKitError {
    fn from(err: ConfigError) -> Self {
        OffKitError::Config(err.to_string())
    }
}
