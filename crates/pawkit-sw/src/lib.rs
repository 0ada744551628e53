//! # PawKit Service Worker
//!
//! The offline cache worker for the pet-care schedule app.
//!
//! ## Features
//!
//! - **Precache**: install fetches the whole asset manifest into a bucket
//!   named by the worker version, atomically
//! - **Eviction**: activate deletes every bucket not named by the current version
//! - **Cache-first fetch**: GET requests are answered from the bucket, with
//!   network fallback, write-through on 200 and an offline HTML fallback
//! - **Lifecycle**: installing, installed, activating, activated, redundant
//! - **Storage**: in-memory or durable on-disk buckets behind one trait
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (host runtime)
//!     │
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing (ServiceWorker)
//!     │       ├── waiting (ServiceWorker)
//!     │       └── active (ServiceWorker)
//!     ├── Clients (controlled pages)
//!     └── OfflineCacheWorker (install / activate / fetch handlers)
//!             ├── WorkerConfig (version, manifest, scope, fallback)
//!             ├── dyn CacheStorage ── Cache (bucket) ── RequestKey → CacheEntry
//!             └── dyn Network
//! ```

use pawkit_common::PawKitError;
use thiserror::Error;

pub mod cache;
pub mod config;
pub mod container;
pub mod disk;
pub mod registration;
pub mod storage;
pub mod worker;

pub use cache::{Cache, CacheEntry, RequestKey, StoredHeader};
pub use config::{AssetManifest, WorkerConfig};
pub use container::{ServiceWorkerContainer, ServiceWorkerEvent};
pub use disk::DiskCacheStorage;
pub use registration::{Client, ClientId, Clients, ServiceWorkerRegistration};
pub use storage::{CacheStorage, MemoryCacheStorage};
pub use worker::{
    ActivateOutcome, FetchOutcome, FetchResponse, InstallOutcome, OfflineCacheWorker,
    ResponseSource, ServiceWorker, ServiceWorkerId, ServiceWorkerState,
};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Precache of {url} failed: {reason}")]
    PrecacheFailed { url: String, reason: String },

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<ServiceWorkerError> for PawKitError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::CacheError(_) => PawKitError::cache_with_source("cache storage", err),
            ServiceWorkerError::InvalidManifest(_) | ServiceWorkerError::InvalidConfig(_) => {
                PawKitError::config_with_source("worker configuration", err)
            }
            ServiceWorkerError::NetworkError(_) => PawKitError::network_with_source("worker fetch", err),
            ServiceWorkerError::NotFound(what) => PawKitError::NotFound(what),
            _ => PawKitError::worker_with_source("worker lifecycle", err),
        }
    }
}
