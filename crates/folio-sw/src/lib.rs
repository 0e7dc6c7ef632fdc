//! # Folio Service Worker
//!
//! Offline-caching service worker for the portfolio site.
//!
//! ## Features
//!
//! - **Lifecycle**: install (precache), activate (evict stale buckets), fetch
//! - **Cache API**: `open`, `keys`, `delete`, `match`, `put` over memory or disk
//! - **Fetch Interception**: cache-first with stale-while-revalidate
//! - **Host**: registration slots, clients, notifications
//!
//! ## Architecture
//!
//! ```text
//! WorkerHost
//!     ├── Registration
//!     │       ├── installing (ServiceWorker)
//!     │       ├── waiting (ServiceWorker)
//!     │       └── active (ServiceWorker) ── dyn WorkerLifecycle
//!     ├── Clients
//!     └── Notifications
//!
//! CacheLifecycleManager (WorkerLifecycle)
//!     ├── dyn CacheStorage ── dyn Cache ── Request → CacheEntry
//!     └── dyn Network
//! ```

use thiserror::Error;

pub mod cache;
pub mod disk;
pub mod fetch;
pub mod host;
pub mod lifecycle;
pub mod network;
pub mod policy;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cache::{Cache, CacheEntry, CacheStorage, MemoryCache, MemoryCacheStorage};
pub use disk::DiskCacheStorage;
pub use fetch::{Headers, Request, RequestMode, Response, ResponseType};
pub use host::{
    Client, ClientMatchOptions, ClientType, Clients, HostEvent, NotificationId, RegisterReport,
    Registration, ServiceWorker, ServiceWorkerId, ServiceWorkerState, WorkerHost,
};
pub use lifecycle::{
    ActivateOutcome, CacheLifecycleManager, ClickAction, FetchDecision, FetchOutcome,
    FetchSource, InstallOutcome, Notification, PrecacheFailure, SyncOutcome, WorkerLifecycle,
};
pub use network::Network;
pub use policy::Route;

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SwError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Quota exceeded: {needed} bytes requested, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<folio_core::FolioError> for SwError {
    fn from(err: folio_core::FolioError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<std::io::Error> for SwError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SwError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

pub type SwResult<T> = Result<T, SwError>;
