//! # Uncover Service Worker
//!
//! Offline cache router for the Uncover Markets progressive web app.
//!
//! ## Features
//!
//! - **Lifecycle**: install (required + best-effort assets), skip-waiting,
//!   activate (version-based store eviction, client claiming)
//! - **Fetch interception**: cache-first for same-origin assets, network-first
//!   for trusted APIs and other cross-origin hosts, synthesized 503 as the
//!   terminal fallback
//! - **Control channel**: `SKIP_WAITING`, `CLEAR_CACHE`, `CACHE_URLS`
//! - **Background sync** and **push notifications**
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (one per origin)
//!     ├── Registration
//!     │       ├── installing (ServiceWorker)
//!     │       ├── waiting (ServiceWorker)
//!     │       └── active (ServiceWorker)
//!     ├── Clients
//!     └── CacheStorage ── CacheBackend (memory | sqlite)
//!             └── Cache (named by version)
//!                     └── RequestKey → CacheEntry
//!
//! ServiceWorkerScope (one per version)
//!     install / activate / fetch / message / sync / push
//!         └── every handler receives an ExtendableEvent
//! ```

use thiserror::Error;

pub mod clients;
pub mod lifecycle;
pub mod lifetime;
pub mod message;
pub mod push;
pub mod router;
pub mod scope;
pub mod store;
pub mod strategy;
pub mod sync;

pub use clients::{Client, ClientMatchOptions, ClientType, Clients};
pub use lifecycle::{Registration, ServiceWorker, ServiceWorkerId, ServiceWorkerState};
pub use lifetime::ExtendableEvent;
pub use message::ControlMessage;
pub use push::{ClickOutcome, Notification, PushPayload};
pub use router::{RequestClass, Route, Router};
pub use scope::{ServiceWorkerContainer, ServiceWorkerEvent, ServiceWorkerScope};
pub use store::{
    Cache, CacheBackend, CacheEntry, CacheStorage, MemoryCacheStorage, RequestKey,
    SqliteCacheStorage,
};
pub use strategy::StrategyContext;
pub use sync::SyncManager;

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Bad response status {status} for {url}")]
    BadStatus { url: String, status: u16 },

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Sync failed: {0}")]
    SyncFailed(String),
}

impl From<uncover_net::NetError> for ServiceWorkerError {
    fn from(e: uncover_net::NetError) -> Self {
        Self::NetworkError(e.to_string())
    }
}

impl From<uncover_core::ConfigError> for ServiceWorkerError {
    fn from(e: uncover_core::ConfigError) -> Self {
        Self::ConfigError(e.to_string())
    }
}

impl From<rusqlite::Error> for ServiceWorkerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::CacheError(e.to_string())
    }
}

impl From<url::ParseError> for ServiceWorkerError {
    fn from(e: url::ParseError) -> Self {
        Self::CacheError(e.to_string())
    }
}

/// Result type alias for service worker operations.
pub type Result<T> = std::result::Result<T, ServiceWorkerError>;
