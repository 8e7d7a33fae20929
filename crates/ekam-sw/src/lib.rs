//! # Ekam Service Worker
//!
//! Offline cache controller for the Ekam listing site.
//!
//! ## Features
//!
//! - **Install**: precache the application shell, all or nothing
//! - **Activate**: drop every stale cache generation, claim open pages
//! - **Fetch interception**: network-first for navigations, cache-first for
//!   everything else, offline document as the last resort
//! - **Persistence**: cache storage snapshots to a JSON file
//!
//! ## Architecture
//!
//! ```text
//! OfflineController
//!     ├── ControllerConfig (cache name, manifest, offline document, deadline)
//!     ├── Fetcher (network)
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing
//!     │       ├── waiting
//!     │       └── active
//!     ├── Clients
//!     └── CacheStorage
//!             └── Cache ("ekam-cache-v5")
//!                     └── GET url → CacheEntry
//! ```

use ekam_net::FetchErrorKind;
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod controller;
pub mod registration;
pub mod strategy;

pub use cache::{Cache, CacheEntry, CacheStorage};
pub use clients::{Client, ClientType, Clients};
pub use config::{ControllerConfig, DEFAULT_CACHE_NAME, OFFLINE_URL, PRECACHE_ASSETS};
pub use controller::OfflineController;
pub use registration::{ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState};
pub use strategy::{FetchOutcome, PassthroughReason, ServedResponse, Source, Strategy};

// ==================== Errors ====================

/// Errors that can occur in controller operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed at {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("Network error ({kind}) for {url}: {message}")]
    Network {
        url: String,
        kind: FetchErrorKind,
        message: String,
    },

    #[error("State error: {0}")]
    State(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ServiceWorkerError {
    /// Network failure classification, if this is a network error.
    pub fn fetch_kind(&self) -> Option<FetchErrorKind> {
        match self {
            ServiceWorkerError::Network { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

// ==================== Events ====================

/// Side effects reported by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A worker changed state.
    StateChange {
        worker_id: ServiceWorkerId,
        cache_name: String,
        new_state: ServiceWorkerState,
    },
    /// Install finished and asked to replace the running version now.
    SkipWaiting { worker_id: ServiceWorkerId },
    /// A stale generation was removed.
    CacheDeleted { cache_name: String },
    /// A network response was written into the current generation.
    ResponseCached { cache_name: String, url: String },
    /// A page is now controlled by a different worker.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}
