//! # SoulScroll Offline Worker
//!
//! The offline layer of the SoulScroll journaling app, modelled as a
//! service worker.
//!
//! ## Features
//!
//! - **Versioned cache**: one store per deployed version, stale stores purged
//!   on activation
//! - **Precache**: all-or-nothing install of the app shell
//! - **Fetch interception**: network-first navigations with an offline page,
//!   cache-first subresources
//! - **Lifecycle**: install → waiting → active → redundant, skip-waiting and
//!   client claiming
//! - **Update channel**: `GET_VERSION` / `SKIP_WAITING` messages, `SW_UPDATED`
//!   broadcasts, version polling
//! - **Background sync**: replay of offline journal entries
//! - **Push**: daily-reflection notifications
//!
//! ## Architecture
//!
//! ```text
//! Lifecycle (registration controller)
//!     │
//!     ├── installing / waiting / active (ServiceWorker)
//!     │       └── FetchInterceptor
//!     ├── CacheStorage
//!     │       └── <prefix>-v<version> (Cache)
//!     │               └── CacheKey → CacheEntry
//!     ├── Clients ──── ClientEvent ───→ ClientHandle (page)
//!     ├── Notifications
//!     └── SyncRegistry
//!
//! UpdateNotifier (page) ── GET /api/sw-version, GET_VERSION, SKIP_WAITING
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use soulscroll_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod fetch;
pub mod lifecycle;
pub mod message;
pub mod precache;
pub mod push;
pub mod sync;
pub mod update;
pub mod worker;

pub use cache::{CacheEntry, CacheKey, CacheStorage, CacheVersion, StoreName};
pub use clients::{ClientEvent, ClientHandle, ClientId, Clients, WindowAction};
pub use config::{FeatureFlags, NotificationConfig, SyncConfig, UpdateConfig, WorkerConfig};
pub use fetch::{FetchInterceptor, FetchOutcome, FetchStrategy, ResponseSource};
pub use lifecycle::{Lifecycle, MessageTarget};
pub use message::{ClientMessage, MessageOutcome};
pub use precache::PrecacheManifest;
pub use push::{ClickOutcome, Notification, NotificationAction, NotificationId, Notifications};
pub use sync::{SyncDisposition, SyncRegistry};
pub use update::{HttpVersionSource, ReloadReady, UpdateNotifier, UpdateStatus, VersionInfo, VersionSource};
pub use worker::{ServiceWorker, WorkerContext};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed for {store}: {reason}")]
    InstallFailed { store: String, reason: String },

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Sync '{tag}' failed: {source}")]
    SyncFailed {
        tag: String,
        #[source]
        source: NetError,
    },

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl From<soulscroll_common::SoulScrollError> for ServiceWorkerError {
    fn from(err: soulscroll_common::SoulScrollError) -> Self {
        use soulscroll_common::SoulScrollError;
        match err {
            SoulScrollError::Timeout(d) => Self::Timeout(d),
            SoulScrollError::Config { message, .. } => Self::ConfigError(message),
            other => Self::StateError(other.to_string()),
        }
    }
}

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, ServiceWorkerError>;

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Created, not yet installing.
    #[default]
    Parsed,
    /// Installing (precache in progress).
    Installing,
    /// Installed and waiting for activation.
    Installed,
    /// Activating (stale stores being purged).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced or failed to install.
    Redundant,
}

impl ServiceWorkerState {
    /// Whether moving to `next` is a legal lifecycle step.
    pub fn can_transition_to(self, next: ServiceWorkerState) -> bool {
        use ServiceWorkerState::*;
        matches!(
            (self, next),
            (Parsed, Installing)
                | (Installing, Installed)
                | (Installed, Activating)
                | (Activating, Activated)
                | (_, Redundant)
        ) && self != Redundant
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
