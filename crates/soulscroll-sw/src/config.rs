//! Worker configuration.
//!
//! A worker is a pure function of its [`WorkerConfig`]. The version is fixed
//! when the config is built and never changes at runtime.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use soulscroll_common::SoulScrollError;
use url::Url;

use crate::cache::{CacheVersion, StoreName};
use crate::precache::PrecacheManifest;
use crate::{Result, ServiceWorkerError};

/// Floor for the update poll period.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Version stamped in at build time, if any.
const BUILD_VERSION: Option<&str> = option_env!("SOULSCROLL_SW_VERSION");

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin the worker serves.
    pub origin: Url,

    /// Store name prefix.
    pub cache_prefix: String,

    /// Deployed version.
    pub version: CacheVersion,

    /// Assets written during install.
    pub precache: PrecacheManifest,

    /// Page served when a navigation fails.
    pub offline_page: String,

    /// Activate right after install instead of waiting.
    pub skip_waiting_on_install: bool,

    /// Store cache-first network responses for next time.
    pub write_through: bool,

    /// Navigation network timeout in milliseconds.
    pub navigation_timeout_ms: u64,

    /// Optional handlers.
    pub features: FeatureFlags,

    /// Background sync settings.
    pub sync: SyncConfig,

    /// Update check settings.
    pub update: UpdateConfig,

    /// Push notification copy and assets.
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Handle push events.
    pub push: bool,

    /// Handle background sync events.
    pub background_sync: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Tag the sync event must carry.
    pub tag: String,

    /// Endpoint that replays offline entries.
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Endpoint reporting the deployed version.
    pub version_endpoint: String,

    /// Seconds between update checks.
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub title: String,
    pub default_body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            cache_prefix: "soulscroll".to_string(),
            version: CacheVersion::new(BUILD_VERSION.unwrap_or("1")),
            precache: PrecacheManifest::app_shell(),
            offline_page: "/offline.html".to_string(),
            skip_waiting_on_install: true,
            write_through: false,
            navigation_timeout_ms: 10_000,
            features: FeatureFlags::default(),
            sync: SyncConfig::default(),
            update: UpdateConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            push: true,
            background_sync: true,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tag: "sync-journal-entries".to_string(),
            endpoint: "/api/sync-offline".to_string(),
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            version_endpoint: "/api/sw-version".to_string(),
            poll_interval_secs: 300,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            title: "SoulScroll".to_string(),
            default_body: "Time for your daily reflection with Luma".to_string(),
            icon: "/icons/icon-192x192.png".to_string(),
            badge: "/icons/icon-72x72.png".to_string(),
            vibrate: vec![100, 50, 100],
        }
    }
}

fn default_origin() -> Url {
    Url::parse("http://localhost:5000/").expect("static origin is a valid URL")
}

impl WorkerConfig {
    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ServiceWorkerError::ConfigError(e.to_string()))
    }

    /// Load a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SoulScrollError::config_with_source(format!("reading {}: {}", path.display(), e), e)
        })?;
        Self::from_json_str(&raw)
    }

    pub fn with_version(mut self, version: impl Into<CacheVersion>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_origin(mut self, origin: Url) -> Self {
        self.origin = origin;
        self
    }

    /// Name of the store this worker owns.
    pub fn store_name(&self) -> StoreName {
        StoreName::new(self.cache_prefix.clone(), self.version.clone())
    }

    /// Resolve an app path against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        self.origin
            .join(path)
            .map_err(|e| ServiceWorkerError::ConfigError(format!("bad path '{}': {}", path, e)))
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    /// Update check period, never shorter than [`MIN_POLL_INTERVAL`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.update.poll_interval_secs).max(MIN_POLL_INTERVAL)
    }

    /// Check the config is usable.
    pub fn validate(&self) -> Result<()> {
        if self.cache_prefix.trim().is_empty() {
            return Err(ServiceWorkerError::ConfigError("cache_prefix is empty".into()));
        }
        if self.version.is_empty() {
            return Err(ServiceWorkerError::ConfigError("version is empty".into()));
        }
        if self.version.as_str().contains("-v") {
            return Err(ServiceWorkerError::ConfigError(format!(
                "version '{}' must not contain '-v'",
                self.version
            )));
        }
        self.precache.resolve(&self.origin)?;
        if !self.precache.contains(&self.offline_page) {
            return Err(ServiceWorkerError::ConfigError(format!(
                "offline page {} is not precached",
                self.offline_page
            )));
        }
        Ok(())
    }
}
