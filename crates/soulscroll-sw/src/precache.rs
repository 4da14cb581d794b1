//! Install-time precaching of the app shell.

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use soulscroll_net::{Fetcher, Request};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheKey, CacheStorage, StoreName};
use crate::{Result, ServiceWorkerError};

/// Ordered, de-duplicated list of paths needed for offline bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct PrecacheManifest {
    entries: Vec<String>,
}

impl PrecacheManifest {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut deduped: Vec<String> = Vec::new();
        for entry in entries {
            let entry = entry.into();
            if !deduped.contains(&entry) {
                deduped.push(entry);
            }
        }
        Self { entries: deduped }
    }

    /// The SoulScroll app shell.
    pub fn app_shell() -> Self {
        Self::new([
            "/",
            "/index.html",
            "/manifest.json",
            "/icons/icon-192x192.png",
            "/icons/icon-512x512.png",
            "/offline.html",
        ])
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.iter().any(|e| e == path)
    }

    /// Resolve every entry against `origin`.
    pub fn resolve(&self, origin: &Url) -> Result<Vec<Url>> {
        self.entries
            .iter()
            .map(|path| {
                origin.join(path).map_err(|e| {
                    ServiceWorkerError::ConfigError(format!("bad precache entry '{}': {}", path, e))
                })
            })
            .collect()
    }
}

impl Default for PrecacheManifest {
    fn default() -> Self {
        Self::app_shell()
    }
}

impl From<Vec<String>> for PrecacheManifest {
    fn from(entries: Vec<String>) -> Self {
        Self::new(entries)
    }
}

impl From<PrecacheManifest> for Vec<String> {
    fn from(manifest: PrecacheManifest) -> Self {
        manifest.entries
    }
}

/// Fetch every URL and write it into `store`.
///
/// All fetches must succeed with a 2xx status before anything is written.
/// On failure a store created by this call is deleted again, so no partial
/// store survives a failed install.
pub async fn precache(
    caches: &CacheStorage,
    fetcher: &dyn Fetcher,
    store: &StoreName,
    urls: Vec<Url>,
) -> Result<usize> {
    let created = caches.open(store).await;
    info!(store = %store, count = urls.len(), "Precaching");

    let fetches = urls.into_iter().map(|url| async move {
        let response = fetcher
            .fetch(Request::get(url.clone()))
            .await?
            .error_for_status()?;
        debug!(url = %url, "Precached");
        Ok::<_, soulscroll_net::NetError>((CacheKey::for_url(&url), response))
    });

    let written = match try_join_all(fetches).await {
        Ok(batch) => caches.put_all(store, batch).await,
        Err(e) => Err(ServiceWorkerError::InstallFailed {
            store: store.to_string(),
            reason: e.to_string(),
        }),
    };

    if let Err(ref e) = written {
        warn!(store = %store, error = %e, "Precache failed");
        if created {
            caches.delete_store(&store.to_string()).await;
        }
    }

    written
}
