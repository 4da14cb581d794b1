//! Versioned cache storage.
//!
//! Each deployed version owns exactly one store, named `<prefix>-v<version>`.
//! Entries are immutable snapshots; writing a key again replaces the entry.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, Method, StatusCode};
use serde::{Deserialize, Serialize};
use soulscroll_net::{Request, Response};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::{now_millis, Result, ServiceWorkerError};

// ==================== Names ====================

/// Opaque version token embedded in a store name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheVersion(String);

impl CacheVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheVersion {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheVersion {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Name of a versioned store: `<prefix>-v<version>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreName {
    prefix: String,
    version: CacheVersion,
}

impl StoreName {
    pub fn new(prefix: impl Into<String>, version: CacheVersion) -> Self {
        Self {
            prefix: prefix.into(),
            version,
        }
    }

    /// Split a store name back into prefix and version.
    pub fn parse(name: &str) -> Option<Self> {
        let (prefix, version) = name.rsplit_once("-v")?;
        if prefix.is_empty() || version.is_empty() {
            return None;
        }
        Some(Self::new(prefix, CacheVersion::new(version)))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn version(&self) -> &CacheVersion {
        &self.version
    }
}

impl fmt::Display for StoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-v{}", self.prefix, self.version)
    }
}

// ==================== Keys & Entries ====================

/// Normalized identity of a cacheable request.
///
/// Only GET requests have a key. The URL fragment is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a GET of `url`.
    pub fn for_url(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self(url.into())
    }

    /// Key for a request, or `None` if the request is not cacheable.
    pub fn from_request(request: &Request) -> Option<Self> {
        (request.method == Method::GET).then(|| Self::for_url(&request.url))
    }

    pub fn url(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GET {}", self.0)
    }
}

/// A stored response snapshot.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// URL the response was served for.
    pub url: Url,
    /// Response status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response.
    pub fn from_response(response: &Response) -> Self {
        Self {
            url: response.url.clone(),
            status: response.status,
            headers: response.headers.clone(),
            body: response.body().clone(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild a response from the snapshot.
    pub fn to_response(&self) -> Response {
        let mut response = Response::new(self.url.clone(), self.status).with_body(self.body.clone());
        response.headers = self.headers.clone();
        response
    }
}

// ==================== Cache ====================

/// A single named store.
#[derive(Debug)]
pub struct Cache {
    name: String,
    entries: HashMap<CacheKey, Arc<CacheEntry>>,
}

impl Cache {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: CacheKey, entry: CacheEntry) {
        self.entries.insert(key, Arc::new(entry));
    }
}

fn require_ok(key: &CacheKey, response: &Response) -> Result<()> {
    if response.ok() {
        Ok(())
    } else {
        Err(ServiceWorkerError::CacheError(format!(
            "refusing to store {} response for {}",
            response.status, key
        )))
    }
}

// ==================== Cache Storage ====================

/// All stores for one origin.
#[derive(Debug, Default)]
pub struct CacheStorage {
    stores: RwLock<HashMap<String, Cache>>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store, creating it if it does not exist.
    ///
    /// Returns `true` if the store was created by this call.
    pub async fn open(&self, name: &StoreName) -> bool {
        let name = name.to_string();
        let mut stores = self.stores.write().await;
        if stores.contains_key(&name) {
            return false;
        }
        debug!(store = %name, "Creating cache store");
        stores.insert(name.clone(), Cache::new(&name));
        true
    }

    /// Check if a store exists.
    pub async fn has(&self, name: &str) -> bool {
        self.stores.read().await.contains_key(name)
    }

    /// Store a response under `key`. The store must already be open, and
    /// only 2xx responses are accepted.
    pub async fn put(&self, store: &StoreName, key: CacheKey, response: &Response) -> Result<()> {
        require_ok(&key, response)?;
        let name = store.to_string();
        let mut stores = self.stores.write().await;
        let cache = stores
            .get_mut(&name)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("cache store {}", name)))?;
        trace!(store = %name, key = %key, "Cache put");
        cache.insert(key, CacheEntry::from_response(response));
        Ok(())
    }

    /// Store a batch of responses in one step. Either every entry is written
    /// or none is.
    pub async fn put_all(&self, store: &StoreName, batch: Vec<(CacheKey, Response)>) -> Result<usize> {
        for (key, response) in &batch {
            require_ok(key, response)?;
        }
        let name = store.to_string();
        let mut stores = self.stores.write().await;
        let cache = stores
            .get_mut(&name)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("cache store {}", name)))?;
        let count = batch.len();
        for (key, response) in batch {
            cache.insert(key, CacheEntry::from_response(&response));
        }
        debug!(store = %name, count, "Cache batch written");
        Ok(count)
    }

    /// Look up `key` in one store.
    pub async fn get(&self, store: &StoreName, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let stores = self.stores.read().await;
        stores.get(&store.to_string())?.get(key)
    }

    /// Look up `key` across all stores.
    pub async fn match_any(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let stores = self.stores.read().await;
        stores.values().find_map(|cache| cache.get(key))
    }

    /// Remove one entry from a store.
    pub async fn delete(&self, store: &StoreName, key: &CacheKey) -> bool {
        let mut stores = self.stores.write().await;
        stores
            .get_mut(&store.to_string())
            .map(|cache| cache.entries.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Delete a whole store.
    pub async fn delete_store(&self, name: &str) -> bool {
        let removed = self.stores.write().await.remove(name).is_some();
        if removed {
            debug!(store = %name, "Deleted cache store");
        }
        removed
    }

    /// All store names, sorted.
    pub async fn list_store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Keys held by a store.
    pub async fn keys(&self, store: &StoreName) -> Vec<CacheKey> {
        let stores = self.stores.read().await;
        stores
            .get(&store.to_string())
            .map(|cache| cache.entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of entries in a store (0 if absent).
    pub async fn len(&self, store: &StoreName) -> usize {
        let stores = self.stores.read().await;
        stores
            .get(&store.to_string())
            .map(|cache| cache.entries.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &str) -> Url {
        Url::parse("https://soulscroll.app").unwrap().join(path).unwrap()
    }

    fn ok_response(path: &str, body: &'static str) -> Response {
        Response::new(url(path), StatusCode::OK).with_body(body)
    }

    fn store(version: &str) -> StoreName {
        StoreName::new("soulscroll", CacheVersion::new(version))
    }

    #[test]
    fn test_store_name_roundtrip() {
        let name = store("12");
        assert_eq!(name.to_string(), "soulscroll-v12");

        let parsed = StoreName::parse("soulscroll-v12").unwrap();
        assert_eq!(parsed, name);
        assert_eq!(parsed.version().as_str(), "12");
    }

    #[test]
    fn test_store_name_parse_rejects_foreign_names() {
        assert!(StoreName::parse("workbox-precache").is_none());
        assert!(StoreName::parse("-v3").is_none());
        assert!(StoreName::parse("soulscroll-v").is_none());
    }

    #[test]
    fn test_cache_key_only_for_get() {
        let get = Request::get(url("/index.html#top"));
        let key = CacheKey::from_request(&get).unwrap();
        assert_eq!(key.url(), "https://soulscroll.app/index.html");

        let post = Request::post(url("/api/sync-offline"), None);
        assert!(CacheKey::from_request(&post).is_none());
    }

    #[tokio::test]
    async fn test_put_requires_open_store() {
        let storage = CacheStorage::new();
        let result = storage
            .put(&store("1"), CacheKey::for_url(&url("/")), &ok_response("/", "shell"))
            .await;
        assert!(matches!(result, Err(ServiceWorkerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_put_replaces_entry() {
        let storage = CacheStorage::new();
        let name = store("1");
        assert!(storage.open(&name).await);
        assert!(!storage.open(&name).await);

        let key = CacheKey::for_url(&url("/manifest.json"));
        storage.put(&name, key.clone(), &ok_response("/manifest.json", "a")).await.unwrap();
        let first = storage.get(&name, &key).await.unwrap();

        storage.put(&name, key.clone(), &ok_response("/manifest.json", "b")).await.unwrap();
        let second = storage.get(&name, &key).await.unwrap();

        // The earlier snapshot is untouched.
        assert_eq!(first.body, Bytes::from_static(b"a"));
        assert_eq!(second.body, Bytes::from_static(b"b"));
        assert_eq!(storage.len(&name).await, 1);
    }

    #[tokio::test]
    async fn test_put_rejects_error_status() {
        let storage = CacheStorage::new();
        let name = store("1");
        storage.open(&name).await;

        let missing = Response::new(url("/offline.html"), StatusCode::NOT_FOUND);
        let result = storage
            .put(&name, CacheKey::for_url(&url("/offline.html")), &missing)
            .await;
        assert!(matches!(result, Err(ServiceWorkerError::CacheError(_))));
    }

    #[tokio::test]
    async fn test_put_all_is_all_or_nothing() {
        let storage = CacheStorage::new();
        let name = store("1");
        storage.open(&name).await;

        let batch = vec![
            (CacheKey::for_url(&url("/")), ok_response("/", "shell")),
            (
                CacheKey::for_url(&url("/offline.html")),
                Response::new(url("/offline.html"), StatusCode::NOT_FOUND),
            ),
        ];
        assert!(storage.put_all(&name, batch).await.is_err());
        assert_eq!(storage.len(&name).await, 0);
    }

    #[tokio::test]
    async fn test_list_and_delete_stores() {
        let storage = CacheStorage::new();
        storage.open(&store("2")).await;
        storage.open(&store("1")).await;

        assert_eq!(
            storage.list_store_names().await,
            vec!["soulscroll-v1".to_string(), "soulscroll-v2".to_string()]
        );

        assert!(storage.delete_store("soulscroll-v1").await);
        assert!(!storage.delete_store("soulscroll-v1").await);
        assert!(!storage.has("soulscroll-v1").await);
        assert_eq!(storage.list_store_names().await, vec!["soulscroll-v2".to_string()]);
    }

    #[tokio::test]
    async fn test_match_any_and_delete_entry() {
        let storage = CacheStorage::new();
        let name = store("1");
        storage.open(&name).await;
        let key = CacheKey::for_url(&url("/icons/icon-192x192.png"));
        storage
            .put(&name, key.clone(), &ok_response("/icons/icon-192x192.png", "png"))
            .await
            .unwrap();

        assert!(storage.match_any(&key).await.is_some());
        assert_eq!(storage.keys(&name).await, vec![key.clone()]);
        assert!(storage.delete(&name, &key).await);
        assert!(storage.match_any(&key).await.is_none());
    }

    #[test]
    fn test_entry_to_response() {
        let entry = CacheEntry::from_response(&ok_response("/", "shell"));
        let response = entry.to_response();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text().unwrap(), "shell");
    }
}
