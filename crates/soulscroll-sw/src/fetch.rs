//! Fetch interception.
//!
//! | Request                 | Strategy                                  |
//! |-------------------------|-------------------------------------------|
//! | non-GET or cross-origin | passthrough to network                    |
//! | navigation              | network first, offline page on failure    |
//! | any other GET           | cache first, network on miss              |

use std::sync::Arc;

use soulscroll_common::with_timeout;
use soulscroll_net::{Fetcher, Request, Response};
use tracing::{debug, trace, warn};
use url::Url;

use crate::cache::{CacheKey, CacheStorage, StoreName};
use crate::config::WorkerConfig;
use crate::{Result, ServiceWorkerError};

/// How a request will be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    Passthrough,
    NetworkFirst,
    CacheFirst,
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    OfflineFallback,
}

/// A resolved fetch.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub response: Response,
    pub source: ResponseSource,
}

impl FetchOutcome {
    fn network(response: Response) -> Self {
        Self {
            response,
            source: ResponseSource::Network,
        }
    }
}

/// Per-request policy for one worker version.
pub struct FetchInterceptor {
    config: Arc<WorkerConfig>,
    store: StoreName,
    caches: Arc<CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
}

impl FetchInterceptor {
    pub fn new(config: Arc<WorkerConfig>, caches: Arc<CacheStorage>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            store: config.store_name(),
            config,
            caches,
            fetcher,
        }
    }

    fn same_origin(&self, url: &Url) -> bool {
        url.origin() == self.config.origin.origin()
    }

    /// Pick the strategy for a request.
    pub fn strategy_for(&self, request: &Request) -> FetchStrategy {
        if CacheKey::from_request(request).is_none() || !self.same_origin(&request.url) {
            FetchStrategy::Passthrough
        } else if request.is_navigation() {
            FetchStrategy::NetworkFirst
        } else {
            FetchStrategy::CacheFirst
        }
    }

    /// Resolve a request.
    pub async fn handle(&self, request: Request) -> Result<FetchOutcome> {
        let strategy = self.strategy_for(&request);
        trace!(url = %request.url, method = %request.method, ?strategy, "Intercepted fetch");

        match strategy {
            FetchStrategy::Passthrough => Ok(FetchOutcome::network(self.fetcher.fetch(request).await?)),
            FetchStrategy::NetworkFirst => self.network_first(request).await,
            FetchStrategy::CacheFirst => self.cache_first(request).await,
        }
    }

    async fn network_first(&self, request: Request) -> Result<FetchOutcome> {
        let url = request.url.clone();
        let timeout = self.config.navigation_timeout();

        let error = match with_timeout(timeout, self.fetcher.fetch(request.timeout(timeout))).await {
            Ok(Ok(response)) => return Ok(FetchOutcome::network(response)),
            Ok(Err(e)) => ServiceWorkerError::Network(e),
            Err(e) => e.into(),
        };

        warn!(url = %url, error = %error, "Navigation failed, trying offline fallback");

        for path in [self.config.offline_page.as_str(), "/"] {
            let key = CacheKey::for_url(&self.config.resolve(path)?);
            if let Some(entry) = self.caches.get(&self.store, &key).await {
                debug!(url = %url, fallback = %path, "Serving offline fallback");
                return Ok(FetchOutcome {
                    response: entry.to_response(),
                    source: ResponseSource::OfflineFallback,
                });
            }
        }

        Err(error)
    }

    async fn cache_first(&self, request: Request) -> Result<FetchOutcome> {
        let key = CacheKey::for_url(&request.url);

        if let Some(entry) = self.caches.get(&self.store, &key).await {
            trace!(key = %key, "Cache hit");
            return Ok(FetchOutcome {
                response: entry.to_response(),
                source: ResponseSource::Cache,
            });
        }

        trace!(key = %key, "Cache miss");
        let response = self.fetcher.fetch(request).await?;

        if self.config.write_through && response.ok() {
            if let Err(e) = self.caches.put(&self.store, key, &response).await {
                debug!(error = %e, "Write-through skipped");
            }
        }

        Ok(FetchOutcome::network(response))
    }
}
