//! Page-side update detection.
//!
//! The page compares the server's deployed version against the version the
//! controlling worker reports over `GET_VERSION`. Applying an update sends
//! `SKIP_WAITING` and waits for the controller change before the page may
//! reload.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::{HeaderValue, CACHE_CONTROL};
use serde::{Deserialize, Serialize};
use soulscroll_common::{retry_with_backoff, RetryConfig};
use soulscroll_net::{Fetcher, Request};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheVersion;
use crate::clients::ClientHandle;
use crate::config::{WorkerConfig, MIN_POLL_INTERVAL};
use crate::lifecycle::{Lifecycle, MessageTarget};
use crate::message::ClientMessage;
use crate::{Result, ServiceWorkerError, ServiceWorkerId};

/// Body of `GET /api/sw-version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    #[serde(default)]
    pub timestamp: u64,
}

/// Where the latest deployed version comes from.
#[async_trait]
pub trait VersionSource: Send + Sync {
    async fn latest(&self) -> Result<VersionInfo>;
}

/// Reads the version endpoint over HTTP, bypassing caches.
///
/// Transient failures are retried; the poll interval is the outer loop.
pub struct HttpVersionSource {
    fetcher: Arc<dyn Fetcher>,
    endpoint: Url,
    retry: RetryConfig,
}

impl HttpVersionSource {
    pub fn new(fetcher: Arc<dyn Fetcher>, endpoint: Url) -> Self {
        Self {
            fetcher,
            endpoint,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn from_config(fetcher: Arc<dyn Fetcher>, config: &WorkerConfig) -> Result<Self> {
        Ok(Self::new(fetcher, config.resolve(&config.update.version_endpoint)?))
    }
}

#[async_trait]
impl VersionSource for HttpVersionSource {
    async fn latest(&self) -> Result<VersionInfo> {
        let info = retry_with_backoff(&self.retry, || async move {
            let request = Request::get(self.endpoint.clone())
                .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            self.fetcher.fetch(request).await?.error_for_status()?.json::<VersionInfo>()
        })
        .await?;
        Ok(info)
    }
}

/// Result of an update check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    UpToDate,
    UpdateAvailable { server: VersionInfo, worker: CacheVersion },
    /// No worker controls the page yet.
    NoController,
}

/// The page may reload now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadReady {
    pub worker: ServiceWorkerId,
    pub version: CacheVersion,
}

/// Page-side update poller.
pub struct UpdateNotifier {
    lifecycle: Arc<Lifecycle>,
    source: Arc<dyn VersionSource>,
}

impl UpdateNotifier {
    pub fn new(lifecycle: Arc<Lifecycle>, source: Arc<dyn VersionSource>) -> Self {
        Self { lifecycle, source }
    }

    /// Ask the controlling worker which version it runs.
    pub async fn worker_version(&self) -> Result<Option<CacheVersion>> {
        match self
            .lifecycle
            .post_message(ClientMessage::GetVersion, MessageTarget::Active)
            .await
        {
            Ok(Some(ClientMessage::VersionResponse { version, .. })) => Ok(Some(version)),
            Ok(other) => Err(ServiceWorkerError::StateError(format!(
                "unexpected reply to GET_VERSION: {:?}",
                other
            ))),
            Err(ServiceWorkerError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Compare the deployed version with the worker's.
    pub async fn check_for_update(&self) -> Result<UpdateStatus> {
        let server = self.source.latest().await?;
        let Some(worker) = self.worker_version().await? else {
            return Ok(UpdateStatus::NoController);
        };

        if server.version == worker.as_str() {
            debug!(version = %worker, "Worker is up to date");
            Ok(UpdateStatus::UpToDate)
        } else {
            info!(server = %server.version, worker = %worker, "Update available");
            Ok(UpdateStatus::UpdateAvailable { server, worker })
        }
    }

    /// Activate the waiting worker and wait until `page` is controlled by it.
    pub async fn apply_update(&self, page: &mut ClientHandle, timeout: Duration) -> Result<ReloadReady> {
        self.lifecycle
            .post_message(ClientMessage::SkipWaiting, MessageTarget::Waiting)
            .await?;
        let (worker, version) = page.wait_for_controller_change(timeout).await?;
        info!(worker = ?worker, version = %version, "Controller changed, reload is safe");
        Ok(ReloadReady { worker, version })
    }

    /// Poll at the period configured in `update.poll_interval_secs`.
    pub fn poll_with_config(self: Arc<Self>, config: &WorkerConfig) -> mpsc::Receiver<UpdateStatus> {
        self.poll(config.poll_interval())
    }

    /// Check every `interval` and report each newly seen update.
    ///
    /// Stops when the receiver is dropped.
    pub fn poll(self: Arc<Self>, interval: Duration) -> mpsc::Receiver<UpdateStatus> {
        let interval = interval.max(MIN_POLL_INTERVAL);
        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut last_seen: Option<String> = None;

            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }

                match self.check_for_update().await {
                    Ok(UpdateStatus::UpdateAvailable { server, worker }) => {
                        if last_seen.as_deref() == Some(server.version.as_str()) {
                            continue;
                        }
                        last_seen = Some(server.version.clone());
                        if tx.send(UpdateStatus::UpdateAvailable { server, worker }).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Update check failed"),
                }
            }
            debug!("Update polling stopped");
        });

        rx
    }
}
