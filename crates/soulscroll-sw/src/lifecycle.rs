//! Registration and lifecycle control.
//!
//! [`Lifecycle`] owns the `installing` / `waiting` / `active` slots for one
//! scope and routes events to the right worker. Activation runs under the
//! registration write lock and fetches under the read lock, so a fetch never
//! sees a new store as current before its purge and claim have finished.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value as JsonValue;
use soulscroll_common::RetryConfig;
use soulscroll_net::{Fetcher, Request};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, StoreName};
use crate::clients::{ClientHandle, ClientId, Clients};
use crate::config::WorkerConfig;
use crate::fetch::{FetchOutcome, ResponseSource};
use crate::message::{ClientMessage, MessageOutcome};
use crate::push::{ClickOutcome, NotificationId, Notifications};
use crate::sync::{SyncDisposition, SyncRegistry};
use crate::worker::{ServiceWorker, WorkerContext};
use crate::{now_millis, Result, ServiceWorkerError, ServiceWorkerId};

/// Which worker a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTarget {
    Worker(ServiceWorkerId),
    Active,
    Waiting,
}

#[derive(Default)]
struct Registration {
    installing: Option<Arc<ServiceWorker>>,
    waiting: Option<Arc<ServiceWorker>>,
    active: Option<Arc<ServiceWorker>>,
}

impl Registration {
    fn find(&self, id: ServiceWorkerId) -> Option<Arc<ServiceWorker>> {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .find(|w| w.id() == id)
            .cloned()
    }
}

/// Lifecycle controller for one scope.
pub struct Lifecycle {
    registration: RwLock<Registration>,
    sync: Mutex<SyncRegistry>,
    ctx: WorkerContext,
}

impl Lifecycle {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            registration: RwLock::new(Registration::default()),
            sync: Mutex::new(SyncRegistry::default()),
            ctx: WorkerContext {
                caches: Arc::new(CacheStorage::new()),
                clients: Arc::new(Clients::new()),
                notifications: Arc::new(Notifications::new()),
                fetcher,
            },
        }
    }

    /// Override the background sync backoff.
    pub fn with_sync_retry(mut self, retry: RetryConfig) -> Self {
        self.sync = Mutex::new(SyncRegistry::new(retry));
        self
    }

    pub fn caches(&self) -> &Arc<CacheStorage> {
        &self.ctx.caches
    }

    pub fn clients(&self) -> &Arc<Clients> {
        &self.ctx.clients
    }

    pub fn notifications(&self) -> &Arc<Notifications> {
        &self.ctx.notifications
    }

    pub async fn active(&self) -> Option<Arc<ServiceWorker>> {
        self.registration.read().await.active.clone()
    }

    pub async fn waiting(&self) -> Option<Arc<ServiceWorker>> {
        self.registration.read().await.waiting.clone()
    }

    pub async fn installing(&self) -> Option<Arc<ServiceWorker>> {
        self.registration.read().await.installing.clone()
    }

    // ==================== Registration ====================

    /// Install a worker built from `config`.
    ///
    /// On success the worker waits, then activates right away when
    /// `skip_waiting_on_install` is set or nothing is active yet. Otherwise
    /// pages are told an update is available.
    pub async fn register(&self, config: WorkerConfig) -> Result<Arc<ServiceWorker>> {
        config.validate()?;
        let skip_waiting = config.skip_waiting_on_install;
        let worker = Arc::new(ServiceWorker::new(config, self.ctx.clone()));
        info!(worker = ?worker.id(), store = %worker.store_name(), "Registering");

        if let Some(previous) = self.registration.write().await.installing.replace(worker.clone()) {
            previous.mark_redundant();
        }

        let installed = worker.install().await;

        let activate_now = {
            let mut reg = self.registration.write().await;
            if reg.installing.as_ref().map(|w| w.id()) == Some(worker.id()) {
                reg.installing = None;
            }
            installed?;

            if let Some(previous) = reg.waiting.replace(worker.clone()) {
                debug!(worker = ?previous.id(), "Replaced waiting worker");
                previous.mark_redundant();
            }
            skip_waiting || reg.active.is_none()
        };

        if activate_now {
            self.promote(Some(worker.id())).await?;
        } else {
            info!(worker = ?worker.id(), "Installed, waiting for clients to close");
            self.ctx
                .clients
                .broadcast(ClientMessage::SwUpdateAvailable {
                    version: worker.version().clone(),
                    timestamp: now_millis(),
                })
                .await;
        }

        Ok(worker)
    }

    /// Activate the waiting worker, if any. Returns whether one activated.
    pub async fn skip_waiting(&self) -> Result<bool> {
        self.promote(None).await
    }

    /// Promote the waiting worker. With `expected`, only if it is that one.
    async fn promote(&self, expected: Option<ServiceWorkerId>) -> Result<bool> {
        let mut reg = self.registration.write().await;

        let matches = match (&reg.waiting, expected) {
            (Some(w), Some(id)) => w.id() == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            debug!("No matching waiting worker, skip waiting is a no-op");
            return Ok(false);
        }
        let Some(worker) = reg.waiting.take() else {
            return Ok(false);
        };

        match worker.activate().await {
            Ok(_) => {
                if let Some(old) = reg.active.replace(worker) {
                    old.mark_redundant();
                }
                Ok(true)
            }
            Err(e) => {
                warn!(worker = ?worker.id(), error = %e, "Activation failed");
                worker.mark_redundant();
                Err(e)
            }
        }
    }

    /// Drop every worker and this scope's stores.
    pub async fn unregister(&self) -> usize {
        let workers: Vec<Arc<ServiceWorker>> = {
            let mut reg = self.registration.write().await;
            [reg.installing.take(), reg.waiting.take(), reg.active.take()]
                .into_iter()
                .flatten()
                .collect()
        };

        let mut deleted = 0;
        for worker in &workers {
            worker.mark_redundant();
            for name in self.ctx.caches.list_store_names().await {
                let ours = StoreName::parse(&name)
                    .map_or(false, |store| store.prefix() == worker.store_name().prefix());
                if ours && self.ctx.caches.delete_store(&name).await {
                    deleted += 1;
                }
            }
        }
        info!(workers = workers.len(), deleted, "Unregistered");
        deleted
    }

    // ==================== Clients ====================

    /// Open a page in scope. It is controlled by the active worker, if any.
    pub async fn connect(&self, url: Url) -> ClientHandle {
        let controller = self.active().await.map(|w| w.id());
        self.ctx.clients.connect(url, controller).await
    }

    /// Close a page. When the last page goes, a waiting worker activates.
    pub async fn client_disconnected(&self, id: ClientId) -> Result<()> {
        self.ctx.clients.disconnect(id).await;
        if self.ctx.clients.is_empty().await && self.waiting().await.is_some() {
            debug!("Last client closed, activating waiting worker");
            self.promote(None).await?;
        }
        Ok(())
    }

    // ==================== Events ====================

    /// Deliver a message. Returns the reply, if the worker sent one.
    pub async fn post_message(
        &self,
        message: ClientMessage,
        target: MessageTarget,
    ) -> Result<Option<ClientMessage>> {
        let worker = {
            let reg = self.registration.read().await;
            match target {
                MessageTarget::Worker(id) => reg.find(id),
                MessageTarget::Active => reg.active.clone(),
                MessageTarget::Waiting => reg.waiting.clone(),
            }
        }
        .ok_or_else(|| ServiceWorkerError::NotFound(format!("worker for {:?}", target)))?;

        match worker.handle_message(message) {
            MessageOutcome::Reply(reply) => Ok(Some(reply)),
            MessageOutcome::SkipWaiting => {
                self.promote(Some(worker.id())).await?;
                Ok(None)
            }
            MessageOutcome::Ignored => Ok(None),
        }
    }

    /// Deliver a raw JSON envelope and return the raw reply.
    pub async fn post_json(&self, envelope: &JsonValue, target: MessageTarget) -> Result<Option<JsonValue>> {
        let reply = self.post_message(ClientMessage::from_json(envelope), target).await?;
        Ok(reply.map(|m| m.to_json()))
    }

    /// Route a request through the active worker, or straight to network.
    ///
    /// The registration read lock is held until the worker has answered, so
    /// an activation waits for in-flight fetches and a fetch never straddles
    /// two workers.
    pub async fn fetch(&self, request: Request) -> Result<FetchOutcome> {
        let reg = self.registration.read().await;
        if let Some(worker) = reg.active.as_ref() {
            return worker.handle_fetch(request).await;
        }
        drop(reg);

        let response = self.ctx.fetcher.fetch(request).await?;
        Ok(FetchOutcome {
            response,
            source: ResponseSource::Network,
        })
    }

    /// Register a background sync tag.
    pub async fn register_sync(&self, tag: &str) {
        self.sync.lock().await.register(tag);
    }

    /// Pending sync tags.
    pub async fn sync_tags(&self) -> Vec<String> {
        self.sync.lock().await.tags()
    }

    /// Fire every sync tag whose backoff has elapsed through the active
    /// worker and record the outcomes. Tags already claimed by an
    /// overlapping dispatch are left to it.
    pub async fn dispatch_sync(&self) -> Vec<(String, SyncDisposition)> {
        let Some(worker) = self.active().await else {
            debug!("No active worker, sync deferred");
            return Vec::new();
        };

        let tags = self.sync.lock().await.claim_ready(Instant::now());
        let mut outcomes = Vec::with_capacity(tags.len());

        for tag in tags {
            let succeeded = worker.handle_sync(&tag).await.is_ok();
            match self.sync.lock().await.record(&tag, succeeded, Instant::now()) {
                Some(disposition) => outcomes.push((tag, disposition)),
                None => debug!(tag = %tag, "Sync tag vanished while in flight"),
            }
        }
        outcomes
    }

    /// Connectivity is back: clear backoff and fire pending tags.
    pub async fn online(&self) -> Vec<(String, SyncDisposition)> {
        self.sync.lock().await.online();
        self.dispatch_sync().await
    }

    /// Deliver a push message to the active worker.
    pub async fn push(&self, data: Option<&[u8]>) -> Option<NotificationId> {
        self.active().await?.handle_push(data).await
    }

    /// Deliver a notification click to the active worker.
    pub async fn notification_click(&self, id: NotificationId, action: Option<&str>) -> Result<ClickOutcome> {
        let worker = self
            .active()
            .await
            .ok_or_else(|| ServiceWorkerError::NotFound("active worker".into()))?;
        worker.handle_notification_click(id, action).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ClientEvent;
    use crate::ServiceWorkerState;
    use async_trait::async_trait;
    use http::StatusCode;
    use soulscroll_net::{NetError, Response};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Server {
        up: AtomicBool,
    }

    #[async_trait]
    impl Fetcher for Server {
        async fn fetch(&self, request: Request) -> std::result::Result<Response, NetError> {
            if !self.up.load(Ordering::SeqCst) {
                return Err(NetError::Offline);
            }
            Ok(Response::new(request.url.clone(), StatusCode::OK))
        }
    }

    fn lifecycle() -> (Lifecycle, Arc<Server>) {
        let server = Arc::new(Server {
            up: AtomicBool::new(true),
        });
        (Lifecycle::new(server.clone()), server)
    }

    fn config(version: &str, skip_waiting: bool) -> WorkerConfig {
        let mut config = WorkerConfig::default()
            .with_origin(Url::parse("https://soulscroll.app").unwrap())
            .with_version(version);
        config.skip_waiting_on_install = skip_waiting;
        config
    }

    fn root() -> Url {
        Url::parse("https://soulscroll.app/").unwrap()
    }

    #[tokio::test]
    async fn test_first_registration_activates() {
        let (lifecycle, _) = lifecycle();
        let worker = lifecycle.register(config("1", false)).await.unwrap();

        assert_eq!(worker.state(), ServiceWorkerState::Activated);
        assert_eq!(lifecycle.active().await.unwrap().id(), worker.id());
        assert!(lifecycle.waiting().await.is_none());
        assert!(lifecycle.installing().await.is_none());
    }

    #[tokio::test]
    async fn test_update_waits_then_skip_waiting() {
        let (lifecycle, _) = lifecycle();
        let v1 = lifecycle.register(config("1", false)).await.unwrap();
        let mut page = lifecycle.connect(root()).await;

        let v2 = lifecycle.register(config("2", false)).await.unwrap();
        assert_eq!(v2.state(), ServiceWorkerState::Installed);
        assert!(matches!(
            page.recv().await,
            Some(ClientEvent::Message(ClientMessage::SwUpdateAvailable { .. }))
        ));

        lifecycle
            .post_message(ClientMessage::SkipWaiting, MessageTarget::Waiting)
            .await
            .unwrap();

        assert_eq!(v1.state(), ServiceWorkerState::Redundant);
        assert_eq!(v2.state(), ServiceWorkerState::Activated);
        assert_eq!(
            lifecycle.caches().list_store_names().await,
            vec!["soulscroll-v2".to_string()]
        );
        let (id, _) = page.wait_for_controller_change(Duration::from_secs(1)).await.unwrap();
        assert_eq!(id, v2.id());
    }

    #[tokio::test]
    async fn test_skip_waiting_twice_is_noop() {
        let (lifecycle, _) = lifecycle();
        lifecycle.register(config("1", false)).await.unwrap();
        let _page = lifecycle.connect(root()).await;
        let v2 = lifecycle.register(config("2", false)).await.unwrap();

        assert!(lifecycle.skip_waiting().await.unwrap());
        assert!(!lifecycle.skip_waiting().await.unwrap());
        let reply = lifecycle
            .post_message(ClientMessage::SkipWaiting, MessageTarget::Active)
            .await
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(lifecycle.active().await.unwrap().id(), v2.id());
        assert_eq!(v2.state(), ServiceWorkerState::Activated);
    }

    #[tokio::test]
    async fn test_last_client_closing_activates_waiting() {
        let (lifecycle, _) = lifecycle();
        lifecycle.register(config("1", false)).await.unwrap();
        let page = lifecycle.connect(root()).await;
        let v2 = lifecycle.register(config("2", false)).await.unwrap();

        lifecycle.client_disconnected(page.id()).await.unwrap();
        assert_eq!(lifecycle.active().await.unwrap().id(), v2.id());
    }

    #[tokio::test]
    async fn test_failed_registration_keeps_active() {
        let (lifecycle, server) = lifecycle();
        let v1 = lifecycle.register(config("1", true)).await.unwrap();

        server.up.store(false, Ordering::SeqCst);
        let err = lifecycle.register(config("2", true)).await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::InstallFailed { .. }));

        assert_eq!(lifecycle.active().await.unwrap().id(), v1.id());
        assert!(lifecycle.installing().await.is_none());
        assert_eq!(
            lifecycle.caches().list_store_names().await,
            vec!["soulscroll-v1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let (lifecycle, _) = lifecycle();
        let mut bad = config("1", true);
        bad.cache_prefix = String::new();
        assert!(matches!(
            lifecycle.register(bad).await,
            Err(ServiceWorkerError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_post_json_get_version() {
        let (lifecycle, _) = lifecycle();
        lifecycle.register(config("7", true)).await.unwrap();

        let reply = lifecycle
            .post_json(&serde_json::json!({ "type": "GET_VERSION" }), MessageTarget::Active)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply["type"], "VERSION_RESPONSE");
        assert_eq!(reply["version"], "7");

        let ignored = lifecycle
            .post_json(&serde_json::json!({ "type": "CLEAR_ALL" }), MessageTarget::Active)
            .await
            .unwrap();
        assert!(ignored.is_none());
    }

    #[tokio::test]
    async fn test_message_without_worker_is_not_found() {
        let (lifecycle, _) = lifecycle();
        assert!(matches!(
            lifecycle.post_message(ClientMessage::GetVersion, MessageTarget::Active).await,
            Err(ServiceWorkerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_without_worker_goes_to_network() {
        let (lifecycle, _) = lifecycle();
        let outcome = lifecycle
            .fetch(Request::get(root().join("/index.html").unwrap()))
            .await
            .unwrap();
        assert_eq!(outcome.source, ResponseSource::Network);
    }

    #[tokio::test]
    async fn test_dispatch_sync_backoff() {
        let (lifecycle, server) = lifecycle();
        lifecycle.register(config("1", true)).await.unwrap();
        lifecycle.register_sync("sync-journal-entries").await;

        server.up.store(false, Ordering::SeqCst);
        let outcomes = lifecycle.dispatch_sync().await;
        assert_eq!(
            outcomes,
            vec![(
                "sync-journal-entries".to_string(),
                SyncDisposition::RetryAfter(Duration::from_secs(30))
            )]
        );
        assert!(lifecycle.dispatch_sync().await.is_empty());

        server.up.store(true, Ordering::SeqCst);
        let outcomes = lifecycle.online().await;
        assert_eq!(outcomes[0].1, SyncDisposition::Completed);
        assert!(lifecycle.sync_tags().await.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_removes_own_stores() {
        let (lifecycle, _) = lifecycle();
        let worker = lifecycle.register(config("1", true)).await.unwrap();
        lifecycle
            .caches()
            .open(&StoreName::new("other-app", crate::cache::CacheVersion::new("1")))
            .await;

        assert_eq!(lifecycle.unregister().await, 1);
        assert_eq!(worker.state(), ServiceWorkerState::Redundant);
        assert!(lifecycle.active().await.is_none());
        assert_eq!(
            lifecycle.caches().list_store_names().await,
            vec!["other-app-v1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_push_without_worker_is_dropped() {
        let (lifecycle, _) = lifecycle();
        assert!(lifecycle.push(Some(b"{}")).await.is_none());
    }
}
