//! A single service worker version.
//!
//! A [`ServiceWorker`] is built from one [`WorkerConfig`] and owns the store
//! named for its version. Every event handler is an `async fn`; awaiting it
//! is the "wait until settled" contract.

use std::sync::Arc;

use soulscroll_net::{Fetcher, Request};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::{CacheStorage, CacheVersion, StoreName};
use crate::clients::Clients;
use crate::config::WorkerConfig;
use crate::fetch::{FetchInterceptor, FetchOutcome};
use crate::message::{ClientMessage, MessageOutcome};
use crate::precache::precache;
use crate::push::{ClickAction, ClickOutcome, Notification, NotificationId, Notifications, PushPayload};
use crate::sync::replay_offline_entries;
use crate::{now_millis, Result, ServiceWorkerError, ServiceWorkerId, ServiceWorkerState};

/// Shared resources a worker runs against.
#[derive(Clone)]
pub struct WorkerContext {
    pub caches: Arc<CacheStorage>,
    pub clients: Arc<Clients>,
    pub notifications: Arc<Notifications>,
    pub fetcher: Arc<dyn Fetcher>,
}

/// A service worker instance.
pub struct ServiceWorker {
    id: ServiceWorkerId,
    config: Arc<WorkerConfig>,
    store: StoreName,
    ctx: WorkerContext,
    interceptor: FetchInterceptor,
    state: watch::Sender<ServiceWorkerState>,
}

impl ServiceWorker {
    pub fn new(config: WorkerConfig, ctx: WorkerContext) -> Self {
        let config = Arc::new(config);
        let interceptor = FetchInterceptor::new(config.clone(), ctx.caches.clone(), ctx.fetcher.clone());
        let (state, _) = watch::channel(ServiceWorkerState::Parsed);

        Self {
            id: ServiceWorkerId::new(),
            store: config.store_name(),
            config,
            ctx,
            interceptor,
            state,
        }
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn store_name(&self) -> &StoreName {
        &self.store
    }

    pub fn version(&self) -> &CacheVersion {
        self.store.version()
    }

    pub fn state(&self) -> ServiceWorkerState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<ServiceWorkerState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ServiceWorkerState) -> Result<()> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                debug!(worker = ?self.id, from = ?*state, to = ?next, "State change");
                *state = next;
                true
            } else {
                result = Err(ServiceWorkerError::StateError(format!(
                    "worker {:?} cannot go from {:?} to {:?}",
                    self.id, *state, next
                )));
                false
            }
        });
        result
    }

    /// Retire this worker. No-op if already redundant.
    pub fn mark_redundant(&self) {
        let _ = self.transition(ServiceWorkerState::Redundant);
    }

    // ==================== Lifecycle events ====================

    /// Precache the manifest into this version's store.
    ///
    /// On failure the worker becomes redundant and no store for the version
    /// is left behind.
    pub async fn install(&self) -> Result<usize> {
        self.transition(ServiceWorkerState::Installing)?;
        info!(worker = ?self.id, store = %self.store, "Installing");

        let result = async {
            let urls = self.config.precache.resolve(&self.config.origin)?;
            precache(&self.ctx.caches, self.ctx.fetcher.as_ref(), &self.store, urls).await
        }
        .await;

        match result {
            Ok(count) => {
                self.transition(ServiceWorkerState::Installed)?;
                info!(worker = ?self.id, count, "Installed");
                Ok(count)
            }
            Err(e) => {
                warn!(worker = ?self.id, error = %e, "Install failed");
                self.mark_redundant();
                Err(e)
            }
        }
    }

    /// Purge every other store, claim clients and announce the new version.
    ///
    /// Returns the names of the purged stores.
    pub async fn activate(&self) -> Result<Vec<String>> {
        self.transition(ServiceWorkerState::Activating)?;

        let current = self.store.to_string();
        let mut purged = Vec::new();
        for name in self.ctx.caches.list_store_names().await {
            if name == current || !self.ctx.caches.delete_store(&name).await {
                continue;
            }
            match StoreName::parse(&name) {
                Some(stale) => info!(store = %name, version = %stale.version(), "Purged stale store"),
                None => info!(store = %name, "Purged foreign store"),
            }
            purged.push(name);
        }

        let claimed = self.ctx.clients.claim(self.id, self.version()).await;
        let notified = self
            .ctx
            .clients
            .broadcast(ClientMessage::SwUpdated {
                version: self.version().clone(),
                timestamp: now_millis(),
            })
            .await;

        self.transition(ServiceWorkerState::Activated)?;
        info!(worker = ?self.id, version = %self.version(), claimed, notified, "Activated");
        Ok(purged)
    }

    // ==================== Functional events ====================

    /// Resolve an intercepted request.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchOutcome> {
        self.interceptor.handle(request).await
    }

    /// Handle a message from a page.
    pub fn handle_message(&self, message: ClientMessage) -> MessageOutcome {
        match message {
            ClientMessage::SkipWaiting if self.state() == ServiceWorkerState::Installed => {
                MessageOutcome::SkipWaiting
            }
            ClientMessage::SkipWaiting => {
                debug!(worker = ?self.id, state = ?self.state(), "SKIP_WAITING while not waiting");
                MessageOutcome::Ignored
            }
            ClientMessage::GetVersion => MessageOutcome::Reply(ClientMessage::VersionResponse {
                version: self.version().clone(),
                timestamp: now_millis(),
            }),
            other => {
                debug!(worker = ?self.id, kind = other.kind(), "Ignoring message");
                MessageOutcome::Ignored
            }
        }
    }

    /// Handle a background sync event. Unknown tags succeed without work.
    pub async fn handle_sync(&self, tag: &str) -> Result<()> {
        if !self.config.features.background_sync {
            debug!(tag, "Background sync disabled");
            return Ok(());
        }
        if tag != self.config.sync.tag {
            debug!(tag, "Ignoring unknown sync tag");
            return Ok(());
        }
        let endpoint = self.config.resolve(&self.config.sync.endpoint)?;
        replay_offline_entries(self.ctx.fetcher.as_ref(), tag, endpoint).await
    }

    /// Handle a push event. Returns the shown notification, if any.
    pub async fn handle_push(&self, data: Option<&[u8]>) -> Option<NotificationId> {
        if !self.config.features.push {
            debug!("Push disabled");
            return None;
        }
        let payload = PushPayload::parse(data);
        let notification = Notification::reflection_reminder(&self.config.notifications, payload);
        Some(self.ctx.notifications.show(notification).await)
    }

    /// Handle a click on a notification or one of its actions.
    pub async fn handle_notification_click(
        &self,
        id: NotificationId,
        action: Option<&str>,
    ) -> Result<ClickOutcome> {
        if self.ctx.notifications.close(id).await.is_none() {
            debug!(notification = ?id, "Clicked notification already closed");
        }

        match ClickAction::from_action(action) {
            ClickAction::Open => {
                let root = self.config.resolve("/")?;
                Ok(self.ctx.clients.focus_or_open(root, Some(self.id)).await.into())
            }
            ClickAction::Close | ClickAction::Other => Ok(ClickOutcome::Dismissed),
        }
    }
}

impl std::fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("store", &self.store.to_string())
            .field("state", &self.state())
            .finish()
    }
}
