//! Clients API: the pages a worker can see and talk to.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hashbrown::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};
use url::Url;

use crate::cache::CacheVersion;
use crate::message::ClientMessage;
use crate::{Result, ServiceWorkerError, ServiceWorkerId};

/// Unique identifier for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Something delivered to a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// `postMessage` from the worker.
    Message(ClientMessage),
    /// A different worker now controls this page.
    ControllerChange {
        worker: ServiceWorkerId,
        version: CacheVersion,
    },
}

/// Snapshot of a client as the worker sees it.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    pub focused: bool,
    pub controller: Option<ServiceWorkerId>,
}

struct ClientSlot {
    client: Client,
    tx: mpsc::UnboundedSender<ClientEvent>,
}

/// Page-side end of a client connection.
#[derive(Debug)]
pub struct ClientHandle {
    id: ClientId,
    url: Url,
    rx: mpsc::UnboundedReceiver<ClientEvent>,
    pending: VecDeque<ClientEvent>,
}

impl ClientHandle {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Next event, waiting if none is queued.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        match self.pending.pop_front() {
            Some(event) => Some(event),
            None => self.rx.recv().await,
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<ClientEvent> {
        self.pending.pop_front().or_else(|| self.rx.try_recv().ok())
    }

    /// Wait until this page's controller changes.
    ///
    /// Other events seen meanwhile stay queued for [`recv`](Self::recv).
    pub async fn wait_for_controller_change(
        &mut self,
        timeout: Duration,
    ) -> Result<(ServiceWorkerId, CacheVersion)> {
        if let Some(pos) = self
            .pending
            .iter()
            .position(|e| matches!(e, ClientEvent::ControllerChange { .. }))
        {
            if let Some(ClientEvent::ControllerChange { worker, version }) = self.pending.remove(pos) {
                return Ok((worker, version));
            }
        }

        let wait = async {
            while let Some(event) = self.rx.recv().await {
                match event {
                    ClientEvent::ControllerChange { worker, version } => return Ok((worker, version)),
                    other => self.pending.push_back(other),
                }
            }
            Err(ServiceWorkerError::StateError("client connection closed".into()))
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ServiceWorkerError::Timeout(timeout))?
    }
}

/// What a notification click did to the window list.
#[derive(Debug)]
pub enum WindowAction {
    /// An existing window was focused.
    Focused(ClientId),
    /// A new window was opened.
    Opened(ClientHandle),
}

/// All clients in the worker's scope.
#[derive(Default)]
pub struct Clients {
    slots: RwLock<HashMap<ClientId, ClientSlot>>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a page. `controller` is the worker active when it loaded.
    pub async fn connect(&self, url: Url, controller: Option<ServiceWorkerId>) -> ClientHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ClientId::new();
        let client = Client {
            id,
            url: url.clone(),
            focused: false,
            controller,
        };
        debug!(client = ?id, url = %url, "Client connected");
        self.slots.write().await.insert(id, ClientSlot { client, tx });

        ClientHandle {
            id,
            url,
            rx,
            pending: VecDeque::new(),
        }
    }

    /// Remove a client.
    pub async fn disconnect(&self, id: ClientId) -> bool {
        self.slots.write().await.remove(&id).is_some()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    /// Get a client by ID.
    pub async fn get(&self, id: ClientId) -> Option<Client> {
        self.slots.read().await.get(&id).map(|s| s.client.clone())
    }

    /// Make `worker` the controller of every client.
    ///
    /// Clients whose controller actually changes get a `ControllerChange`.
    pub async fn claim(&self, worker: ServiceWorkerId, version: &CacheVersion) -> usize {
        let mut slots = self.slots.write().await;
        let mut changed = 0;
        for slot in slots.values_mut() {
            if slot.client.controller == Some(worker) {
                continue;
            }
            slot.client.controller = Some(worker);
            let event = ClientEvent::ControllerChange {
                worker,
                version: version.clone(),
            };
            if slot.tx.send(event).is_ok() {
                changed += 1;
            }
        }
        debug!(worker = ?worker, changed, "Clients claimed");
        changed
    }

    /// Send a message to every client. Clients that went away are dropped.
    pub async fn broadcast(&self, message: ClientMessage) -> usize {
        let mut slots = self.slots.write().await;
        slots.retain(|id, slot| {
            let delivered = slot.tx.send(ClientEvent::Message(message.clone())).is_ok();
            if !delivered {
                trace!(client = ?id, "Dropping closed client");
            }
            delivered
        });
        slots.len()
    }

    /// Focus a window already showing `url`, or open a new one.
    pub async fn focus_or_open(&self, url: Url, controller: Option<ServiceWorkerId>) -> WindowAction {
        {
            let mut slots = self.slots.write().await;
            let target = slots
                .values()
                .find(|s| s.client.url == url)
                .map(|s| s.client.id);

            if let Some(target) = target {
                for slot in slots.values_mut() {
                    slot.client.focused = slot.client.id == target;
                }
                return WindowAction::Focused(target);
            }
        }

        let handle = self.connect(url, controller).await;
        let mut slots = self.slots.write().await;
        for slot in slots.values_mut() {
            slot.client.focused = slot.client.id == handle.id;
        }
        WindowAction::Opened(handle)
    }
}
