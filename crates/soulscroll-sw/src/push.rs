//! Push notifications.
//!
//! Push handling never fails: a missing or unreadable payload is treated as
//! `{}` and the notification is shown with the default copy.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::clients::{ClientId, WindowAction};
use crate::config::NotificationConfig;
use crate::now_millis;

/// Unique identifier for a shown notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationId(u64);

impl NotificationId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Fields we read from a push payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PushPayload {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl PushPayload {
    /// Decode push data. Absent, non-JSON, or wrongly-typed data yields the
    /// empty payload.
    pub fn parse(data: Option<&[u8]>) -> Self {
        let Some(data) = data else {
            return Self::default();
        };
        match serde_json::from_slice::<JsonValue>(data) {
            Ok(value @ JsonValue::Object(_)) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!(error = %e, "Push payload has unexpected fields, using defaults");
                Self::default()
            }),
            Ok(_) => Self::default(),
            Err(e) => {
                warn!(error = %e, "Push payload is not JSON, using defaults");
                Self::default()
            }
        }
    }
}

/// A notification button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
    pub icon: String,
}

/// Extra data attached to a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    pub date_of_arrival: u64,
    pub primary_key: u64,
}

/// A notification as displayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub data: NotificationData,
    pub actions: Vec<NotificationAction>,
}

impl Notification {
    /// Build the reflection reminder for a payload.
    pub fn reflection_reminder(config: &NotificationConfig, payload: PushPayload) -> Self {
        Self {
            id: NotificationId::new(),
            title: payload.title.unwrap_or_else(|| config.title.clone()),
            body: payload.body.unwrap_or_else(|| config.default_body.clone()),
            icon: config.icon.clone(),
            badge: config.badge.clone(),
            vibrate: config.vibrate.clone(),
            data: NotificationData {
                date_of_arrival: now_millis(),
                primary_key: 1,
            },
            actions: vec![
                NotificationAction {
                    action: "open".to_string(),
                    title: format!("Open {}", config.title),
                    icon: "/icons/checkmark.png".to_string(),
                },
                NotificationAction {
                    action: "close".to_string(),
                    title: "Close".to_string(),
                    icon: "/icons/xmark.png".to_string(),
                },
            ],
        }
    }
}

/// What the user did with a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickAction {
    Open,
    Close,
    Other,
}

impl ClickAction {
    /// No action (body click) counts as "open".
    pub fn from_action(action: Option<&str>) -> Self {
        match action {
            None | Some("") | Some("open") => Self::Open,
            Some("close") => Self::Close,
            Some(_) => Self::Other,
        }
    }
}

/// Result of handling a notification click.
#[derive(Debug)]
pub enum ClickOutcome {
    /// Notification closed, nothing else.
    Dismissed,
    /// An existing window was focused.
    Focused(ClientId),
    /// A new window was opened.
    Opened(crate::clients::ClientHandle),
}

impl From<WindowAction> for ClickOutcome {
    fn from(action: WindowAction) -> Self {
        match action {
            WindowAction::Focused(id) => Self::Focused(id),
            WindowAction::Opened(handle) => Self::Opened(handle),
        }
    }
}

/// Notifications currently on screen.
#[derive(Debug, Default)]
pub struct Notifications {
    shown: RwLock<Vec<Notification>>,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Display a notification.
    pub async fn show(&self, notification: Notification) -> NotificationId {
        let id = notification.id;
        debug!(id = ?id, title = %notification.title, "Showing notification");
        self.shown.write().await.push(notification);
        id
    }

    /// Dismiss a notification.
    pub async fn close(&self, id: NotificationId) -> Option<Notification> {
        let mut shown = self.shown.write().await;
        let pos = shown.iter().position(|n| n.id == id)?;
        Some(shown.remove(pos))
    }

    /// All notifications on screen, oldest first.
    pub async fn get_all(&self) -> Vec<Notification> {
        self.shown.read().await.clone()
    }
}
