//! Page ↔ worker message protocol.
//!
//! Envelopes are JSON objects tagged by `type`. Anything outside the known
//! set decodes to [`ClientMessage::Unknown`] and is ignored by handlers.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::cache::CacheVersion;

/// A message exchanged between a page and the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Page → worker: activate now.
    SkipWaiting,
    /// Page → worker: report your version.
    GetVersion,
    /// Worker → page: reply to `GET_VERSION`.
    VersionResponse { version: CacheVersion, timestamp: u64 },
    /// Worker → pages: a new version took control.
    SwUpdated { version: CacheVersion, timestamp: u64 },
    /// Worker → pages: a new version is installed and waiting.
    SwUpdateAvailable { version: CacheVersion, timestamp: u64 },
    /// Any other `type`.
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Decode an envelope. Malformed input decodes to `Unknown`.
    pub fn from_json(value: &JsonValue) -> Self {
        serde_json::from_value(value.clone()).unwrap_or(Self::Unknown)
    }

    /// Decode raw JSON text. Malformed input decodes to `Unknown`.
    pub fn from_json_str(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or(Self::Unknown)
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    /// The wire `type` string.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SkipWaiting => "SKIP_WAITING",
            Self::GetVersion => "GET_VERSION",
            Self::VersionResponse { .. } => "VERSION_RESPONSE",
            Self::SwUpdated { .. } => "SW_UPDATED",
            Self::SwUpdateAvailable { .. } => "SW_UPDATE_AVAILABLE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// What a worker wants done after handling a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Send this back on the reply port.
    Reply(ClientMessage),
    /// Leave the waiting state.
    SkipWaiting,
    /// Nothing to do.
    Ignored,
}
