//! Push payloads and the notifications they become.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use uncover_core::NotificationConfig;

/// Decoded push message. Every field is optional; unknown fields are kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,

    /// Push data that was JSON but not an object, kept verbatim.
    #[serde(skip)]
    pub raw: Option<Value>,
}

impl PushPayload {
    /// Decode push data. Missing or undecodable data yields an empty payload;
    /// JSON that is not an object is kept as [`PushPayload::raw`].
    pub fn parse(data: Option<&[u8]>) -> Self {
        let Some(data) = data else {
            return Self::default();
        };

        let value: Value = match serde_json::from_slice(data) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Push data is not JSON, using defaults");
                return Self::default();
            }
        };

        match serde_json::from_value(value.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Push data is not a JSON object, using defaults");
                Self {
                    raw: Some(value),
                    ..Self::default()
                }
            }
        }
    }
}

/// A notification shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub tag: String,
    pub require_interaction: bool,

    /// The push payload the notification was built from.
    pub data: Value,
}

impl Notification {
    /// Build a notification from a push payload, filling gaps from `config`.
    pub fn from_push(payload: PushPayload, config: &NotificationConfig) -> Self {
        let data = match payload.raw {
            Some(ref raw) => raw.clone(),
            None => serde_json::to_value(&payload).unwrap_or(Value::Null),
        };

        Self {
            id: format!("notification-{}", next_id()),
            title: payload.title.unwrap_or_else(|| config.app_name.clone()),
            body: payload.body.unwrap_or_else(|| config.default_body.clone()),
            icon: config.icon.clone(),
            badge: config.badge.clone(),
            vibrate: config.vibrate.clone(),
            tag: config.tag.clone(),
            require_interaction: config.require_interaction,
            data,
        }
    }
}

/// What a notification click did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    /// An open window at the root URL was focused.
    Focused(String),
    /// No such window existed; a new one was opened.
    Opened(String),
}

impl ClickOutcome {
    pub fn client_id(&self) -> &str {
        match self {
            ClickOutcome::Focused(id) | ClickOutcome::Opened(id) => id,
        }
    }
}

fn next_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}
