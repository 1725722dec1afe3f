//! Control messages posted by the application.
//!
//! Wire format: `{ "type": "SKIP_WAITING" | "CLEAR_CACHE" | "CACHE_URLS",
//! "payload"?: [url, ...] }`.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::{Result, ServiceWorkerError};

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Activate a waiting worker now.
    SkipWaiting,
    /// Delete every named store.
    ClearCache,
    /// Best-effort caching of these URLs into the current store.
    CacheUrls(Vec<String>),
    /// Anything else; logged and ignored.
    Unknown(String),
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<Value>,
}

impl ControlMessage {
    /// Decode a message. Only malformed JSON or a missing `type` is an error;
    /// unrecognised types decode to [`ControlMessage::Unknown`].
    pub fn parse(raw: &str) -> Result<Self> {
        let message: RawMessage = serde_json::from_str(raw)
            .map_err(|e| ServiceWorkerError::InvalidMessage(e.to_string()))?;
        Ok(Self::from_parts(message.kind, message.payload))
    }

    fn from_parts(kind: String, payload: Option<Value>) -> Self {
        match kind.as_str() {
            "SKIP_WAITING" => Self::SkipWaiting,
            "CLEAR_CACHE" => Self::ClearCache,
            "CACHE_URLS" => Self::CacheUrls(urls_from_payload(payload)),
            _ => Self::Unknown(kind),
        }
    }
}

fn urls_from_payload(payload: Option<Value>) -> Vec<String> {
    match payload {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(url) => Some(url),
                other => {
                    warn!(item = %other, "Ignoring non-string URL in CACHE_URLS");
                    None
                }
            })
            .collect(),
        Some(Value::Null) | None => {
            warn!("CACHE_URLS without payload");
            Vec::new()
        }
        Some(other) => {
            warn!(payload = %other, "CACHE_URLS payload is not a list");
            Vec::new()
        }
    }
}
