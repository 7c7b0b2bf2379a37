//! Relay wire protocol.
//!
//! Two independent WebSocket populations speak JSON through the relay:
//! automation clients send CDP command envelopes and receive responses plus
//! unsolicited events; the single extension connection receives numbered
//! requests and answers with correlated replies, keepalive pongs, log
//! passthrough frames, and forwarded CDP events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client id used when the automation endpoint path carries none.
pub const DEFAULT_CLIENT_ID: &str = "default";

// ---------------------------------------------------------------
// Automation client <-> relay
// ---------------------------------------------------------------

/// A CDP command envelope from an automation client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCommand {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Relay -> client response, tagged with the originating command's id.
///
/// Exactly one of `result` / `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl CommandResponse {
    pub fn ok(id: i64, session_id: Option<String>, result: Value) -> Self {
        Self { id, session_id, result: Some(result), error: None }
    }

    pub fn err(id: i64, session_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            session_id,
            result: None,
            error: Some(ErrorShape { message: message.into() }),
        }
    }
}

/// Error shape carried in response frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub message: String,
}

/// Relay -> client unsolicited CDP event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub params: Value,
}

// ---------------------------------------------------------------
// Relay <-> extension
// ---------------------------------------------------------------

/// Relay -> extension numbered request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionRequest {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

/// Any frame the extension can send.
///
/// The wire format is untagged: replies carry an `id`, everything else is a
/// method-keyed notification.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExtensionFrame {
    Reply(ExtensionReply),
    Notification(ExtensionNotification),
}

/// Extension reply correlated to an [`ExtensionRequest`] by id.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionReply {
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl ExtensionReply {
    /// Pull a human-readable message out of the extension's error payload,
    /// which may be `{message}` or a bare string.
    pub fn error_message(&self) -> Option<String> {
        let error = self.error.as_ref()?;
        if let Some(msg) = error.get("message").and_then(Value::as_str) {
            return Some(msg.to_string());
        }
        if let Some(msg) = error.as_str() {
            return Some(msg.to_string());
        }
        Some(error.to_string())
    }
}

/// Non-reply extension frame: `pong`, `log`, or `forwardCDPEvent`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionNotification {
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// Payload of a `forwardCDPEvent` notification.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedEvent {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub session_id: Option<String>,
}

// ---------------------------------------------------------------
// Static capability descriptor
// ---------------------------------------------------------------

/// Answer for `Browser.getVersion` and the `/version` HTTP route.
///
/// The relay fronts a live browser it cannot interrogate at upgrade time, so
/// the descriptor is fixed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionDescriptor {
    pub protocol_version: String,
    pub product: String,
    pub user_agent: String,
    pub js_version: String,
}

impl Default for VersionDescriptor {
    fn default() -> Self {
        Self {
            protocol_version: "1.3".into(),
            product: format!("Chrome/TabRelay-{}", env!("CARGO_PKG_VERSION")),
            user_agent: format!("TabRelay/{}", env!("CARGO_PKG_VERSION")),
            js_version: "V8".into(),
        }
    }
}
