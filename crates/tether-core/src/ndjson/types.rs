//! Message types for the backend NDJSON protocol.

use serde_json::{Map, Value};

/// One JSON object read from the backend's stdout.
///
/// The payload is kept verbatim; accessors only peek at the routing fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendMessage {
    raw: Map<String, Value>,
}

impl BackendMessage {
    pub const fn from_map(raw: Map<String, Value>) -> Self {
        Self { raw }
    }

    /// The `type` discriminant, if present and a string.
    pub fn message_type(&self) -> Option<&str> {
        self.raw.get("type").and_then(Value::as_str)
    }

    /// The `id` field, if present and a string.
    pub fn id(&self) -> Option<&str> {
        self.raw.get("id").and_then(Value::as_str)
    }

    /// The `method` field, if present and a string.
    pub fn method(&self) -> Option<&str> {
        self.raw.get("method").and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.raw
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.raw
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.raw)
    }
}

/// Backend answer to a correlated command (`{"type":"response", ...}`).
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatedResponse {
    pub id: String,
    /// Echo of the command name, when the backend includes it.
    pub command: Option<String>,
    pub success: bool,
    pub data: Value,
    pub error: Option<String>,
}

impl CorrelatedResponse {
    /// Extract the response fields. Returns `None` when the message has no id.
    ///
    /// A missing `success` flag counts as success; a missing `data` is `null`.
    pub fn from_message(msg: &BackendMessage) -> Option<Self> {
        let id = msg.id()?.to_string();
        Some(Self {
            id,
            command: msg
                .get("command")
                .and_then(Value::as_str)
                .map(String::from),
            success: msg
                .get("success")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            data: msg.get("data").cloned().unwrap_or(Value::Null),
            error: msg.get("error").and_then(Value::as_str).map(String::from),
        })
    }
}

/// Routing decision for one backend message, in priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Answers an internal request that is still pending; consumed internally.
    CorrelatedResponse { id: String },
    /// Answers an internal request that already timed out; discarded.
    Stale { id: String },
    /// Backend-initiated interactive request.
    DialogRequest { id: String, method: String },
    /// Anything else: forwarded to the client as an event.
    Event,
}
