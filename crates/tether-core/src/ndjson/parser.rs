//! NDJSON parser for the backend protocol.
//!
//! Implements tolerant reader pattern: unknown fields and types pass through.

use serde_json::Value;

use tether_proto::methods::BACKEND_DIALOG_REQUEST;

use super::types::{BackendMessage, Classification};
use crate::error::{Error, Result};

/// Parse a single NDJSON line from the backend's stdout.
///
/// Blank lines, non-JSON noise and JSON values that are not objects are
/// errors; callers drop them.
pub fn parse_line(line: &str) -> Result<BackendMessage> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(Error::NdjsonParse("Empty line".into()));
    }
    let raw: Value = serde_json::from_str(trimmed)?;
    parse_value(raw)
}

/// Wrap a JSON value as a backend message.
pub fn parse_value(raw: Value) -> Result<BackendMessage> {
    match raw {
        Value::Object(map) => Ok(BackendMessage::from_map(map)),
        other => Err(Error::NdjsonParse(format!(
            "Expected JSON object, got {}",
            value_kind(&other)
        ))),
    }
}

/// Classify a backend message for routing.
///
/// * `is_pending` -- whether an internal request with this id is outstanding.
/// * `reserved_prefix` -- id namespace used for internal requests; an id in
///   this namespace that is no longer pending is a late response.
pub fn classify(
    msg: &BackendMessage,
    is_pending: impl Fn(&str) -> bool,
    reserved_prefix: &str,
) -> Classification {
    if let Some(id) = msg.id() {
        if is_pending(id) {
            return Classification::CorrelatedResponse { id: id.to_string() };
        }
        if !reserved_prefix.is_empty() && id.starts_with(reserved_prefix) {
            return Classification::Stale { id: id.to_string() };
        }
    }

    if msg.message_type() == Some(BACKEND_DIALOG_REQUEST)
        && let (Some(id), Some(method)) = (msg.id(), msg.method())
    {
        return Classification::DialogRequest {
            id: id.to_string(),
            method: method.to_string(),
        };
    }

    Classification::Event
}

const fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
