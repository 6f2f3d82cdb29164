//! Client ↔ server envelopes.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opening frame every client must send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub protocol_version: u32,
    pub client_id: String,
    /// Last sequence number the client saw. Accepted for forward
    /// compatibility; handshakes always resync from a full snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seq: Option<u64>,
}

/// Reply body for a backend dialog.
///
/// Shared by client `dialog-response` frames and the reply the daemon writes
/// back to the backend. Exactly which field is meaningful depends on the
/// dialog method (`value` for select/input/editor, `confirmed` for confirm).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<bool>,
}

impl DialogReply {
    /// `{cancelled: true}`: the user dismissed the dialog.
    pub const fn cancelled() -> Self {
        Self {
            value: None,
            confirmed: None,
            cancelled: Some(true),
        }
    }

    /// `{confirmed: false}`: the user declined a confirmation.
    pub const fn declined() -> Self {
        Self {
            value: None,
            confirmed: Some(false),
            cancelled: None,
        }
    }

    /// `{confirmed: <confirmed>}`.
    pub const fn confirmed(confirmed: bool) -> Self {
        Self {
            value: None,
            confirmed: Some(confirmed),
            cancelled: None,
        }
    }

    /// `{value: <value>}`.
    pub fn value(value: impl Into<Value>) -> Self {
        Self {
            value: Some(value.into()),
            confirmed: None,
            cancelled: None,
        }
    }
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Hello(Hello),
    /// Opaque backend command, relayed verbatim.
    Command { payload: Value },
    DialogResponse {
        id: String,
        #[serde(flatten)]
        reply: DialogReply,
    },
    Ping,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Welcome {
        protocol_version: u32,
        server_id: String,
        state: Value,
        history: Value,
        /// Sequence counter at handshake time; live events continue from
        /// `current_seq + 1`.
        current_seq: u64,
    },
    Event {
        seq: u64,
        payload: Value,
    },
    DialogRequest {
        seq: u64,
        id: String,
        method: String,
        /// Remaining backend fields (title, options, placeholder, ...).
        #[serde(flatten)]
        fields: Map<String, Value>,
    },
    Pong,
    #[serde(rename_all = "camelCase")]
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_version: Option<u32>,
    },
}

impl ServerMessage {
    /// Build an `error` frame without a server version.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            server_version: None,
        }
    }

    /// Sequence number carried by this frame, if any.
    pub const fn seq(&self) -> Option<u64> {
        match self {
            Self::Event { seq, .. } | Self::DialogRequest { seq, .. } => Some(*seq),
            _ => None,
        }
    }
}

/// Machine-readable protocol error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    IncompatibleProtocol,
    InvalidHandshake,
    SessionUnavailable,
    BackendFault,
    DialogTimeout,
    Internal,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IncompatibleProtocol => "IncompatibleProtocol",
            Self::InvalidHandshake => "InvalidHandshake",
            Self::SessionUnavailable => "SessionUnavailable",
            Self::BackendFault => "BackendFault",
            Self::DialogTimeout => "DialogTimeout",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hello_parses_camel_case_fields() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "hello",
            "protocolVersion": 1,
            "clientId": "tui-1",
            "lastSeq": 17
        }))
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Hello(Hello {
                protocol_version: 1,
                client_id: "tui-1".into(),
                last_seq: Some(17),
            })
        );
    }

    #[test]
    fn hello_ignores_unknown_fields() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "hello",
            "protocolVersion": 1,
            "clientId": "tui-1",
            "capabilities": ["color"]
        }))
        .unwrap();
        assert!(matches!(msg, ClientMessage::Hello(h) if h.last_seq.is_none()));
    }

    #[test]
    fn dialog_response_flattens_reply() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "dialog-response",
            "id": "d1",
            "confirmed": true
        }))
        .unwrap();
        match msg {
            ClientMessage::DialogResponse { id, reply } => {
                assert_eq!(id, "d1");
                assert_eq!(reply, DialogReply::confirmed(true));
            }
            other => panic!("expected dialog-response, got {other:?}"),
        }
    }

    #[test]
    fn command_payload_is_kept_verbatim() {
        let payload = json!({"type": "prompt", "message": "hi", "nested": {"a": [1, 2]}});
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "command", "payload": payload.clone()})).unwrap();
        assert_eq!(msg, ClientMessage::Command { payload });
    }

    #[test]
    fn welcome_serializes_camel_case() {
        let frame = ServerMessage::Welcome {
            protocol_version: 1,
            server_id: "srv".into(),
            state: json!({"model": "m"}),
            history: json!([]),
            current_seq: 0,
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "type": "welcome",
                "protocolVersion": 1,
                "serverId": "srv",
                "state": {"model": "m"},
                "history": [],
                "currentSeq": 0
            })
        );
    }

    #[test]
    fn dialog_request_inlines_backend_fields() {
        let mut fields = Map::new();
        fields.insert("title".into(), json!("Pick one"));
        fields.insert("options".into(), json!(["a", "b"]));
        let frame = ServerMessage::DialogRequest {
            seq: 4,
            id: "d1".into(),
            method: "select".into(),
            fields,
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "type": "dialog-request",
                "seq": 4,
                "id": "d1",
                "method": "select",
                "title": "Pick one",
                "options": ["a", "b"]
            })
        );
        assert_eq!(frame.seq(), Some(4));
    }

    #[test]
    fn error_omits_missing_server_version() {
        let frame = ServerMessage::error(ErrorCode::InvalidHandshake, "expected hello");
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "error", "code": "InvalidHandshake", "message": "expected hello"})
        );
    }

    #[test]
    fn incompatible_error_carries_server_version() {
        let frame = ServerMessage::Error {
            code: ErrorCode::IncompatibleProtocol,
            message: "version mismatch".into(),
            server_version: Some(1),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["serverVersion"], json!(1));
        assert_eq!(value["code"], json!("IncompatibleProtocol"));
    }
}
