//! Backend-side message types and the dialog method table.
//!
//! The backend initiates interactive UI requests with
//! `{"type": "extension_ui_request", "id": ..., "method": ..., ...}`. Some
//! methods are notifications that expect no reply; the rest block the
//! backend until an `extension_ui_response` with the same `id` arrives.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::DialogReply;

/// `type` of a backend-initiated interactive request.
pub const BACKEND_DIALOG_REQUEST: &str = "extension_ui_request";

/// `type` of the reply written back to the backend.
pub const BACKEND_DIALOG_RESPONSE: &str = "extension_ui_response";

/// `type` of a backend response to a correlated command.
pub const BACKEND_RESPONSE: &str = "response";

/// Methods that only update client-side presentation.
const FIRE_AND_FORGET: &[&str] = &["notify", "setStatus", "setWidget", "setTitle", "set_editor_text"];

/// How a backend dialog method is brokered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogKind {
    /// Forwarded to the client; no reply is sent to the backend.
    FireAndForget,
    /// Registered and forwarded; the backend waits for a reply. `default` is
    /// what a declining user would answer, used on timeout or disconnect.
    Blocking { default: DialogReply },
}

/// Data table mapping backend dialog methods to their [`DialogKind`].
#[derive(Debug, Clone)]
pub struct DialogMethodTable {
    entries: HashMap<String, DialogKind>,
}

impl Default for DialogMethodTable {
    fn default() -> Self {
        let table = Self {
            entries: HashMap::new(),
        };
        let table = FIRE_AND_FORGET
            .iter()
            .fold(table, |t, method| t.with_fire_and_forget(*method));
        table
            .with_blocking("select", DialogReply::cancelled())
            .with_blocking("confirm", DialogReply::declined())
            .with_blocking("input", DialogReply::cancelled())
            .with_blocking("editor", DialogReply::cancelled())
    }
}

impl DialogMethodTable {
    /// Register (or override) a notification-style method.
    #[must_use]
    pub fn with_fire_and_forget(mut self, method: impl Into<String>) -> Self {
        self.entries.insert(method.into(), DialogKind::FireAndForget);
        self
    }

    /// Register (or override) a blocking method with its default reply.
    #[must_use]
    pub fn with_blocking(mut self, method: impl Into<String>, default: DialogReply) -> Self {
        self.entries
            .insert(method.into(), DialogKind::Blocking { default });
        self
    }

    /// Classify a method. Unknown methods block with `{cancelled: true}`
    /// so the backend always gets an answer.
    pub fn kind_of(&self, method: &str) -> DialogKind {
        self.entries
            .get(method)
            .cloned()
            .unwrap_or(DialogKind::Blocking {
                default: DialogReply::cancelled(),
            })
    }

    /// Default reply for `method` (`{cancelled: true}` for non-blocking or
    /// unknown methods).
    pub fn default_reply(&self, method: &str) -> DialogReply {
        match self.kind_of(method) {
            DialogKind::Blocking { default } => default,
            DialogKind::FireAndForget => DialogReply::cancelled(),
        }
    }

    pub fn is_known(&self, method: &str) -> bool {
        self.entries.contains_key(method)
    }
}

/// Build the JSON object sent back to the backend to answer dialog `id`.
pub fn backend_dialog_response(id: &str, reply: &DialogReply) -> Value {
    let mut obj = Map::new();
    obj.insert("type".into(), Value::String(BACKEND_DIALOG_RESPONSE.into()));
    obj.insert("id".into(), Value::String(id.to_string()));
    if let Some(value) = &reply.value {
        obj.insert("value".into(), value.clone());
    }
    if let Some(confirmed) = reply.confirmed {
        obj.insert("confirmed".into(), Value::Bool(confirmed));
    }
    if let Some(cancelled) = reply.cancelled {
        obj.insert("cancelled".into(), Value::Bool(cancelled));
    }
    Value::Object(obj)
}
