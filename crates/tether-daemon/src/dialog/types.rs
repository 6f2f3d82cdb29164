//! Dialog broker types.

use std::time::Duration;

use tether_proto::DialogReply;
use tokio::sync::oneshot;

/// Configuration for the dialog broker.
#[derive(Debug, Clone)]
pub struct DialogConfig {
    /// Time a blocking dialog waits for the client before its default applies.
    pub timeout: Duration,
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }
}

/// What ended a pending dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The client answered.
    Response,
    /// No answer within the dialog timeout.
    Timeout,
    /// Bulk-resolved because the client went away.
    Cancelled,
}

/// Final result of one dialog. Produced exactly once per registered id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogOutcome {
    pub id: String,
    pub method: String,
    pub resolution: Resolution,
    /// Reply to forward to the backend.
    pub reply: DialogReply,
}

/// Handle awaiting the outcome of a registered dialog.
#[derive(Debug)]
pub struct DialogWaiter {
    pub(super) id: String,
    pub(super) method: String,
    pub(super) default: DialogReply,
    pub(super) rx: oneshot::Receiver<DialogOutcome>,
}

impl DialogWaiter {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait for the dialog to resolve.
    ///
    /// If the broker is torn down with the dialog still pending, the default
    /// reply is returned as a cancellation.
    pub async fn wait(self) -> DialogOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => DialogOutcome {
                id: self.id,
                method: self.method,
                resolution: Resolution::Cancelled,
                reply: self.default,
            },
        }
    }
}

/// Dialog broker errors.
#[derive(Debug, thiserror::Error)]
pub enum DialogError {
    #[error("Dialog {id} is already pending")]
    DuplicateId { id: String },
}
