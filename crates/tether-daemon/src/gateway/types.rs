//! Session gateway types.

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tether_proto::{ErrorCode, PROTOCOL_VERSION, ServerMessage};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::subprocess::SupervisorError;

/// Id namespace for requests the gateway issues to the backend itself.
pub const GATEWAY_REQUEST_PREFIX: &str = "gateway:";

/// Configuration for the session gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Stable session identifier reported in `welcome`.
    pub server_id: String,
    /// Timeout for internal requests to the backend.
    pub request_timeout: Duration,
    /// Backend command returning the full session state.
    pub state_command: String,
    /// Backend command returning the full message history.
    pub history_command: String,
    /// Client silence tolerated before the connection is dropped.
    pub idle_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server_id: uuid::Uuid::new_v4().to_string(),
            request_timeout: Duration::from_secs(10),
            state_command: "get_state".to_string(),
            history_command: "get_messages".to_string(),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Identifies one client connection for the lifetime of the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Instruction for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(ServerMessage),
    /// Flush and close the connection.
    Close,
}

/// The gateway's handle on a connected client.
#[derive(Debug, Clone)]
pub(crate) struct ClientHandle {
    pub conn: ConnectionId,
    /// `clientId` from the hello, once received.
    pub client_id: Option<String>,
    pub outbound: mpsc::Sender<Outbound>,
}

impl ClientHandle {
    /// Queue `frame` for the writer without waiting.
    ///
    /// Returns `false` when the queue is full or the writer is gone; the
    /// caller must then release the client.
    pub fn offer(&self, frame: ServerMessage) -> bool {
        match self.outbound.try_send(Outbound::Frame(frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(conn = %self.conn, "Client outbound queue full");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(conn = %self.conn, "Client writer gone");
                false
            }
        }
    }

    /// Ask the writer to close once queued frames are flushed. A full queue
    /// is left to close when the handle is dropped.
    pub fn close(&self) {
        let _ = self.outbound.try_send(Outbound::Close);
    }

    /// Backend events that can be held back during a handshake: the queue
    /// must still fit them behind the welcome.
    pub fn backlog_limit(&self) -> usize {
        self.outbound.max_capacity().saturating_sub(1)
    }
}

/// Occupancy of the single client slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Vacant,
    Handshaking(ConnectionId),
    Active(ConnectionId),
}

/// Errors from slot management.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Session already has a connected client")]
    SlotOccupied,

    #[error("Backend has exited")]
    BackendGone,
}

impl GatewayError {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::SlotOccupied => ErrorCode::SessionUnavailable,
            Self::BackendGone => ErrorCode::BackendFault,
        }
    }
}

/// Errors from internal correlated requests to the backend.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Failed to send {command} to backend: {source}")]
    Send {
        command: String,
        #[source]
        source: SupervisorError,
    },

    #[error("Backend did not answer {command} within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Backend rejected {command}: {error}")]
    Rejected { command: String, error: String },

    #[error("Backend exited before answering {command}")]
    BackendExited { command: String },
}

/// Reasons a handshake fails. Each maps to a wire [`ErrorCode`].
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("First frame must be a hello message")]
    NotHello,

    #[error("Malformed hello: {0}")]
    Malformed(String),

    #[error("Protocol version {client} is not supported (server speaks {})", PROTOCOL_VERSION)]
    IncompatibleProtocol { client: Value },

    #[error("Failed to fetch session snapshot: {0}")]
    Snapshot(#[from] RequestError),

    #[error("More than {limit} backend events arrived during the handshake")]
    Backlog { limit: usize },

    #[error("Connection {0} no longer holds the session")]
    Detached(ConnectionId),
}

impl HandshakeError {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotHello | Self::Malformed(_) => ErrorCode::InvalidHandshake,
            Self::IncompatibleProtocol { .. } => ErrorCode::IncompatibleProtocol,
            Self::Snapshot(_) | Self::Backlog { .. } => ErrorCode::BackendFault,
            Self::Detached(_) => ErrorCode::SessionUnavailable,
        }
    }

    /// The `error` frame reported to the client.
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Error {
            code: self.code(),
            message: self.to_string(),
            server_version: matches!(self, Self::IncompatibleProtocol { .. })
                .then_some(PROTOCOL_VERSION),
        }
    }
}
