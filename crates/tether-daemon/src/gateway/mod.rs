//! Session gateway relaying one client to the supervised backend.
//!
//! Handles the client slot, the hello/welcome handshake with snapshot
//! resync, sequencing of backend events and correlation of the gateway's
//! own backend requests.

mod session;
mod types;

pub use session::SessionGateway;
pub use types::{
    ConnectionId, GATEWAY_REQUEST_PREFIX, GatewayConfig, GatewayError, HandshakeError, Outbound,
    RequestError, SlotState,
};
