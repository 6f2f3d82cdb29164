//! Tether Wire Protocol
//!
//! Message schemas exchanged between a tether daemon and its (single) client,
//! plus the backend-side constants the daemon relies on.
//!
//! This crate contains:
//! - [`ClientMessage`] / [`ServerMessage`] envelopes (JSON text frames)
//! - [`ErrorCode`] for machine-readable protocol failures
//! - [`DialogMethodTable`] classifying backend-initiated interactive methods
//!
//! Versioning: [`PROTOCOL_VERSION`] only changes on a breaking structural or
//! semantic change. New optional fields and new backend event types are
//! additive and never require a bump; unknown fields are ignored on input.

mod messages;
pub mod methods;

pub use messages::*;
pub use methods::{DialogKind, DialogMethodTable};

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;
