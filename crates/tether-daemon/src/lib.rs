//! Tether Daemon Library
//!
//! Core functionality for the tether daemon:
//! - Supervision of the backend agent process (NDJSON over stdio)
//! - Dialog brokering for backend-initiated interactive requests
//! - The session gateway relaying one client to the backend
//! - WebSocket transport for client connections

pub mod dialog;
pub mod gateway;
pub mod server;
pub mod subprocess;
