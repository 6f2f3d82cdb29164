//! `Tether` Core Library
//!
//! Shared functionality for the tether daemon:
//! - NDJSON parsing and classification of backend output lines
//! - Settings resolution and hierarchy
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod ndjson;
pub mod tracing_init;

pub use config::Settings;
pub use error::{Error, Result};
