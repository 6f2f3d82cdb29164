//! NDJSON handling for the backend's line protocol.
//!
//! Each stdout line of the backend is one JSON object. This module parses
//! lines into [`BackendMessage`]s and classifies them for routing,
//! implementing a tolerant reader pattern: unknown fields and unknown
//! message types pass through untouched.

mod parser;
mod types;

pub use parser::{classify, parse_line, parse_value};
pub use types::*;
