//! Dialog broker for backend-initiated interactive requests.
//!
//! Blocking dialogs are parked until the client answers, the dialog times
//! out, or the client goes away; in the last two cases the backend receives
//! the method's default reply.

mod broker;
mod types;

pub use broker::DialogBroker;
pub use types::{DialogConfig, DialogError, DialogOutcome, DialogWaiter, Resolution};
