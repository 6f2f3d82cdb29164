//! Pending dialog table.
//!
//! Every dialog record is removed from the table under the lock by exactly
//! one of: a client response, its timer, or a bulk cancel. Whoever removes
//! the record resolves it; everyone else finds nothing and does nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tether_proto::{DialogKind, DialogMethodTable, DialogReply};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::{DialogConfig, DialogError, DialogOutcome, DialogWaiter, Resolution};

struct PendingDialog {
    /// Distinguishes re-registrations of the same id.
    serial: u64,
    method: String,
    default: DialogReply,
    resolver: oneshot::Sender<DialogOutcome>,
    timer: JoinHandle<()>,
}

impl PendingDialog {
    fn finish(self, id: String, resolution: Resolution, reply: DialogReply) {
        let outcome = DialogOutcome {
            id,
            method: self.method,
            resolution,
            reply,
        };
        if let Err(outcome) = self.resolver.send(outcome) {
            debug!(dialog_id = %outcome.id, "Dialog resolved with no waiter");
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<String, PendingDialog>>>;

/// Broker matching backend dialogs to client replies.
#[derive(Clone)]
pub struct DialogBroker {
    pending: PendingMap,
    config: DialogConfig,
    methods: Arc<DialogMethodTable>,
    next_serial: Arc<AtomicU64>,
}

impl DialogBroker {
    pub fn new(config: DialogConfig, methods: DialogMethodTable) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            config,
            methods: Arc::new(methods),
            next_serial: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Broker with the built-in method table and a 60s timeout.
    pub fn with_defaults() -> Self {
        Self::new(DialogConfig::default(), DialogMethodTable::default())
    }

    pub fn kind_of(&self, method: &str) -> DialogKind {
        self.methods.kind_of(method)
    }

    pub fn methods(&self) -> &DialogMethodTable {
        &self.methods
    }

    pub const fn config(&self) -> &DialogConfig {
        &self.config
    }

    /// Park a blocking dialog until it is answered, times out, or is
    /// cancelled.
    pub async fn register(
        &self,
        id: impl Into<String>,
        method: impl Into<String>,
    ) -> Result<DialogWaiter, DialogError> {
        let id = id.into();
        let method = method.into();
        let default = self.methods.default_reply(&method);

        let mut pending = self.pending.lock().await;
        if pending.contains_key(&id) {
            warn!(dialog_id = %id, %method, "Rejecting duplicate dialog id");
            return Err(DialogError::DuplicateId { id });
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (resolver, rx) = oneshot::channel();
        let timer = tokio::spawn(expire_after(
            Arc::clone(&self.pending),
            id.clone(),
            serial,
            self.config.timeout,
        ));
        pending.insert(
            id.clone(),
            PendingDialog {
                serial,
                method: method.clone(),
                default: default.clone(),
                resolver,
                timer,
            },
        );
        debug!(dialog_id = %id, %method, pending = pending.len(), "Registered dialog");

        Ok(DialogWaiter {
            id,
            method,
            default,
            rx,
        })
    }

    /// Resolve dialog `id` with the client's reply.
    ///
    /// Returns `false` if the dialog is unknown or already resolved.
    pub async fn handle_response(&self, id: &str, reply: DialogReply) -> bool {
        let Some(entry) = self.pending.lock().await.remove(id) else {
            debug!(dialog_id = %id, "Ignoring response for unknown dialog");
            return false;
        };
        entry.timer.abort();
        debug!(dialog_id = %id, method = %entry.method, "Dialog answered");
        entry.finish(id.to_string(), Resolution::Response, reply);
        true
    }

    /// Resolve every pending dialog with its default reply.
    pub async fn cancel_all(&self) -> usize {
        let drained: Vec<(String, PendingDialog)> = self.pending.lock().await.drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            entry.timer.abort();
            let reply = entry.default.clone();
            entry.finish(id, Resolution::Cancelled, reply);
        }
        if count > 0 {
            info!(count, "Cancelled pending dialogs");
        }
        count
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Ids of pending dialogs, sorted.
    pub async fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

async fn expire_after(pending: PendingMap, id: String, serial: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;

    let entry = {
        let mut pending = pending.lock().await;
        if pending.get(&id).is_some_and(|entry| entry.serial == serial) {
            pending.remove(&id)
        } else {
            None
        }
    };
    if let Some(entry) = entry {
        warn!(dialog_id = %id, method = %entry.method, "Dialog timed out, applying default reply");
        let reply = entry.default.clone();
        entry.finish(id, Resolution::Timeout, reply);
    }
}
