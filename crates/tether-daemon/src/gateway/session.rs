//! The session gateway: one backend, at most one client.
//!
//! Backend output is classified in priority order: answers to the gateway's
//! own requests are consumed, dialog requests go through the
//! [`DialogBroker`], and everything else is delivered to the active client
//! with the next sequence number. With no client, events are dropped and
//! blocking dialogs are answered with their default at once. While a client
//! is handshaking, events newer than its snapshot are held back and
//! streamed right after the welcome.
//!
//! Frames are queued with `try_send` and never awaited under the state lock.
//! A client whose queue is full is released like a disconnect, so the
//! backend pump never waits on a client socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde_json::{Map, Value, json};
use tether_core::ndjson::{self, BackendMessage, Classification, CorrelatedResponse};
use tether_proto::methods::backend_dialog_response;
use tether_proto::{
    ClientMessage, DialogKind, DialogReply, ErrorCode, Hello, PROTOCOL_VERSION, ServerMessage,
};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::types::{
    ClientHandle, ConnectionId, GATEWAY_REQUEST_PREFIX, GatewayConfig, GatewayError,
    HandshakeError, Outbound, RequestError, SlotState,
};
use crate::dialog::{DialogBroker, DialogOutcome, Resolution};
use crate::subprocess::{BackendEvent, BackendSender, ExitReport};

const CLIENT_STALLED: &str = "client cannot take frames";

/// Client slot plus the sequence counter, guarded together so that a
/// sequence number is only consumed by a frame the active client receives.
#[derive(Debug)]
struct SessionState {
    slot: Slot,
    seq: u64,
    next_conn: u64,
}

#[derive(Debug)]
enum Slot {
    Vacant,
    Handshaking(Handshake),
    Active(ClientHandle),
}

impl Slot {
    const fn conn(&self) -> Option<ConnectionId> {
        match self {
            Self::Vacant => None,
            Self::Handshaking(handshake) => Some(handshake.client.conn),
            Self::Active(client) => Some(client.conn),
        }
    }

    fn active(&self) -> Option<&ClientHandle> {
        match self {
            Self::Active(client) => Some(client),
            _ => None,
        }
    }

    fn take(&mut self) -> Option<ClientHandle> {
        match std::mem::replace(self, Self::Vacant) {
            Self::Vacant => None,
            Self::Handshaking(handshake) => Some(handshake.client),
            Self::Active(client) => Some(client),
        }
    }
}

/// A reserved client that has not been welcomed yet.
#[derive(Debug)]
struct Handshake {
    client: ClientHandle,
    /// Internal request ids whose answers form the welcome snapshot.
    snapshot_ids: Vec<String>,
    /// Events emitted after the latest snapshot answer.
    backlog: Vec<Value>,
    overflowed: bool,
}

impl Handshake {
    const fn new(client: ClientHandle) -> Self {
        Self {
            client,
            snapshot_ids: Vec::new(),
            backlog: Vec::new(),
            overflowed: false,
        }
    }

    fn hold(&mut self, payload: Value) {
        let limit = self.client.backlog_limit();
        if self.backlog.len() < limit {
            self.backlog.push(payload);
        } else if !self.overflowed {
            warn!(conn = %self.client.conn, limit, "Handshake backlog full");
            self.overflowed = true;
        }
    }
}

type PendingRequests = HashMap<String, oneshot::Sender<CorrelatedResponse>>;

struct Inner {
    config: GatewayConfig,
    backend: BackendSender,
    dialogs: DialogBroker,
    state: Mutex<SessionState>,
    requests: Mutex<PendingRequests>,
    next_request: AtomicU64,
    backend_exited: AtomicBool,
}

/// Relay between the supervised backend and a single client connection.
#[derive(Clone)]
pub struct SessionGateway {
    inner: Arc<Inner>,
}

impl SessionGateway {
    pub fn new(config: GatewayConfig, backend: BackendSender, dialogs: DialogBroker) -> Self {
        info!(server_id = %config.server_id, "Session gateway created");
        Self {
            inner: Arc::new(Inner {
                config,
                backend,
                dialogs,
                state: Mutex::new(SessionState {
                    slot: Slot::Vacant,
                    seq: 0,
                    next_conn: 1,
                }),
                requests: Mutex::new(HashMap::new()),
                next_request: AtomicU64::new(1),
                backend_exited: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn server_id(&self) -> &str {
        &self.inner.config.server_id
    }

    pub fn dialogs(&self) -> &DialogBroker {
        &self.inner.dialogs
    }

    /// Sequence number of the last delivered event (0 before any).
    pub async fn current_seq(&self) -> u64 {
        self.inner.state.lock().await.seq
    }

    pub async fn slot_state(&self) -> SlotState {
        match &self.inner.state.lock().await.slot {
            Slot::Vacant => SlotState::Vacant,
            Slot::Handshaking(handshake) => SlotState::Handshaking(handshake.client.conn),
            Slot::Active(client) => SlotState::Active(client.conn),
        }
    }

    /// Number of internal requests awaiting a backend answer.
    pub async fn pending_requests(&self) -> usize {
        self.inner.requests.lock().await.len()
    }

    pub fn backend_exited(&self) -> bool {
        self.inner.backend_exited.load(Ordering::Acquire)
    }

    /// Claim the client slot for a new connection.
    ///
    /// Fails immediately if another connection holds the slot; nothing about
    /// the current client is touched.
    pub async fn try_reserve(
        &self,
        outbound: mpsc::Sender<Outbound>,
    ) -> Result<ConnectionId, GatewayError> {
        if self.backend_exited() {
            return Err(GatewayError::BackendGone);
        }
        let mut state = self.inner.state.lock().await;
        if let Some(holder) = state.slot.conn() {
            warn!(%holder, "Rejecting connection, session slot occupied");
            return Err(GatewayError::SlotOccupied);
        }
        let conn = ConnectionId(state.next_conn);
        state.next_conn += 1;
        state.slot = Slot::Handshaking(Handshake::new(ClientHandle {
            conn,
            client_id: None,
            outbound,
        }));
        drop(state);
        debug!(%conn, "Session slot reserved");
        Ok(conn)
    }

    /// Run the handshake for `conn` from its first text frame.
    ///
    /// On success the client receives `welcome` and becomes active. On
    /// failure it receives an `error` frame, is closed, and the slot is
    /// released.
    pub async fn handshake(&self, conn: ConnectionId, first_frame: &str) -> Result<(), HandshakeError> {
        match self.try_handshake(conn, first_frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(%conn, code = %e.code(), error = %e, "Handshake failed");
                self.reject(conn, e.to_message()).await;
                Err(e)
            }
        }
    }

    async fn try_handshake(&self, conn: ConnectionId, first_frame: &str) -> Result<(), HandshakeError> {
        let hello = parse_hello(first_frame)?;
        info!(
            %conn,
            client_id = %hello.client_id,
            last_seq = ?hello.last_seq,
            "Client hello accepted, fetching snapshot"
        );

        let config = &self.inner.config;
        let state_id = self.next_request_id();
        let history_id = self.next_request_id();
        {
            let mut session = self.inner.state.lock().await;
            match &mut session.slot {
                Slot::Handshaking(handshake) if handshake.client.conn == conn => {
                    handshake.snapshot_ids = vec![state_id.clone(), history_id.clone()];
                }
                _ => return Err(HandshakeError::Detached(conn)),
            }
        }

        let (state, history) = tokio::join!(
            self.request_with_id(state_id, &config.state_command),
            self.request_with_id(history_id, &config.history_command)
        );
        let (state, history) = (state?, history?);

        let mut guard = self.inner.state.lock().await;
        let session = &mut *guard;
        let handshake = match std::mem::replace(&mut session.slot, Slot::Vacant) {
            Slot::Handshaking(handshake) if handshake.client.conn == conn => handshake,
            other => {
                session.slot = other;
                return Err(HandshakeError::Detached(conn));
            }
        };
        if handshake.overflowed {
            let limit = handshake.client.backlog_limit();
            session.slot = Slot::Handshaking(handshake);
            return Err(HandshakeError::Backlog { limit });
        }

        let Handshake { client, backlog, .. } = handshake;
        let current_seq = session.seq;
        let welcome = ServerMessage::Welcome {
            protocol_version: PROTOCOL_VERSION,
            server_id: config.server_id.clone(),
            state,
            history,
            current_seq,
        };
        if !client.offer(welcome) {
            session.slot = Slot::Handshaking(Handshake::new(client));
            return Err(HandshakeError::Detached(conn));
        }

        let held = backlog.len();
        let mut flushed = true;
        for payload in backlog {
            let seq = session.seq + 1;
            if !client.offer(ServerMessage::Event { seq, payload }) {
                flushed = false;
                break;
            }
            session.seq = seq;
        }
        info!(%conn, client_id = %hello.client_id, current_seq, held, "Client attached");
        session.slot = Slot::Active(ClientHandle {
            client_id: Some(hello.client_id),
            ..client
        });
        if !flushed {
            self.release_slot(session, CLIENT_STALLED).await;
            return Err(HandshakeError::Detached(conn));
        }
        Ok(())
    }

    /// Send a final frame to `conn`, close it and release its slot.
    pub async fn reject(&self, conn: ConnectionId, frame: ServerMessage) {
        let mut session = self.inner.state.lock().await;
        if session.slot.conn() != Some(conn) {
            return;
        }
        if let Some(client) = self.release_slot(&mut session, "rejected").await {
            client.offer(frame);
            client.close();
        }
    }

    /// Handle one text frame from an attached client. Malformed frames are
    /// dropped.
    pub async fn handle_client_frame(&self, conn: ConnectionId, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle_client_message(conn, message).await,
            Err(e) => debug!(%conn, error = %e, "Dropping malformed client frame"),
        }
    }

    pub async fn handle_client_message(&self, conn: ConnectionId, message: ClientMessage) {
        match message {
            ClientMessage::Command { payload } => {
                if let Err(e) = self.inner.backend.send(&payload).await {
                    warn!(%conn, error = %e, "Failed to forward command to backend");
                    self.send_to(conn, ServerMessage::error(ErrorCode::BackendFault, e.to_string()))
                        .await;
                }
            }
            ClientMessage::DialogResponse { id, reply } => {
                if !self.inner.dialogs.handle_response(&id, reply).await {
                    debug!(%conn, dialog_id = %id, "Dialog response arrived after resolution");
                }
            }
            ClientMessage::Ping => self.send_to(conn, ServerMessage::Pong).await,
            ClientMessage::Hello(_) => debug!(%conn, "Ignoring repeated hello"),
        }
    }

    /// Send an unsequenced frame to `conn` if it is the active client.
    async fn send_to(&self, conn: ConnectionId, frame: ServerMessage) {
        let mut session = self.inner.state.lock().await;
        let delivered = match session.slot.active() {
            Some(client) if client.conn == conn => client.offer(frame),
            _ => return,
        };
        if !delivered {
            self.release_slot(&mut session, CLIENT_STALLED).await;
        }
    }

    /// Release the slot if `conn` still holds it and resolve every pending
    /// dialog with its default. Returns whether the slot was released.
    pub async fn detach(&self, conn: ConnectionId) -> bool {
        let mut session = self.inner.state.lock().await;
        if session.slot.conn() != Some(conn) {
            return false;
        }
        self.release_slot(&mut session, "disconnected").await.is_some()
    }

    /// Vacate the slot and resolve pending dialogs with their defaults.
    ///
    /// Called with the state lock held, so no other client can attach and
    /// register dialogs before the old ones are drained.
    async fn release_slot(&self, session: &mut SessionState, reason: &str) -> Option<ClientHandle> {
        let client = session.slot.take()?;
        let cancelled = self.inner.dialogs.cancel_all().await;
        info!(
            conn = %client.conn,
            client_id = ?client.client_id,
            cancelled_dialogs = cancelled,
            reason,
            "Client released"
        );
        Some(client)
    }

    fn next_request_id(&self) -> String {
        let n = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
        format!("{GATEWAY_REQUEST_PREFIX}{n}")
    }

    /// Issue a correlated request to the backend and wait for its `data`.
    ///
    /// The id is drawn from the gateway's reserved namespace so it never
    /// collides with client-visible ids. Answers arriving after the timeout
    /// are discarded.
    pub async fn request(&self, command: &str) -> Result<Value, RequestError> {
        self.request_with_id(self.next_request_id(), command).await
    }

    async fn request_with_id(&self, id: String, command: &str) -> Result<Value, RequestError> {
        let (tx, rx) = oneshot::channel();
        self.inner.requests.lock().await.insert(id.clone(), tx);

        let message = json!({"type": command, "id": id});
        if let Err(source) = self.inner.backend.send(&message).await {
            self.inner.requests.lock().await.remove(&id);
            return Err(RequestError::Send {
                command: command.to_string(),
                source,
            });
        }
        debug!(request_id = %id, command, "Sent internal request");

        let timeout = self.inner.config.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) if response.success => Ok(response.data),
            Ok(Ok(response)) => Err(RequestError::Rejected {
                command: command.to_string(),
                error: response.error.unwrap_or_else(|| "unknown error".to_string()),
            }),
            Ok(Err(_)) => Err(RequestError::BackendExited {
                command: command.to_string(),
            }),
            Err(_) => {
                self.inner.requests.lock().await.remove(&id);
                warn!(request_id = %id, command, ?timeout, "Internal request timed out");
                Err(RequestError::Timeout {
                    command: command.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Route one backend message.
    pub async fn handle_backend_message(&self, message: BackendMessage) {
        let (classification, resolver) = {
            let mut requests = self.inner.requests.lock().await;
            let classification =
                ndjson::classify(&message, |id| requests.contains_key(id), GATEWAY_REQUEST_PREFIX);
            let resolver = match &classification {
                Classification::CorrelatedResponse { id } => requests.remove(id),
                _ => None,
            };
            (classification, resolver)
        };

        match classification {
            Classification::CorrelatedResponse { id } => {
                self.mark_snapshot_boundary(&id).await;
                if let (Some(resolver), Some(response)) =
                    (resolver, CorrelatedResponse::from_message(&message))
                {
                    let _ = resolver.send(response);
                }
            }
            Classification::Stale { id } => {
                debug!(request_id = %id, "Discarding late response to internal request");
            }
            Classification::DialogRequest { id, method } => {
                self.route_dialog(id, method, message).await;
            }
            Classification::Event => self.deliver_event(message.into_value()).await,
        }
    }

    /// Events emitted before a snapshot answer are part of that snapshot;
    /// only later ones are held for the welcome. Runs before the answer is
    /// handed to the handshake.
    async fn mark_snapshot_boundary(&self, request_id: &str) {
        let mut session = self.inner.state.lock().await;
        if let Slot::Handshaking(handshake) = &mut session.slot {
            if handshake.snapshot_ids.iter().any(|id| id == request_id) {
                handshake.backlog.clear();
                handshake.overflowed = false;
            }
        }
    }

    async fn route_dialog(&self, id: String, method: String, message: BackendMessage) {
        let default = match self.inner.dialogs.kind_of(&method) {
            DialogKind::FireAndForget => {
                self.deliver_event(message.into_value()).await;
                return;
            }
            DialogKind::Blocking { default } => default,
        };

        let mut guard = self.inner.state.lock().await;
        if guard.slot.active().is_none() {
            drop(guard);
            info!(dialog_id = %id, %method, "No client attached, answering dialog with default");
            self.answer_backend(&id, &default).await;
            return;
        }

        let waiter = match self.inner.dialogs.register(id.clone(), method.clone()).await {
            Ok(waiter) => waiter,
            Err(e) => {
                warn!(error = %e, "Dropping dialog request");
                return;
            }
        };
        let gateway = self.clone();
        tokio::spawn(async move {
            let outcome = waiter.wait().await;
            gateway.complete_dialog(outcome).await;
        });

        let session = &mut *guard;
        let seq = session.seq + 1;
        let frame = ServerMessage::DialogRequest {
            seq,
            id: id.clone(),
            method,
            fields: dialog_fields(message.into_map()),
        };
        if session.slot.active().is_some_and(|client| client.offer(frame)) {
            session.seq = seq;
            debug!(dialog_id = %id, seq, "Forwarded dialog request");
        } else {
            self.release_slot(session, CLIENT_STALLED).await;
        }
    }

    async fn complete_dialog(&self, outcome: DialogOutcome) {
        if outcome.resolution == Resolution::Timeout {
            let frame = ServerMessage::error(
                ErrorCode::DialogTimeout,
                format!("Dialog {} ({}) timed out", outcome.id, outcome.method),
            );
            let mut session = self.inner.state.lock().await;
            if session.slot.active().is_some_and(|client| !client.offer(frame)) {
                self.release_slot(&mut session, CLIENT_STALLED).await;
            }
        }
        self.answer_backend(&outcome.id, &outcome.reply).await;
    }

    async fn answer_backend(&self, id: &str, reply: &DialogReply) {
        if let Err(e) = self
            .inner
            .backend
            .send(&backend_dialog_response(id, reply))
            .await
        {
            warn!(dialog_id = %id, error = %e, "Failed to answer backend dialog");
        }
    }

    /// Wrap `payload` in the next sequenced `event` for the active client,
    /// hold it for a handshaking one, or drop it.
    async fn deliver_event(&self, payload: Value) {
        let mut guard = self.inner.state.lock().await;
        let session = &mut *guard;
        let seq = session.seq + 1;
        let delivered = match &mut session.slot {
            Slot::Vacant => {
                debug!("No client attached, dropping backend event");
                return;
            }
            Slot::Handshaking(handshake) => {
                handshake.hold(payload);
                return;
            }
            Slot::Active(client) => client.offer(ServerMessage::Event { seq, payload }),
        };
        if delivered {
            session.seq = seq;
        } else {
            self.release_slot(session, CLIENT_STALLED).await;
        }
    }

    /// Tear the session down after the backend exited.
    pub async fn handle_backend_exit(&self, report: &ExitReport) {
        self.inner.backend_exited.store(true, Ordering::Release);
        error!(%report, "Backend exited, closing session");

        {
            let mut session = self.inner.state.lock().await;
            if let Some(client) = self.release_slot(&mut session, "backend exited").await {
                client.offer(ServerMessage::error(
                    ErrorCode::BackendFault,
                    format!("Backend exited ({report})"),
                ));
                client.close();
            }
        }

        self.inner.requests.lock().await.clear();
        self.inner.dialogs.cancel_all().await;
    }

    /// Drive backend output through the gateway until the backend exits.
    pub fn spawn_backend_pump(&self, mut events: mpsc::Receiver<BackendEvent>) -> JoinHandle<ExitReport> {
        let gateway = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    BackendEvent::Message(message) => gateway.handle_backend_message(message).await,
                    BackendEvent::Exited(report) => {
                        gateway.handle_backend_exit(&report).await;
                        return report;
                    }
                }
            }
            let report = ExitReport {
                code: None,
                signal: None,
                requested: false,
                wait_error: Some("backend event stream closed".to_string()),
                diagnostics: Vec::new(),
            };
            gateway.handle_backend_exit(&report).await;
            report
        })
    }
}

/// Validate the first client frame as a hello.
///
/// The version is checked on the raw JSON so that a mismatching client gets
/// `IncompatibleProtocol` even if the rest of its hello differs in shape.
fn parse_hello(frame: &str) -> Result<Hello, HandshakeError> {
    let raw: Value =
        serde_json::from_str(frame).map_err(|e| HandshakeError::Malformed(e.to_string()))?;
    if raw.get("type").and_then(Value::as_str) != Some("hello") {
        return Err(HandshakeError::NotHello);
    }
    let version = raw
        .get("protocolVersion")
        .ok_or_else(|| HandshakeError::Malformed("missing protocolVersion".to_string()))?;
    if version.as_u64() != Some(u64::from(PROTOCOL_VERSION)) {
        return Err(HandshakeError::IncompatibleProtocol {
            client: version.clone(),
        });
    }
    match serde_json::from_value::<ClientMessage>(raw) {
        Ok(ClientMessage::Hello(hello)) => Ok(hello),
        Ok(_) => Err(HandshakeError::NotHello),
        Err(e) => Err(HandshakeError::Malformed(e.to_string())),
    }
}

/// Backend dialog fields other than the routing keys.
fn dialog_fields(mut raw: Map<String, Value>) -> Map<String, Value> {
    for key in ["type", "id", "method"] {
        raw.remove(key);
    }
    raw
}
