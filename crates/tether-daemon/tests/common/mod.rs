//! Shared harness: a gateway wired to an in-process fake backend.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use tether_core::ndjson;
use tether_daemon::dialog::{DialogBroker, DialogConfig};
use tether_daemon::gateway::{ConnectionId, GatewayConfig, Outbound, SessionGateway};
use tether_daemon::subprocess::BackendSender;
use tether_proto::{DialogMethodTable, ServerMessage};

pub const WAIT: Duration = Duration::from_secs(2);

pub fn hello() -> String {
    json!({"type": "hello", "protocolVersion": 1, "clientId": "test-client"}).to_string()
}

pub struct FakeBackend {
    pub gateway: SessionGateway,
    /// Lines the gateway wrote to the backend, except snapshot requests.
    pub seen: mpsc::Receiver<Value>,
    /// Cleared to make `BackendSender::send` fail as if the process died.
    pub running: Arc<AtomicBool>,
    /// Whether snapshot requests are answered.
    pub answering: Arc<AtomicBool>,
}

pub struct Options {
    pub request_timeout: Duration,
    pub dialog_timeout: Duration,
    pub state: Value,
    pub history: Value,
    /// Emitted right after answering the history request.
    pub after_snapshot: Option<Value>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(2),
            dialog_timeout: Duration::from_secs(30),
            state: json!({"model": "m"}),
            history: json!([]),
            after_snapshot: None,
        }
    }
}

impl FakeBackend {
    pub fn start() -> Self {
        Self::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(64);
        let running = Arc::new(AtomicBool::new(true));
        let answering = Arc::new(AtomicBool::new(true));

        let config = GatewayConfig {
            server_id: "srv-test".to_string(),
            request_timeout: options.request_timeout,
            ..GatewayConfig::default()
        };
        let dialogs = DialogBroker::new(
            DialogConfig {
                timeout: options.dialog_timeout,
            },
            DialogMethodTable::default(),
        );
        let gateway = SessionGateway::new(
            config,
            BackendSender::new(stdin_tx, Arc::clone(&running)),
            dialogs,
        );

        let (seen_tx, seen) = mpsc::channel(64);
        let backend_gateway = gateway.clone();
        let backend_answering = Arc::clone(&answering);
        tokio::spawn(async move {
            while let Some(line) = stdin_rx.recv().await {
                let value: Value = serde_json::from_str(&line).unwrap();
                let data = match value["type"].as_str() {
                    Some("get_state") => options.state.clone(),
                    Some("get_messages") => options.history.clone(),
                    _ => {
                        let _ = seen_tx.send(value).await;
                        continue;
                    }
                };
                if backend_answering.load(Ordering::SeqCst) {
                    let response = json!({
                        "type": "response",
                        "id": value["id"],
                        "command": value["type"],
                        "success": true,
                        "data": data,
                    });
                    backend_gateway
                        .handle_backend_message(ndjson::parse_value(response).unwrap())
                        .await;
                    if let (Some("get_messages"), Some(event)) =
                        (value["type"].as_str(), options.after_snapshot.clone())
                    {
                        backend_gateway
                            .handle_backend_message(ndjson::parse_value(event).unwrap())
                            .await;
                    }
                }
            }
        });

        Self {
            gateway,
            seen,
            running,
            answering,
        }
    }

    /// Deliver one backend stdout line to the gateway.
    pub async fn emit(&self, message: Value) {
        self.gateway
            .handle_backend_message(ndjson::parse_value(message).unwrap())
            .await;
    }

    /// Attach a client through the full handshake and return its welcome.
    pub async fn attach(&self) -> (TestClient, ServerMessage) {
        let mut client = self.reserve().await;
        self.gateway.handshake(client.conn, &hello()).await.unwrap();
        let welcome = client.frame().await;
        (client, welcome)
    }

    pub async fn reserve(&self) -> TestClient {
        self.reserve_with_capacity(64).await
    }

    pub async fn reserve_with_capacity(&self, capacity: usize) -> TestClient {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = self.gateway.try_reserve(tx).await.unwrap();
        TestClient { conn, rx }
    }

    /// Like [`attach`](Self::attach) with a small outbound queue.
    pub async fn attach_with_capacity(&self, capacity: usize) -> (TestClient, ServerMessage) {
        let mut client = self.reserve_with_capacity(capacity).await;
        self.gateway.handshake(client.conn, &hello()).await.unwrap();
        let welcome = client.frame().await;
        (client, welcome)
    }

    pub async fn next_seen(&mut self) -> Value {
        tokio::time::timeout(WAIT, self.seen.recv())
            .await
            .expect("backend line expected")
            .expect("backend channel open")
    }
}

pub struct TestClient {
    pub conn: ConnectionId,
    pub rx: mpsc::Receiver<Outbound>,
}

impl TestClient {
    pub async fn next(&mut self) -> Outbound {
        tokio::time::timeout(WAIT, self.rx.recv())
            .await
            .expect("outbound message expected")
            .expect("outbound channel open")
    }

    /// Next outbound frame; panics on `Close`.
    pub async fn frame(&mut self) -> ServerMessage {
        match self.next().await {
            Outbound::Frame(frame) => frame,
            Outbound::Close => panic!("unexpected close"),
        }
    }

    pub fn assert_idle(&mut self) {
        assert!(self.rx.try_recv().is_err(), "no frame expected");
    }
}
