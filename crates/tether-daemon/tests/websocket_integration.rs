#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end tests over a real WebSocket connection.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use common::{FakeBackend, WAIT, hello};
use tether_daemon::gateway::SlotState;
use tether_daemon::server::{GatewayServer, ServerConfig};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(backend: &FakeBackend) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = GatewayServer::new(backend.gateway.clone(), ServerConfig::tcp(addr));
    tokio::spawn(server.serve(listener, std::future::pending()));
    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    ws
}

/// Next JSON text frame, or `None` once the server closes.
async fn recv_json(ws: &mut Client) -> Option<Value> {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("frame expected");
        match msg {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
            Some(Ok(Message::Close(_)) | Err(_)) | None => return None,
            Some(Ok(_)) => {}
        }
    }
}

async fn send_json(ws: &mut Client, value: &Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn wait_for_vacant(backend: &FakeBackend) {
    for _ in 0..100 {
        if backend.gateway.slot_state().await == SlotState::Vacant {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("slot was never released");
}

#[tokio::test]
async fn hello_welcome_and_live_events() {
    let backend = FakeBackend::start();
    let addr = start_server(&backend).await;
    let mut ws = connect(addr).await;

    ws.send(Message::Text(hello())).await.unwrap();
    let welcome = recv_json(&mut ws).await.unwrap();
    assert_eq!(welcome["type"], json!("welcome"));
    assert_eq!(welcome["protocolVersion"], json!(1));
    assert_eq!(welcome["serverId"], json!("srv-test"));
    assert_eq!(welcome["state"], json!({"model": "m"}));
    assert_eq!(welcome["history"], json!([]));
    assert_eq!(welcome["currentSeq"], json!(0));

    backend.emit(json!({"type": "agent_start"})).await;
    let event = recv_json(&mut ws).await.unwrap();
    assert_eq!(event, json!({"type": "event", "seq": 1, "payload": {"type": "agent_start"}}));

    send_json(&mut ws, &json!({"type": "ping"})).await;
    assert_eq!(recv_json(&mut ws).await.unwrap(), json!({"type": "pong"}));
}

#[tokio::test]
async fn occupied_slot_rejects_second_connection() {
    let backend = FakeBackend::start();
    let addr = start_server(&backend).await;

    let mut first = connect(addr).await;
    first.send(Message::Text(hello())).await.unwrap();
    recv_json(&mut first).await.unwrap();

    let mut second = connect(addr).await;
    let rejection = recv_json(&mut second).await.unwrap();
    assert_eq!(rejection["type"], json!("error"));
    assert_eq!(rejection["code"], json!("SessionUnavailable"));
    assert!(recv_json(&mut second).await.is_none());

    // The first client keeps streaming.
    backend.emit(json!({"type": "turn_start"})).await;
    assert_eq!(recv_json(&mut first).await.unwrap()["seq"], json!(1));
}

#[tokio::test]
async fn incompatible_hello_gets_error_then_close() {
    let backend = FakeBackend::start();
    let addr = start_server(&backend).await;
    let mut ws = connect(addr).await;

    send_json(
        &mut ws,
        &json!({"type": "hello", "protocolVersion": 99, "clientId": "future"}),
    )
    .await;
    let error = recv_json(&mut ws).await.unwrap();
    assert_eq!(error["code"], json!("IncompatibleProtocol"));
    assert_eq!(error["serverVersion"], json!(1));
    assert!(recv_json(&mut ws).await.is_none());
    wait_for_vacant(&backend).await;
}

#[tokio::test]
async fn reconnect_resumes_sequence_and_cancels_dialogs() {
    let mut backend = FakeBackend::start();
    let addr = start_server(&backend).await;

    let mut ws = connect(addr).await;
    ws.send(Message::Text(hello())).await.unwrap();
    recv_json(&mut ws).await.unwrap();

    backend.emit(json!({"type": "message_update"})).await;
    backend
        .emit(json!({"type": "extension_ui_request", "id": "q1", "method": "input", "title": "Name?"}))
        .await;
    assert_eq!(recv_json(&mut ws).await.unwrap()["seq"], json!(1));
    let dialog = recv_json(&mut ws).await.unwrap();
    assert_eq!(dialog["type"], json!("dialog-request"));
    assert_eq!(dialog["title"], json!("Name?"));

    // Junk is ignored and does not end the session.
    ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    ws.send(Message::Text("{oops".into())).await.unwrap();

    ws.close(None).await.unwrap();
    drop(ws);

    assert_eq!(
        backend.next_seen().await,
        json!({"type": "extension_ui_response", "id": "q1", "cancelled": true})
    );
    wait_for_vacant(&backend).await;

    let mut ws = connect(addr).await;
    ws.send(Message::Text(hello())).await.unwrap();
    let welcome = recv_json(&mut ws).await.unwrap();
    assert_eq!(welcome["currentSeq"], json!(2));

    backend.emit(json!({"type": "agent_end"})).await;
    assert_eq!(recv_json(&mut ws).await.unwrap()["seq"], json!(3));
}

#[tokio::test]
async fn oversized_frame_drops_connection() {
    let backend = FakeBackend::start();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig::tcp(addr).with_max_message_bytes(1024);
    tokio::spawn(GatewayServer::new(backend.gateway.clone(), config).serve(listener, std::future::pending()));

    let mut ws = connect(addr).await;
    ws.send(Message::Text(hello())).await.unwrap();
    recv_json(&mut ws).await.unwrap();

    let payload = "x".repeat(4096);
    let _ = ws
        .send(Message::Text(json!({"type": "command", "payload": payload}).to_string()))
        .await;
    assert!(recv_json(&mut ws).await.is_none());
    wait_for_vacant(&backend).await;
}
