#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Integration tests use unwrap for brevity

//! Integration tests for the full relay: a real backend subprocess under the
//! supervisor, its output pumped through the gateway to a client channel.

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use tether_daemon::dialog::DialogBroker;
use tether_daemon::gateway::{GatewayConfig, Outbound, SessionGateway};
use tether_daemon::subprocess::{ProcessSupervisor, SupervisorConfig};
use tether_proto::{ErrorCode, ServerMessage};

/// A tiny line-oriented backend: answers snapshot requests, starts a turn
/// with a confirmation dialog on `prompt`, and echoes dialog replies.
const BACKEND_SCRIPT: &str = r#"
echo 'starting up'
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"type":"get_state"'*)
      printf '{"type":"response","id":"%s","command":"get_state","success":true,"data":{"model":"m"}}\n' "$id" ;;
    *'"type":"get_messages"'*)
      printf '{"type":"response","id":"%s","command":"get_messages","success":true,"data":[]}\n' "$id" ;;
    *'"type":"prompt"'*)
      printf '{"type":"agent_start"}\n'
      printf '{"type":"extension_ui_request","id":"d1","method":"confirm","title":"Run it?"}\n' ;;
    *'"type":"extension_ui_response"'*)
      printf '{"type":"echo","reply":%s}\n' "$line" ;;
  esac
done
"#;

async fn frame(rx: &mut mpsc::Receiver<Outbound>) -> ServerMessage {
    match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        Ok(Some(Outbound::Frame(frame))) => frame,
        other => panic!("expected frame, got {other:?}"),
    }
}

#[tokio::test]
async fn supervised_backend_round_trip() {
    let config = SupervisorConfig::new("/bin/sh")
        .with_args(["-c", BACKEND_SCRIPT])
        .with_startup_grace(Duration::from_millis(100))
        .with_terminate_timeout(Duration::from_secs(2));
    let (mut supervisor, events) = ProcessSupervisor::start(config).await.unwrap();

    let gateway = SessionGateway::new(
        GatewayConfig {
            server_id: "srv-e2e".into(),
            ..GatewayConfig::default()
        },
        supervisor.sender(),
        DialogBroker::with_defaults(),
    );
    let pump = gateway.spawn_backend_pump(events);

    let (tx, mut rx) = mpsc::channel(32);
    let conn = gateway.try_reserve(tx).await.unwrap();
    let hello = json!({"type": "hello", "protocolVersion": 1, "clientId": "e2e"}).to_string();
    gateway.handshake(conn, &hello).await.unwrap();

    match frame(&mut rx).await {
        ServerMessage::Welcome {
            server_id,
            state,
            history,
            current_seq,
            ..
        } => {
            assert_eq!(server_id, "srv-e2e");
            assert_eq!(state, json!({"model": "m"}));
            assert_eq!(history, json!([]));
            assert_eq!(current_seq, 0);
        }
        other => panic!("expected welcome, got {other:?}"),
    }

    let command = json!({"type": "command", "payload": {"type": "prompt", "message": "hi"}});
    gateway.handle_client_frame(conn, &command.to_string()).await;

    assert_eq!(
        frame(&mut rx).await,
        ServerMessage::Event {
            seq: 1,
            payload: json!({"type": "agent_start"}),
        }
    );
    match frame(&mut rx).await {
        ServerMessage::DialogRequest { seq, id, method, .. } => {
            assert_eq!((seq, id.as_str(), method.as_str()), (2, "d1", "confirm"));
        }
        other => panic!("expected dialog-request, got {other:?}"),
    }

    let answer = json!({"type": "dialog-response", "id": "d1", "confirmed": true});
    gateway.handle_client_frame(conn, &answer.to_string()).await;
    assert_eq!(
        frame(&mut rx).await,
        ServerMessage::Event {
            seq: 3,
            payload: json!({
                "type": "echo",
                "reply": {"type": "extension_ui_response", "id": "d1", "confirmed": true}
            }),
        }
    );

    let report = supervisor.stop().await.unwrap();
    assert!(report.requested);

    match frame(&mut rx).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::BackendFault),
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(rx.recv().await, Some(Outbound::Close));
    assert_eq!(pump.await.unwrap(), report);
}
