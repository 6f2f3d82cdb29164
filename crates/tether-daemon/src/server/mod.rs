//! WebSocket server for tether clients.
//!
//! Each accepted socket becomes one connection task: claim the session
//! slot, read the hello within the request timeout, then relay text frames
//! to the [`SessionGateway`] until the client leaves or goes idle.

mod config;

pub use config::ServerConfig;

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{WebSocketStream, accept_async_with_config};
use tracing::{debug, error, info, warn};

use tether_proto::{ErrorCode, ServerMessage};

use crate::gateway::{ConnectionId, Outbound, SessionGateway};

/// How long a closing connection waits for queued frames to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One inbound WebSocket read.
enum Inbound {
    Text(String),
    /// Binary, ping or pong frame; counts as activity only.
    Other,
    Closed,
}

/// WebSocket front end of a [`SessionGateway`].
#[derive(Clone)]
pub struct GatewayServer {
    gateway: SessionGateway,
    config: ServerConfig,
}

impl GatewayServer {
    pub const fn new(gateway: SessionGateway, config: ServerConfig) -> Self {
        Self { gateway, config }
    }

    /// Accept connections until `shutdown` completes.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        info!("Listening on ws://{}", addr);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    debug!(%peer, "New connection");
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer).await {
                            warn!(%peer, error = %e, "Connection error");
                        }
                    });
                }
            }
        }
    }

    fn ws_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.config.max_message_bytes);
        config.max_frame_size = Some(self.config.max_message_bytes);
        config
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), ServerError> {
        let ws_stream = accept_async_with_config(stream, Some(self.ws_config())).await?;
        let (sink, mut source) = ws_stream.split();

        let (out_tx, out_rx) = mpsc::channel(self.config.outbound_capacity);
        let conn = match self.gateway.try_reserve(out_tx).await {
            Ok(conn) => conn,
            Err(e) => {
                info!(%peer, code = %e.code(), "Rejecting connection: {e}");
                return reject_connection(sink, ServerMessage::error(e.code(), e.to_string())).await;
            }
        };
        info!(%conn, %peer, "Client connected");

        let mut writer = tokio::spawn(write_frames(sink, out_rx, self.config.write_timeout));
        self.relay(conn, &mut source, &mut writer).await;
        self.gateway.detach(conn).await;

        if !writer.is_finished()
            && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err()
        {
            debug!(%conn, "Writer still busy after disconnect, aborting");
            writer.abort();
        }
        info!(%conn, %peer, "Connection closed");
        Ok(())
    }

    /// Handshake, then pump client frames into the gateway.
    async fn relay(&self, conn: ConnectionId, source: &mut WsSource, writer: &mut JoinHandle<()>) {
        let config = self.gateway.config();

        let first = loop {
            match tokio::time::timeout(config.request_timeout, read_frame(source)).await {
                Ok(Inbound::Text(text)) => break text,
                Ok(Inbound::Other) => {}
                Ok(Inbound::Closed) => {
                    debug!(%conn, "Client left before hello");
                    return;
                }
                Err(_) => {
                    warn!(%conn, "No hello within {:?}", config.request_timeout);
                    let frame = ServerMessage::error(
                        ErrorCode::InvalidHandshake,
                        "No hello received before timeout",
                    );
                    self.gateway.reject(conn, frame).await;
                    return;
                }
            }
        };
        if self.gateway.handshake(conn, &first).await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                _ = &mut *writer => {
                    debug!(%conn, "Writer finished, ending relay");
                    return;
                }
                inbound = tokio::time::timeout(config.idle_timeout, read_frame(source)) => {
                    match inbound {
                        Ok(Inbound::Text(text)) => self.gateway.handle_client_frame(conn, &text).await,
                        Ok(Inbound::Other) => {}
                        Ok(Inbound::Closed) => {
                            debug!(%conn, "Client closed connection");
                            return;
                        }
                        Err(_) => {
                            warn!(%conn, idle = ?config.idle_timeout, "Client idle, dropping connection");
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn read_frame(source: &mut WsSource) -> Inbound {
    match source.next().await {
        Some(Ok(Message::Text(text))) => Inbound::Text(text),
        Some(Ok(Message::Close(_))) | None => Inbound::Closed,
        Some(Ok(Message::Binary(_))) => {
            debug!("Dropping binary frame");
            Inbound::Other
        }
        Some(Ok(_)) => Inbound::Other,
        Some(Err(e)) => {
            debug!(error = %e, "WebSocket read failed");
            Inbound::Closed
        }
    }
}

/// Drain the connection's outbound queue into the socket.
///
/// Ends when the gateway closes or drops the queue, or when the socket
/// stays blocked longer than `write_timeout`.
async fn write_frames(mut sink: WsSink, mut rx: mpsc::Receiver<Outbound>, write_timeout: Duration) {
    while let Some(outbound) = rx.recv().await {
        let frame = match outbound {
            Outbound::Frame(frame) => frame,
            Outbound::Close => break,
        };
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "Failed to serialize frame");
                continue;
            }
        };
        match tokio::time::timeout(write_timeout, sink.send(Message::Text(json))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "Failed to send frame");
                return;
            }
            Err(_) => {
                warn!(?write_timeout, "Client socket stalled, dropping connection");
                return;
            }
        }
    }
    let _ = tokio::time::timeout(write_timeout, sink.close()).await;
}

/// Send a single error frame and close.
async fn reject_connection(mut sink: WsSink, frame: ServerMessage) -> Result<(), ServerError> {
    let json = serde_json::to_string(&frame)?;
    sink.send(Message::Text(json)).await?;
    sink.close().await?;
    Ok(())
}
