//! Tether Daemon
//!
//! Supervises one agent backend process and exposes its session to a single,
//! detachable WebSocket client.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use tether_core::Settings;
use tether_core::config::load_settings;
use tether_daemon::dialog::{DialogBroker, DialogConfig};
use tether_daemon::gateway::{GatewayConfig, SessionGateway};
use tether_daemon::server::{GatewayServer, ServerConfig};
use tether_daemon::subprocess::{ProcessSupervisor, SupervisorConfig};
use tether_proto::DialogMethodTable;

/// Time allowed for the backend pump and server to wind down after stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "tether-daemon")]
#[command(version, about = "Tether daemon - detachable session relay for an agent backend")]
struct Args {
    /// Settings file (JSON). Defaults to the per-user settings.json when present.
    #[arg(long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// WebSocket bind address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Backend executable
    #[arg(long)]
    backend: Option<String>,

    /// Working directory for the backend
    #[arg(long, env = "TETHER_WORKING_DIR")]
    cwd: Option<PathBuf>,

    /// Session identifier reported to clients
    #[arg(long)]
    server_id: Option<String>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "TETHER_LOG_JSON")]
    log_json: bool,

    /// Seconds to wait for graceful backend shutdown before SIGKILL.
    #[arg(long)]
    terminate_timeout: Option<u64>,

    /// Arguments passed to the backend (after `--`). Replaces the configured arguments.
    #[arg(last = true)]
    backend_args: Vec<String>,
}

impl Args {
    /// Apply CLI flags on top of file and environment settings.
    fn apply(self, settings: &mut Settings) {
        if let Some(listen) = self.listen {
            settings.daemon.listen_addr = listen.to_string();
        }
        if let Some(program) = self.backend {
            settings.backend.program = program;
        }
        if self.cwd.is_some() {
            settings.backend.working_directory = self.cwd;
        }
        if self.server_id.is_some() {
            settings.daemon.server_id = self.server_id;
        }
        if let Some(level) = self.log_level {
            settings.daemon.log_level = level;
        }
        if self.log_json {
            settings.daemon.log_json = true;
        }
        if let Some(secs) = self.terminate_timeout {
            settings.backend.terminate_timeout_secs = secs;
        }
        if !self.backend_args.is_empty() {
            settings.backend.args = self.backend_args;
        }
    }
}

#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> anyhow::Result<()> {
    let mut args = Args::parse();
    let mut settings = load_settings(args.config.take().as_deref())?;
    args.apply(&mut settings);

    let level = &settings.daemon.log_level;
    tether_core::tracing_init::init_tracing(
        &format!("tether_daemon={level},tether_core={level}"),
        settings.daemon.log_json,
    );

    let listen_addr: SocketAddr = settings
        .daemon
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address {}", settings.daemon.listen_addr))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %listen_addr,
        backend = %settings.backend.program,
        "Starting tether-daemon"
    );

    let supervisor_config = SupervisorConfig {
        working_directory: settings.backend.working_directory.clone(),
        diagnostic_lines: settings.backend.diagnostic_lines,
        ..SupervisorConfig::new(&settings.backend.program)
            .with_args(settings.backend.args.clone())
            .with_startup_grace(settings.backend.startup_grace())
            .with_terminate_timeout(settings.backend.terminate_timeout())
    };
    let (mut supervisor, events) = match ProcessSupervisor::start(supervisor_config).await {
        Ok(started) => started,
        Err(e) => {
            error!(error = %e, "Backend failed to start");
            return Err(e.into());
        }
    };

    let dialogs = DialogBroker::new(
        DialogConfig {
            timeout: settings.protocol.dialog_timeout(),
        },
        DialogMethodTable::default(),
    );
    let gateway_config = GatewayConfig {
        server_id: settings
            .daemon
            .server_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        request_timeout: settings.protocol.request_timeout(),
        state_command: settings.backend.state_command.clone(),
        history_command: settings.backend.history_command.clone(),
        idle_timeout: settings.protocol.idle_timeout(),
    };
    let gateway = SessionGateway::new(gateway_config, supervisor.sender(), dialogs);
    let mut pump = gateway.spawn_backend_pump(events);

    let server_config =
        ServerConfig::tcp(listen_addr).with_max_message_bytes(settings.daemon.max_frame_bytes);
    let listener = TcpListener::bind(server_config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {listen_addr}"))?;
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    let mut server = tokio::spawn(GatewayServer::new(gateway.clone(), server_config).serve(
        listener,
        async move {
            let _ = shutdown_rx.changed().await;
        },
    ));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the daemon is ready to serve (unix only).
    // The `true` parameter unsets $NOTIFY_SOCKET for anything spawned later.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!(addr = %listen_addr, server_id = %gateway.server_id(), "Session ready");

    tokio::select! {
        _ = &mut pump => {
            info!("Backend exited, shutting down");
        }
        result = &mut server => {
            match result {
                Ok(Ok(())) => info!("Server stopped"),
                Ok(Err(e)) => error!(error = %e, "Server failed"),
                Err(e) => error!(error = %e, "Server task failed"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    let report = supervisor.stop().await?;
    if !pump.is_finished() {
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, pump).await;
    }
    if !server.is_finished() {
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, server).await;
    }

    if !report.requested && !report.success() {
        error!(%report, diagnostics = ?report.diagnostics, "Backend terminated the session");
        anyhow::bail!("backend exited: {report}");
    }

    info!(%report, "Daemon stopped");
    Ok(())
}
