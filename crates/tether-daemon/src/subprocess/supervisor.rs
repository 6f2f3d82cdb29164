//! Backend subprocess lifecycle supervisor.
//!
//! Owns exactly one backend process: spawns it, parses its stdout as NDJSON,
//! writes JSON lines to its stdin, keeps recent stderr for diagnostics and
//! reports its exit. The supervisor never restarts the backend.

use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tether_core::ndjson::{self, BackendMessage};

use super::diagnostics::DiagnosticBuffer;

/// How long the monitor waits for the output readers to drain after exit.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for spawning the backend.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Backend executable.
    pub program: PathBuf,
    /// Arguments passed to the backend.
    pub args: Vec<String>,
    /// Working directory (falls back to the home directory when missing).
    pub working_directory: Option<PathBuf>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Window after spawn in which a nonzero exit fails `start`.
    pub startup_grace: Duration,
    /// Wait between SIGINT and SIGKILL in `stop`.
    pub terminate_timeout: Duration,
    /// Number of stderr lines retained for diagnostics.
    pub diagnostic_lines: usize,
}

impl SupervisorConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_directory: None,
            env: Vec::new(),
            startup_grace: Duration::from_millis(500),
            terminate_timeout: Duration::from_secs(5),
            diagnostic_lines: 50,
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub const fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    #[must_use]
    pub const fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }
}

/// Output of the backend, in order. `Exited` is always the final event.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Message(BackendMessage),
    Exited(ExitReport),
}

/// How the backend process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Whether the exit followed a `stop()` request.
    pub requested: bool,
    /// Error from waiting on the process, if any.
    pub wait_error: Option<String>,
    /// Recent stderr output at the time of exit.
    pub diagnostics: Vec<String>,
}

impl ExitReport {
    fn from_wait(status: std::io::Result<ExitStatus>, requested: bool, diagnostics: Vec<String>) -> Self {
        match status {
            Ok(status) => Self {
                code: status.code(),
                signal: exit_signal(status),
                requested,
                wait_error: None,
                diagnostics,
            },
            Err(e) => Self {
                code: None,
                signal: None,
                requested,
                wait_error: Some(e.to_string()),
                diagnostics,
            },
        }
    }

    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal, &self.wait_error) {
            (Some(code), _, _) => write!(f, "exit code {code}"),
            (None, Some(signal), _) => write!(f, "signal {signal}"),
            (None, None, Some(err)) => write!(f, "wait failed: {err}"),
            (None, None, None) => f.write_str("unknown status"),
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
const fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

/// Cloneable write handle to the backend's stdin.
#[derive(Debug, Clone)]
pub struct BackendSender {
    stdin_tx: mpsc::Sender<String>,
    running: Arc<AtomicBool>,
}

impl BackendSender {
    /// Wrap a line channel. `running` is cleared when the backend exits.
    pub const fn new(stdin_tx: mpsc::Sender<String>, running: Arc<AtomicBool>) -> Self {
        Self { stdin_tx, running }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Write one JSON line to the backend.
    pub async fn send(&self, message: &Value) -> Result<(), SupervisorError> {
        if !self.is_running() {
            return Err(SupervisorError::NotRunning);
        }
        let line = serde_json::to_string(message)?;
        self.stdin_tx
            .send(line)
            .await
            .map_err(|_| SupervisorError::ChannelClosed)
    }
}

/// Supervisor owning the backend process.
pub struct ProcessSupervisor {
    pid: Option<u32>,
    sender: BackendSender,
    diagnostics: DiagnosticBuffer,
    stop_tx: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<ExitReport>>,
    exit_rx: watch::Receiver<Option<ExitReport>>,
}

impl ProcessSupervisor {
    /// Spawn the backend and start streaming its output.
    ///
    /// Waits `startup_grace` to catch an immediate crash; a nonzero exit in
    /// that window fails with [`SupervisorError::StartupFailed`].
    #[allow(clippy::too_many_lines)]
    pub async fn start(
        config: SupervisorConfig,
    ) -> Result<(Self, mpsc::Receiver<BackendEvent>), SupervisorError> {
        let working_dir = resolve_working_dir(config.working_directory.as_ref());
        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .current_dir(&working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Ensure essential env vars are available to the backend even
        // when running under systemd with stripped environment.
        if let Ok(home) = std::env::var("HOME") {
            cmd.env("HOME", &home);
        }
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", &path);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        info!(
            program = %config.program.display(),
            args = ?config.args,
            working_dir = %working_dir.display(),
            "Spawning backend process"
        );
        let mut child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
            program: config.program.display().to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SupervisorError::SpawnFailed {
                program: config.program.display().to_string(),
                reason: "Failed to capture stdin".to_string(),
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::SpawnFailed {
                program: config.program.display().to_string(),
                reason: "Failed to capture stdout".to_string(),
            })?;
        let stderr = child.stderr.take();

        // Spawn stdin writer task
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = stdin_rx.recv().await {
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    error!("Failed to write to backend stdin: {}", e);
                    break;
                }
                if let Err(e) = stdin.write_all(b"\n").await {
                    error!("Failed to write newline: {}", e);
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    error!("Failed to flush backend stdin: {}", e);
                    break;
                }
            }
            debug!("stdin writer finished");
        });

        // Spawn stdout reader task
        let (events_tx, events_rx) = mpsc::channel::<BackendEvent>(256);
        let stdout_events = events_tx.clone();
        let stdout_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            while let Some(line) = read_line_lossy(&mut reader, &mut buf).await {
                match ndjson::parse_line(&line) {
                    Ok(msg) => {
                        if stdout_events.send(BackendEvent::Message(msg)).await.is_err() {
                            warn!("backend event channel closed");
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "Dropping non-JSON backend line"),
                }
            }
            debug!("stdout reader finished");
        });

        // Spawn stderr reader for diagnostics
        let diagnostics = DiagnosticBuffer::new(config.diagnostic_lines);
        let stderr_task = stderr.map(|stderr| {
            let diag = diagnostics.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut buf = Vec::new();
                while let Some(line) = read_line_lossy(&mut reader, &mut buf).await {
                    debug!("backend stderr: {}", line);
                    diag.push(line);
                }
                debug!("stderr reader finished");
            })
        });

        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        let monitor = tokio::spawn(monitor_child(MonitorContext {
            child,
            stop_rx,
            terminate_timeout: config.terminate_timeout,
            readers: [Some(stdout_task), stderr_task],
            events_tx,
            running: Arc::clone(&running),
            diagnostics: diagnostics.clone(),
            exit_tx,
        }));

        let mut startup_watch = exit_rx.clone();
        let early_exit = tokio::time::timeout(config.startup_grace, async move {
            startup_watch
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|report| (*report).clone())
        })
        .await;

        if let Ok(Some(report)) = early_exit {
            if !report.success() {
                error!(%report, diagnostics = ?report.diagnostics, "Backend failed during startup");
                return Err(SupervisorError::StartupFailed { report });
            }
        }

        info!(pid = ?pid, "Backend process started");
        Ok((
            Self {
                pid,
                sender: BackendSender::new(stdin_tx, running),
                diagnostics,
                stop_tx: Some(stop_tx),
                monitor: Some(monitor),
                exit_rx,
            },
            events_rx,
        ))
    }

    /// OS process id, if known.
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write handle for the backend's stdin.
    pub fn sender(&self) -> BackendSender {
        self.sender.clone()
    }

    /// Write one JSON line to the backend.
    pub async fn send(&self, message: &Value) -> Result<(), SupervisorError> {
        self.sender.send(message).await
    }

    pub fn is_running(&self) -> bool {
        self.sender.is_running()
    }

    /// Recent stderr output, oldest first.
    pub fn diagnostics(&self) -> Vec<String> {
        self.diagnostics.snapshot()
    }

    /// Exit report, once the backend has exited.
    pub fn exit_report(&self) -> Option<ExitReport> {
        self.exit_rx.borrow().clone()
    }

    /// Gracefully terminate the backend: SIGINT, then SIGKILL after the
    /// configured timeout. Calling `stop` again returns the same report.
    pub async fn stop(&mut self) -> Result<ExitReport, SupervisorError> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        match self.monitor.take() {
            Some(handle) => handle
                .await
                .map_err(|e| SupervisorError::Monitor(e.to_string())),
            None => self.exit_report().ok_or(SupervisorError::NotRunning),
        }
    }
}

/// Read one line from a backend pipe. Invalid UTF-8 is replaced rather than
/// ending the stream; `None` means EOF or a read error.
async fn read_line_lossy<R>(reader: &mut R, buf: &mut Vec<u8>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    match reader.read_until(b'\n', buf).await {
        Ok(0) => None,
        Ok(_) => {
            let line = String::from_utf8_lossy(buf);
            Some(line.trim_end_matches(['\n', '\r']).to_string())
        }
        Err(e) => {
            debug!(error = %e, "Backend pipe read failed");
            None
        }
    }
}

struct MonitorContext {
    child: Child,
    stop_rx: oneshot::Receiver<()>,
    terminate_timeout: Duration,
    readers: [Option<JoinHandle<()>>; 2],
    events_tx: mpsc::Sender<BackendEvent>,
    running: Arc<AtomicBool>,
    diagnostics: DiagnosticBuffer,
    exit_tx: watch::Sender<Option<ExitReport>>,
}

/// Wait for the backend to exit (or for a stop request), then publish the
/// exit report after all of its output.
async fn monitor_child(ctx: MonitorContext) -> ExitReport {
    let MonitorContext {
        mut child,
        stop_rx,
        terminate_timeout,
        readers,
        events_tx,
        running,
        diagnostics,
        exit_tx,
    } = ctx;

    // A dropped supervisor counts as a stop request.
    let (status, requested) = tokio::select! {
        status = child.wait() => (status, false),
        _ = stop_rx => (terminate(&mut child, terminate_timeout).await, true),
    };
    running.store(false, Ordering::Release);

    for reader in readers.into_iter().flatten() {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
            debug!("Backend output pipe still open after exit");
        }
    }

    let report = ExitReport::from_wait(status, requested, diagnostics.snapshot());
    if requested || report.success() {
        info!(%report, "Backend process exited");
    } else {
        warn!(%report, "Backend process exited unexpectedly");
    }

    let _ = exit_tx.send(Some(report.clone()));
    let _ = events_tx.send(BackendEvent::Exited(report.clone())).await;
    report
}

async fn terminate(child: &mut Child, timeout: Duration) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid is a valid process ID obtained from our own Child handle.
            // kill(2) with SIGINT is safe to call on any owned subprocess.
            #[allow(unsafe_code)]
            #[allow(clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(pid as i32, libc::SIGINT) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(pid, error = %err, "Failed to send SIGINT");
            }
        }
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("Timeout waiting for graceful shutdown, killing");
            child.kill().await?;
            child.wait().await
        }
    }
}

fn resolve_working_dir(requested: Option<&PathBuf>) -> PathBuf {
    match requested {
        Some(dir) if dir.exists() => dir.clone(),
        Some(dir) => {
            let fallback = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
            warn!(
                requested = %dir.display(),
                fallback = %fallback.display(),
                "Working directory missing, using fallback"
            );
            fallback
        }
        None => std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir()),
    }
}

/// Errors from supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to spawn backend {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Backend exited during startup ({report}); recent output: {}", .report.diagnostics.join(" | "))]
    StartupFailed { report: ExitReport },

    #[error("Backend process is not running")]
    NotRunning,

    #[error("Backend stdin channel closed")]
    ChannelClosed,

    #[error("Failed to serialize backend message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Supervisor task failed: {0}")]
    Monitor(String),
}
