//! Settings resolution for tether.
//!
//! Implements hierarchical settings resolution:
//! 1. Built-in defaults
//! 2. Settings file (explicit path, else ~/.config/tether/settings.json)
//! 3. Environment variables
//! 4. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete tether settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub daemon: DaemonSettings,
    pub backend: BackendSettings,
    pub protocol: ProtocolSettings,
}

/// Daemon-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonSettings {
    /// WebSocket listen address.
    pub listen_addr: String,
    /// Stable session identifier reported in `welcome`. Generated when unset.
    pub server_id: Option<String>,
    pub log_level: String,
    pub log_json: bool,
    /// Largest client frame accepted.
    pub max_frame_bytes: usize,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7780".to_string(),
            server_id: None,
            log_level: "info".to_string(),
            log_json: false,
            max_frame_bytes: 10 * 1024 * 1024, // 10 MB
        }
    }
}

/// Supervised backend process settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendSettings {
    pub program: String,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    /// Command used to fetch the full session state at handshake.
    pub state_command: String,
    /// Command used to fetch the full message history at handshake.
    pub history_command: String,
    /// Window after spawn in which a nonzero exit is a startup failure.
    pub startup_grace_ms: u64,
    /// Wait between SIGINT and SIGKILL on shutdown.
    pub terminate_timeout_secs: u64,
    /// Recent stderr lines kept for diagnostics.
    pub diagnostic_lines: usize,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            program: "pi".to_string(),
            args: vec!["--mode".to_string(), "rpc".to_string()],
            working_directory: None,
            state_command: "get_state".to_string(),
            history_command: "get_messages".to_string(),
            startup_grace_ms: 500,
            terminate_timeout_secs: 5,
            diagnostic_lines: 50,
        }
    }
}

impl BackendSettings {
    pub const fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

/// Client protocol timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProtocolSettings {
    /// Timeout for internal gateway → backend requests.
    pub request_timeout_secs: u64,
    /// Timeout before an unanswered dialog resolves to its default.
    pub dialog_timeout_secs: u64,
    /// Client silence after which the connection is considered gone.
    pub idle_timeout_secs: u64,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            dialog_timeout_secs: 60,
            idle_timeout_secs: 90,
        }
    }
}

impl ProtocolSettings {
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub const fn dialog_timeout(&self) -> Duration {
        Duration::from_secs(self.dialog_timeout_secs)
    }

    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Load settings with hierarchical resolution.
///
/// An explicit `path` must exist; the global file is optional.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let mut settings = match path {
        Some(p) => load_settings_file(p)?,
        None => match global_settings_path() {
            Some(global) if global.exists() => load_settings_file(&global)?,
            _ => Settings::default(),
        },
    };

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

/// Get the global settings file path.
pub fn global_settings_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".tether").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/tether/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("tether").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_settings_file(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read settings file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse settings file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(val) = var("TETHER_LISTEN_ADDR") {
        settings.daemon.listen_addr = val;
    }
    if let Some(val) = var("TETHER_SERVER_ID") {
        settings.daemon.server_id = Some(val);
    }
    if let Some(val) = var("TETHER_LOG_LEVEL") {
        settings.daemon.log_level = val;
    }
    if let Some(val) = var("TETHER_BACKEND_PROGRAM") {
        settings.backend.program = val;
    }
    if let Some(n) = var("TETHER_REQUEST_TIMEOUT").and_then(|v| v.parse().ok()) {
        settings.protocol.request_timeout_secs = n;
    }
    if let Some(n) = var("TETHER_DIALOG_TIMEOUT").and_then(|v| v.parse().ok()) {
        settings.protocol.dialog_timeout_secs = n;
    }
    if let Some(n) = var("TETHER_IDLE_TIMEOUT").and_then(|v| v.parse().ok()) {
        settings.protocol.idle_timeout_secs = n;
    }
}
