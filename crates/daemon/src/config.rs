//! Configuration management for the WebShell daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/webshell/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default listen address for the HTTP surface.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

/// Default websocket path for terminal sessions.
pub const DEFAULT_WS_PATH: &str = "/ws/pty";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen must be a socket address like 127.0.0.1:8080, got {0}")]
    InvalidListen(String),

    #[error("path must start with '/', got {0}")]
    InvalidPath(String),

    #[error("shell command does not exist: {0}")]
    InvalidShellPath(String),

    #[error("initial terminal size must be non-zero, got {rows}x{cols}")]
    InvalidTerminalSize { rows: u16, cols: u16 },

    #[error("max_sessions must be between 1 and 10000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("rate_per_sec must be a positive number, got {0}")]
    InvalidRate(f64),

    #[error("burst must be at least 1, got {0}")]
    InvalidBurst(u32),

    #[error("buffer_size ({buffer_size}) must be at least twice immediate_threshold ({threshold})")]
    InvalidBufferSize { buffer_size: usize, threshold: usize },

    #[error("flush_interval_ms must be between 1 and 1000, got {0}")]
    InvalidFlushInterval(u64),

    #[error("shutdown timeout_secs must be between 1 and 3600, got {0}")]
    InvalidShutdownTimeout(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the WebShell daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// HTTP and websocket surface.
    pub server: ServerConfig,

    /// Shell process configuration.
    pub shell: ShellConfig,

    /// Admission control limits.
    pub limits: LimitsConfig,

    /// Outbound write batching.
    pub writer: WriterConfig,

    /// Graceful shutdown.
    pub shutdown: ShutdownConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// HTTP surface configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen: String,

    /// Request path that upgrades to a terminal session.
    pub path: String,

    /// Origins allowed to open sessions. Empty means any origin.
    pub allowed_origins: Vec<String>,

    /// Take the client identity from `X-Forwarded-For` / `X-Real-IP`.
    pub trust_proxy_headers: bool,

    /// Largest inbound websocket message accepted, in bytes.
    pub max_message_size: usize,
}

/// Shell process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShellConfig {
    /// Program to run for each session.
    pub command: String,

    /// Arguments passed to the program.
    pub args: Vec<String>,

    /// Working directory. Defaults to the daemon's own.
    pub working_dir: Option<PathBuf>,

    /// Rows of the terminal before the client sends a resize.
    pub initial_rows: u16,

    /// Columns of the terminal before the client sends a resize.
    pub initial_cols: u16,

    /// Close sessions with no inbound traffic for this long (0 = never).
    pub idle_timeout_secs: u64,
}

/// Admission control configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Token refill rate per client, in sessions per second.
    pub rate_per_sec: f64,

    /// Token bucket capacity per client.
    pub burst: u32,

    /// Forget client buckets idle for this long.
    pub bucket_idle_secs: u64,

    /// How often idle buckets are swept.
    pub sweep_interval_secs: u64,
}

/// Outbound write batching configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WriterConfig {
    /// Capacity of the per-session outbound buffer in bytes.
    pub buffer_size: usize,

    /// Period of the background flush.
    pub flush_interval_ms: u64,

    /// Payloads shorter than this are flushed at once.
    pub immediate_threshold: usize,
}

/// Graceful shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Deadline for draining sessions, connections and listeners.
    pub timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            path: DEFAULT_WS_PATH.to_string(),
            allowed_origins: Vec::new(),
            trust_proxy_headers: false,
            max_message_size: 64 * 1024,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            command: default_shell(),
            args: Vec::new(),
            working_dir: None,
            initial_rows: 24,
            initial_cols: 80,
            idle_timeout_secs: 0,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            rate_per_sec: 10.0,
            burst: 20,
            bucket_idle_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            flush_interval_ms: 10,
            immediate_threshold: 64,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl ShellConfig {
    /// Idle timeout, `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

impl LimitsConfig {
    /// Idle age after which a client bucket may be forgotten.
    pub fn bucket_idle(&self) -> Duration {
        Duration::from_secs(self.bucket_idle_secs)
    }

    /// Period of the idle bucket sweep.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl WriterConfig {
    /// Period of the background flush.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl ShutdownConfig {
    /// Deadline for graceful shutdown.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("webshell")
        .join("config.toml")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - WEBSHELL_LISTEN: Override the listen address
    /// - WEBSHELL_SHELL: Override the shell command
    /// - WEBSHELL_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var("WEBSHELL_LISTEN") {
            if !listen.is_empty() {
                tracing::info!("Overriding listen address from environment: {}", listen);
                self.server.listen = listen;
            }
        }

        if let Ok(shell) = std::env::var("WEBSHELL_SHELL") {
            if !shell.is_empty() {
                tracing::info!("Overriding shell from environment: {}", shell);
                self.shell.command = shell;
            }
        }

        if let Ok(level) = std::env::var("WEBSHELL_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListen(self.server.listen.clone()));
        }

        if !self.server.path.starts_with('/') {
            return Err(ConfigError::InvalidPath(self.server.path.clone()));
        }

        // Absolute shell paths must exist, bare names must resolve on PATH
        let shell_path = Path::new(&self.shell.command);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(self.shell.command.clone()));
            }
        } else if which::which(&self.shell.command).is_err() {
            return Err(ConfigError::InvalidShellPath(self.shell.command.clone()));
        }

        if self.shell.initial_rows == 0 || self.shell.initial_cols == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                rows: self.shell.initial_rows,
                cols: self.shell.initial_cols,
            });
        }

        if self.limits.max_sessions < 1 || self.limits.max_sessions > 10_000 {
            return Err(ConfigError::InvalidMaxSessions(self.limits.max_sessions));
        }

        if !(self.limits.rate_per_sec.is_finite() && self.limits.rate_per_sec > 0.0) {
            return Err(ConfigError::InvalidRate(self.limits.rate_per_sec));
        }

        if self.limits.burst < 1 {
            return Err(ConfigError::InvalidBurst(self.limits.burst));
        }

        if self.writer.buffer_size < 2 * self.writer.immediate_threshold {
            return Err(ConfigError::InvalidBufferSize {
                buffer_size: self.writer.buffer_size,
                threshold: self.writer.immediate_threshold,
            });
        }

        if self.writer.flush_interval_ms < 1 || self.writer.flush_interval_ms > 1000 {
            return Err(ConfigError::InvalidFlushInterval(
                self.writer.flush_interval_ms,
            ));
        }

        if self.shutdown.timeout_secs < 1 || self.shutdown.timeout_secs > 3600 {
            return Err(ConfigError::InvalidShutdownTimeout(self.shutdown.timeout_secs));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
