//! # WebShell Daemon Library
//!
//! This crate bridges browser terminals to real shells. Each websocket
//! connection gets its own pseudo-terminal process; bytes flow both ways as
//! protocol frames until either side goes away.
//!
//! ## Overview
//!
//! - **Admission**: per-client token buckets and a cap on concurrent sessions
//! - **Sessions**: PTY process, batched outbound writer and four tasks that
//!   shut down together exactly once
//! - **Shutdown**: drains sessions, connections and listeners within a deadline
//! - **HTTP surface**: websocket endpoint plus health, readiness and metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 HTTP surface (axum)                     │
//! │   /ws/pty   /healthz   /readyz   /metrics               │
//! ├──────────────────────┬──────────────────────────────────┤
//! │  Admission           │  Shutdown coordinator            │
//! │  (rate limiter,      │  (connection tracker,            │
//! │   session registry)  │   listeners)                     │
//! ├──────────────────────┴──────────────────────────────────┤
//! │  Session bridge                                         │
//! │  pump_output  pump_input  wait_exit  flush_loop         │
//! ├──────────────────────┬──────────────────────────────────┤
//! │  PtyProcess          │  BufferedFrameWriter → transport │
//! └──────────────────────┴──────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use webshell_daemon::{Config, WebShellServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let server = WebShellServer::new(config);
//!     let addr = server.start().await?;
//!     println!("listening on {addr}");
//!
//!     tokio::signal::ctrl_c().await?;
//!     let _ = server.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`admission`]: Token buckets and the rate limiter
//! - [`session`]: PTY process, frame writer, session bridge and registry
//! - [`transport`]: Transport-neutral message channel
//! - [`shutdown`]: Connection tracking and coordinated shutdown
//! - [`server`]: HTTP routes and the daemon entry point

pub mod admission;
pub mod config;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod transport;

// Re-export protocol for convenience
pub use webshell_protocol as protocol;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export admission types for convenience
pub use admission::{AdmissionError, RateLimiter, TokenBucket};

// Re-export session types for convenience
pub use session::{
    AdmissionPermit, BufferedFrameWriter, CloseReason, PtyCommand, PtyError, PtyProcess, Session,
    SessionConfig, SessionError, SessionId, SessionInfo, SessionRegistry, SessionState,
    WriterError,
};

// Re-export shutdown types for convenience
pub use shutdown::{
    ConnectionTracker, HealthReport, ListenerHandle, ShutdownCoordinator, ShutdownError,
    ShutdownReport,
};

// Re-export server types for convenience
pub use server::{router, AppState, WebShellServer};
