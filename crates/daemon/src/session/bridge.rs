//! The bridge between one connection and one shell.
//!
//! A session runs four tasks:
//!
//! - `pump_output`: PTY output to the connection, as `Data` frames
//! - `pump_input`: connection messages to the PTY, binary or legacy text
//! - `wait_exit`: waits for the shell to exit
//! - `flush_loop`: periodic flush of the outbound buffer
//!
//! Whichever task finishes first calls [`Session::close`]. The first call
//! moves the session to `Closing` and cancels the shared token, which stops
//! the remaining tasks. Later calls return immediately.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webshell_protocol::{Frame, FrameCodec, FrameKind, ProtocolError, TerminalSize};

use super::pty::{PtyCommand, PtyError, PtyProcess};
use super::registry::{AdmissionPermit, SessionRegistry};
use super::writer::BufferedFrameWriter;
use crate::config::{Config, WriterConfig};
use crate::transport::{MessageSink, MessageStream, WsMessage};

/// How long output is still forwarded after the shell exits.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that prevent a session from starting.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The shell could not be started.
    #[error("failed to start shell: {0}")]
    SpawnFailed(#[from] PtyError),
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Spawning the shell and registering.
    Starting,
    /// Tasks are running.
    Running,
    /// Releasing resources.
    Closing,
    /// Finished. Terminal state.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// What ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent a close message or hung up.
    ClientClosed,
    /// Reading from or writing to the connection failed.
    TransportError,
    /// The shell exited.
    ProcessExited,
    /// The PTY reached end of file.
    PtyEof,
    /// Reading from or writing to the PTY failed.
    PtyError,
    /// No input arrived within the idle timeout.
    IdleTimeout,
    /// Cancelled from outside, usually by shutdown.
    Cancelled,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::ClientClosed => "client closed",
            CloseReason::TransportError => "transport error",
            CloseReason::ProcessExited => "process exited",
            CloseReason::PtyEof => "pty eof",
            CloseReason::PtyError => "pty error",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Shell to run.
    pub command: PtyCommand,
    /// Outbound batching.
    pub writer: WriterConfig,
    /// Close after this long without input.
    pub idle_timeout: Option<Duration>,
}

impl SessionConfig {
    /// Builds session settings from the daemon configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            command: PtyCommand {
                program: config.shell.command.clone(),
                args: config.shell.args.clone(),
                cwd: config.shell.working_dir.clone(),
                size: TerminalSize::new(config.shell.initial_rows, config.shell.initial_cols),
            },
            writer: config.writer.clone(),
            idle_timeout: config.shell.idle_timeout(),
        }
    }
}

/// Snapshot of a session for listing.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Session ID.
    pub id: SessionId,
    /// Client identity the session was admitted for.
    pub identity: String,
    /// Shell process ID, if known.
    pub pid: Option<u32>,
    /// Current terminal geometry.
    pub size: TerminalSize,
    /// Lifecycle state at snapshot time.
    pub state: SessionState,
    /// When the session started.
    pub started_at: SystemTime,
    /// Time since the last input or output.
    pub idle: Duration,
}

/// One interactive shell bound to one connection.
pub struct Session {
    id: SessionId,
    identity: String,
    pty: PtyProcess,
    writer: BufferedFrameWriter,
    codec: FrameCodec,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
    started_at: SystemTime,
    last_activity: Mutex<Instant>,
    registry: Arc<SessionRegistry>,
    idle_timeout: Option<Duration>,
    flush_interval: Duration,
}

impl Session {
    /// Spawns the shell, registers the session and starts its tasks.
    ///
    /// `cancel` is the session's own token, normally a child of the
    /// connection's. When the shell cannot be started the connection is
    /// closed, the permit's slot is released and nothing is registered.
    pub async fn start(
        config: &SessionConfig,
        permit: AdmissionPermit,
        sink: MessageSink,
        stream: MessageStream,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, SessionError> {
        let writer = BufferedFrameWriter::new(sink, &config.writer);

        let pty = match PtyProcess::spawn(&config.command) {
            Ok(pty) => pty,
            Err(e) => {
                tracing::error!(
                    client = %permit.identity(),
                    shell = %config.command.program,
                    error = %e,
                    "Failed to spawn shell"
                );
                if let Err(e) = writer.close().await {
                    tracing::debug!(error = %e, "Failed to close connection");
                }
                return Err(SessionError::SpawnFailed(e));
            }
        };

        let (state, _) = watch::channel(SessionState::Starting);
        let registry = Arc::clone(permit.registry());

        let session = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            identity: permit.identity().to_string(),
            pty,
            writer,
            codec: FrameCodec::new(),
            cancel,
            state,
            started_at: SystemTime::now(),
            last_activity: Mutex::new(Instant::now()),
            registry: Arc::clone(&registry),
            idle_timeout: config.idle_timeout,
            flush_interval: config.writer.flush_interval(),
        });

        registry.register(permit, Arc::clone(&session));
        session.state.send_replace(SessionState::Running);

        tracing::info!(
            session_id = %session.id,
            client = %session.identity,
            pid = ?session.pty.pid(),
            "Session started"
        );

        tokio::spawn(Arc::clone(&session).pump_output());
        tokio::spawn(Arc::clone(&session).pump_input(stream));
        tokio::spawn(Arc::clone(&session).wait_exit());
        tokio::spawn(Arc::clone(&session).flush_loop());

        Ok(session)
    }

    /// Returns the session ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the client identity the session was admitted for.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Time since the last inbound message or outbound output.
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Returns a snapshot for listing.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            identity: self.identity.clone(),
            pid: self.pty.pid(),
            size: self.pty.size(),
            state: self.state(),
            started_at: self.started_at,
            idle: self.idle_for(),
        }
    }

    /// Asks the session to shut down. The flush loop performs the close.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits until the session reaches [`SessionState::Closed`].
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    /// Tears the session down. Only the first call does anything.
    ///
    /// Order: cancel the tasks, kill the shell, release the PTY handles,
    /// flush and close the connection, leave the registry. Killing first makes
    /// a PTY write stuck on a full input queue fail.
    pub async fn close(&self, reason: CloseReason) {
        let first = self.state.send_if_modified(|state| match state {
            SessionState::Closing | SessionState::Closed => false,
            _ => {
                *state = SessionState::Closing;
                true
            }
        });
        if !first {
            return;
        }

        tracing::info!(session_id = %self.id, reason = %reason, "Closing session");

        self.cancel.cancel();
        self.pty.terminate();
        self.pty.close();

        if let Err(e) = self.writer.close().await {
            tracing::debug!(session_id = %self.id, error = %e, "Connection close failed");
        }

        self.registry.unregister(&self.id);
        self.state.send_replace(SessionState::Closed);

        tracing::info!(
            session_id = %self.id,
            client = %self.identity,
            duration_ms = self.started_at.elapsed().map(|d| d.as_millis()).unwrap_or(0) as u64,
            "Session closed"
        );
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    async fn pump_output(self: Arc<Self>) {
        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return,
                chunk = self.pty.read_chunk() => chunk,
            };

            let data = match chunk {
                Ok(Some(data)) => data,
                Ok(None) => {
                    tracing::debug!(session_id = %self.id, "PTY reached EOF");
                    self.close(CloseReason::PtyEof).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(session_id = %self.id, error = %e, "PTY read failed");
                    self.close(CloseReason::PtyError).await;
                    return;
                }
            };

            self.touch();

            let written = tokio::select! {
                _ = self.cancel.cancelled() => return,
                written = self.writer.write(Frame::data(data)) => written,
            };
            if let Err(e) = written {
                tracing::debug!(session_id = %self.id, error = %e, "Output write failed");
                self.close(CloseReason::TransportError).await;
                return;
            }
        }
    }

    async fn pump_input(self: Arc<Self>, mut stream: MessageStream) {
        loop {
            let next = async {
                match self.idle_timeout {
                    Some(limit) => tokio::time::timeout(limit, stream.next()).await.ok(),
                    None => Some(stream.next().await),
                }
            };

            let message = tokio::select! {
                _ = self.cancel.cancelled() => return,
                message = next => message,
            };

            let reason = match message {
                None => {
                    tracing::info!(session_id = %self.id, "Session idle timeout");
                    CloseReason::IdleTimeout
                }
                Some(None) => CloseReason::ClientClosed,
                Some(Some(Err(e))) => {
                    tracing::debug!(session_id = %self.id, error = %e, "Connection read failed");
                    CloseReason::TransportError
                }
                Some(Some(Ok(message))) => {
                    self.touch();
                    match self.handle_message(message).await {
                        Ok(()) => continue,
                        Err(reason) => reason,
                    }
                }
            };

            self.close(reason).await;
            return;
        }
    }

    async fn handle_message(&self, message: WsMessage) -> Result<(), CloseReason> {
        let decoded = match message {
            WsMessage::Binary(bytes) => self.codec.decode(&bytes),
            WsMessage::Text(bytes) => self.codec.decode_legacy_text(&bytes),
            WsMessage::Close => return Err(CloseReason::ClientClosed),
            WsMessage::Ping(data) => {
                return self
                    .writer
                    .send_message(WsMessage::Pong(data))
                    .await
                    .map_err(|e| {
                        tracing::debug!(session_id = %self.id, error = %e, "Pong write failed");
                        CloseReason::TransportError
                    });
            }
            WsMessage::Pong(_) => return Ok(()),
        };

        self.dispatch(decoded).await
    }

    async fn dispatch(&self, decoded: Result<Frame, ProtocolError>) -> Result<(), CloseReason> {
        let frame = match decoded {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(session_id = %self.id, error = %e, "Dropping malformed frame");
                return Ok(());
            }
        };

        match frame.kind {
            FrameKind::Data => {
                let written = tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    written = self.pty.write(&frame.payload) => written,
                };
                written.map_err(|e| {
                    tracing::warn!(session_id = %self.id, error = %e, "PTY write failed");
                    CloseReason::PtyError
                })
            }
            FrameKind::Resize => {
                if let Some(size) = frame.terminal_size() {
                    if let Err(e) = self.pty.resize(size) {
                        tracing::warn!(
                            session_id = %self.id,
                            rows = size.rows,
                            cols = size.cols,
                            error = %e,
                            "Failed to resize terminal"
                        );
                    }
                }
                Ok(())
            }
            FrameKind::Ping => self.writer.write(Frame::pong()).await.map_err(|e| {
                tracing::debug!(session_id = %self.id, error = %e, "Pong write failed");
                CloseReason::TransportError
            }),
            FrameKind::Pong => {
                tracing::trace!(session_id = %self.id, "Received pong");
                Ok(())
            }
        }
    }

    async fn wait_exit(self: Arc<Self>) {
        let status = tokio::select! {
            _ = self.cancel.cancelled() => return,
            status = self.pty.wait() => status,
        };

        match status {
            Ok(code) => tracing::info!(session_id = %self.id, exit_code = code, "Shell exited"),
            Err(e) => tracing::warn!(session_id = %self.id, error = %e, "Failed to wait for shell"),
        }

        // Let the output pump forward what the shell printed last
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(EXIT_DRAIN_GRACE) => {}
        }

        self.close(CloseReason::ProcessExited).await;
    }

    async fn flush_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.writer.flush().await {
                        tracing::debug!(session_id = %self.id, error = %e, "Periodic flush failed");
                        self.close(CloseReason::TransportError).await;
                        return;
                    }
                }
            }
        }

        self.close(CloseReason::Cancelled).await;
    }
}
