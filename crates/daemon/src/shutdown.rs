//! Connection tracking and coordinated shutdown.
//!
//! Upgraded websocket connections outlive the HTTP server's own graceful
//! shutdown, so they are tracked here separately. Shutdown runs in three
//! steps against one deadline: cancel every session, close tracked
//! connections and wait for them to drain, then stop every listener
//! concurrently.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::session::SessionRegistry;

/// Identifier of a tracked connection.
pub type ConnectionId = u64;

/// Errors reported by [`ShutdownCoordinator::shutdown`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ShutdownError {
    /// The deadline passed before everything stopped.
    #[error(
        "shutdown timed out after {deadline:?} with {pending_connections} connections and {pending_listeners} listeners still open"
    )]
    Timeout {
        /// The timeout shutdown was given.
        deadline: Duration,
        /// Connections still tracked at the deadline.
        pending_connections: usize,
        /// Listeners aborted at the deadline.
        pending_listeners: usize,
    },
}

/// Tracks upgraded connections until their handlers return.
pub struct ConnectionTracker {
    connections: DashMap<ConnectionId, CancellationToken>,
    next_id: AtomicU64,
    closed: AtomicBool,
    drained: Notify,
}

/// Keeps a connection tracked while alive.
pub struct ConnectionGuard {
    id: ConnectionId,
    token: CancellationToken,
    tracker: Arc<ConnectionTracker>,
}

impl ConnectionGuard {
    /// The connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Cancelled when the connection must close.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.untrack(self.id);
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            drained: Notify::new(),
        }
    }

    /// Starts tracking a connection. Returns `None` once shutdown has begun.
    pub fn track(self: &Arc<Self>) -> Option<ConnectionGuard> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.connections.insert(id, token.clone());

        // Shutdown may have started between the check and the insert
        if self.closed.load(Ordering::SeqCst) {
            token.cancel();
        }

        Some(ConnectionGuard {
            id,
            token,
            tracker: Arc::clone(self),
        })
    }

    /// Whether a connection is still tracked.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Number of tracked connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Refuses new connections and cancels every tracked one.
    pub fn close_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let tokens: Vec<CancellationToken> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for token in &tokens {
            token.cancel();
        }
        tokens.len()
    }

    /// Waits until no connection is tracked.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.connections.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn untrack(&self, id: ConnectionId) {
        self.connections.remove(&id);
        if self.connections.is_empty() {
            self.drained.notify_waiters();
        }
    }
}

/// A running listener registered for shutdown.
pub struct ListenerHandle {
    /// Bound address.
    pub addr: SocketAddr,
    /// Cancelled to begin the listener's graceful shutdown.
    pub token: CancellationToken,
    /// The serving task.
    pub task: JoinHandle<io::Result<()>>,
}

/// Outcome of a shutdown that finished in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sessions signalled to close.
    pub sessions_cancelled: usize,
    /// Connections cancelled and drained.
    pub connections_closed: usize,
    /// Listeners that stopped gracefully.
    pub listeners_stopped: usize,
}

/// Liveness data for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Always `"healthy"` while the process answers.
    pub status: &'static str,
    /// Live sessions.
    pub active_sessions: usize,
    /// Tracked upgraded connections.
    pub active_connections: usize,
    /// Clients with a rate limit bucket.
    pub rate_limited_clients: usize,
    /// Registered listeners.
    pub listeners: usize,
    /// Seconds since startup.
    pub uptime_secs: u64,
    /// Daemon version.
    pub version: &'static str,
}

/// Owns the shutdown sequence for sessions, connections and listeners.
pub struct ShutdownCoordinator {
    registry: Arc<SessionRegistry>,
    connections: Arc<ConnectionTracker>,
    listeners: Mutex<Vec<ListenerHandle>>,
    /// Cancelled at shutdown for background tasks.
    token: CancellationToken,
    started: Instant,
}

impl ShutdownCoordinator {
    /// Creates a coordinator over `registry`.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            connections: Arc::new(ConnectionTracker::new()),
            listeners: Mutex::new(Vec::new()),
            token: CancellationToken::new(),
            started: Instant::now(),
        }
    }

    /// The session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The connection tracker.
    pub fn connections(&self) -> &Arc<ConnectionTracker> {
        &self.connections
    }

    /// Token cancelled when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Adds a listener to stop on shutdown.
    pub fn register_listener(&self, listener: ListenerHandle) {
        tracing::info!(addr = %listener.addr, "Listener registered");
        self.lock_listeners().push(listener);
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.lock_listeners().len()
    }

    /// Ready once at least one listener is serving.
    pub fn is_ready(&self) -> bool {
        self.listener_count() > 0 && !self.token.is_cancelled()
    }

    /// Time since the coordinator was created.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Current counts for the health endpoint.
    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "healthy",
            active_sessions: self.registry.count(),
            active_connections: self.connections.count(),
            rate_limited_clients: self.registry.limiter().client_count(),
            listeners: self.listener_count(),
            uptime_secs: self.uptime().as_secs(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Stops everything within `timeout`.
    ///
    /// Always returns by the deadline. Listeners that have not stopped by
    /// then are aborted.
    pub async fn shutdown(&self, timeout: Duration) -> Result<ShutdownReport, ShutdownError> {
        let deadline = tokio::time::Instant::now() + timeout;

        tracing::info!(
            sessions = self.registry.count(),
            connections = self.connections.count(),
            listeners = self.listener_count(),
            "Starting graceful shutdown"
        );

        self.token.cancel();

        let sessions_cancelled = self.registry.cancel_all();
        tracing::debug!(sessions = sessions_cancelled, "Cancelled sessions");

        let connections_closed = self.connections.close_all();
        let drained = tokio::time::timeout_at(deadline, self.connections.wait_drained())
            .await
            .is_ok();
        if !drained {
            tracing::warn!(
                pending = self.connections.count(),
                "Connections still open at shutdown deadline"
            );
        }

        let listeners: Vec<ListenerHandle> = std::mem::take(&mut *self.lock_listeners());
        let listeners_total = listeners.len();
        for listener in &listeners {
            listener.token.cancel();
        }

        let stopped = join_all(listeners.into_iter().map(|listener| async move {
            let ListenerHandle { addr, task, .. } = listener;
            let abort = task.abort_handle();
            match tokio::time::timeout_at(deadline, task).await {
                Ok(Ok(Ok(()))) => {
                    tracing::debug!(addr = %addr, "Listener stopped");
                    true
                }
                Ok(Ok(Err(e))) => {
                    tracing::warn!(addr = %addr, error = %e, "Listener stopped with error");
                    true
                }
                Ok(Err(e)) => {
                    tracing::warn!(addr = %addr, error = %e, "Listener task failed");
                    true
                }
                Err(_) => {
                    tracing::warn!(addr = %addr, "Listener did not stop in time");
                    abort.abort();
                    false
                }
            }
        }))
        .await;

        let listeners_stopped = stopped.iter().filter(|ok| **ok).count();
        let pending_listeners = listeners_total - listeners_stopped;

        if !drained || pending_listeners > 0 {
            return Err(ShutdownError::Timeout {
                deadline: timeout,
                pending_connections: self.connections.count(),
                pending_listeners,
            });
        }

        tracing::info!(
            sessions = sessions_cancelled,
            connections = connections_closed,
            listeners = listeners_stopped,
            "Shutdown complete"
        );

        Ok(ShutdownReport {
            sessions_cancelled,
            connections_closed,
            listeners_stopped,
        })
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<ListenerHandle>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
