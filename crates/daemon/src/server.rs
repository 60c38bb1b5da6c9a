//! HTTP surface: the websocket endpoint and health endpoints.
//!
//! Routes:
//!
//! - `GET <server.path>`: admission, then upgrade to a terminal session
//! - `GET /healthz`: JSON liveness report
//! - `GET /readyz`: 200 once a listener is serving, 503 otherwise
//! - `GET /metrics`: Prometheus text gauges

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::admission::RateLimiter;
use crate::config::{Config, ServerConfig};
use crate::session::{AdmissionPermit, Session, SessionConfig, SessionRegistry};
use crate::shutdown::{
    ConnectionGuard, ListenerHandle, ShutdownCoordinator, ShutdownError, ShutdownReport,
};
use crate::transport::{split_upgraded, upgrade_accept_key};

/// Shared state handed to every request.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppInner>,
}

struct AppInner {
    coordinator: Arc<ShutdownCoordinator>,
    session: SessionConfig,
    server: ServerConfig,
}

impl AppState {
    /// Builds request state from the configuration.
    pub fn new(config: &Config, coordinator: Arc<ShutdownCoordinator>) -> Self {
        Self {
            inner: Arc::new(AppInner {
                coordinator,
                session: SessionConfig::from_config(config),
                server: config.server.clone(),
            }),
        }
    }
}

/// Builds the router for all endpoints.
pub fn router(state: AppState) -> Router {
    let ws_path = state.inner.server.path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// The identity rate limits are keyed on.
///
/// Proxy headers are only believed when `trust_proxy_headers` is set, since
/// any client can send them.
pub fn client_identity(headers: &HeaderMap, peer: SocketAddr, trust_proxy_headers: bool) -> String {
    if trust_proxy_headers {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }

        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = real_ip {
            return ip.to_string();
        }
    }

    peer.ip().to_string()
}

/// Whether the request's `Origin` may open a session.
///
/// An empty allow list accepts any origin; requests without an `Origin`
/// header are not from a browser and are always accepted.
pub fn origin_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }

    match headers.get(header::ORIGIN) {
        None => true,
        Some(origin) => origin
            .to_str()
            .map(|origin| allowed.iter().any(|a| a == "*" || a == origin))
            .unwrap_or(false),
    }
}

async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut request: Request,
) -> Response {
    let inner = &state.inner;
    let headers = request.headers();

    if !origin_allowed(headers, &inner.server.allowed_origins) {
        tracing::warn!(peer = %peer, origin = ?headers.get(header::ORIGIN), "Rejected origin");
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    let accept = match upgrade_accept_key(headers) {
        Ok(accept) => accept,
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "Rejected upgrade request");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let identity = client_identity(headers, peer, inner.server.trust_proxy_headers);

    let Some(guard) = inner.coordinator.connections().track() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "Shutting down").into_response();
    };

    let permit = match inner.coordinator.registry().try_admit(&identity) {
        Ok(permit) => permit,
        Err(e) => return (StatusCode::TOO_MANY_REQUESTS, e.to_string()).into_response(),
    };

    tracing::debug!(client = %identity, connection_id = guard.id(), "Upgrading connection");

    let on_upgrade = hyper::upgrade::on(&mut request);
    let state = state.clone();
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => handle_socket(TokioIo::new(upgraded), state, permit, guard).await,
            // Dropping the permit and guard releases the slot and the tracking entry
            Err(e) => tracing::warn!(error = %e, "Websocket upgrade failed"),
        }
    });

    (
        StatusCode::SWITCHING_PROTOCOLS,
        [
            (header::UPGRADE, "websocket".to_string()),
            (header::CONNECTION, "Upgrade".to_string()),
            (header::SEC_WEBSOCKET_ACCEPT, accept),
        ],
    )
        .into_response()
}

async fn handle_socket(
    io: TokioIo<hyper::upgrade::Upgraded>,
    state: AppState,
    permit: AdmissionPermit,
    guard: ConnectionGuard,
) {
    let (sink, stream) = split_upgraded(io, state.inner.server.max_message_size);
    let cancel = guard.token().child_token();

    // Spawn failures are logged by the session
    if let Ok(session) = Session::start(&state.inner.session, permit, sink, stream, cancel).await {
        session.closed().await;
    }

    drop(guard);
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.inner.coordinator.health())
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.inner.coordinator.is_ready() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Service Not Ready")
    }
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render_metrics(&state.inner.coordinator),
    )
}

/// Renders the Prometheus text exposition.
pub fn render_metrics(coordinator: &ShutdownCoordinator) -> String {
    let health = coordinator.health();
    let gauges = [
        (
            "webshell_sessions_active",
            "gauge",
            "Current number of terminal sessions",
            health.active_sessions as f64,
        ),
        (
            "webshell_sessions_max",
            "gauge",
            "Maximum number of concurrent terminal sessions",
            coordinator.registry().max_sessions() as f64,
        ),
        (
            "webshell_connections_active",
            "gauge",
            "Current number of upgraded connections",
            health.active_connections as f64,
        ),
        (
            "webshell_rate_limit_clients",
            "gauge",
            "Clients with a rate limit bucket",
            health.rate_limited_clients as f64,
        ),
        (
            "webshell_uptime_seconds",
            "counter",
            "Server uptime in seconds",
            coordinator.uptime().as_secs_f64(),
        ),
    ];

    let mut out = String::new();
    for (name, kind, help, value) in gauges {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} {kind}");
        let _ = writeln!(out, "{name} {value}");
    }
    out
}

/// The daemon: admission, sessions, listeners and shutdown wired together.
pub struct WebShellServer {
    config: Config,
    coordinator: Arc<ShutdownCoordinator>,
}

impl WebShellServer {
    /// Builds the service objects from `config`. Nothing runs yet.
    pub fn new(config: Config) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            config.limits.rate_per_sec,
            config.limits.burst,
        ));
        let registry = Arc::new(SessionRegistry::new(config.limits.max_sessions, limiter));
        let coordinator = Arc::new(ShutdownCoordinator::new(registry));

        Self {
            config,
            coordinator,
        }
    }

    /// The shutdown coordinator.
    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }

    /// Binds the configured address and starts serving.
    ///
    /// Returns the bound address, useful when listening on port 0.
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.config.server.listen)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.server.listen))?;
        let addr = listener
            .local_addr()
            .context("Failed to read bound address")?;

        Arc::clone(self.coordinator.registry().limiter()).spawn_sweeper(
            self.config.limits.sweep_interval(),
            self.config.limits.bucket_idle(),
            self.coordinator.token(),
        );

        let app = router(AppState::new(&self.config, Arc::clone(&self.coordinator)));
        let token = CancellationToken::new();
        let graceful = token.clone();

        let task = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { graceful.cancelled().await })
            .await
        });

        self.coordinator
            .register_listener(ListenerHandle { addr, token, task });

        tracing::info!(
            addr = %addr,
            path = %self.config.server.path,
            shell = %self.config.shell.command,
            "WebShell listening"
        );

        Ok(addr)
    }

    /// Shuts down within the configured timeout.
    pub async fn shutdown(&self) -> Result<ShutdownReport, ShutdownError> {
        self.coordinator
            .shutdown(self.config.shutdown.timeout())
            .await
    }
}
