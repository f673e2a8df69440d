//! HTTP Endpoint
//!
//! Event stream, health checks and Prometheus metrics. Used by browser
//! clients, remote relays, container orchestrators and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /api/events` - Server-Sent Events stream of every bus event
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (checks the upstream)
//! - `GET /metrics` - Prometheus metrics in text format

mod events;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use events::STREAM_KEEP_ALIVE;

use crate::domain::state::{BridgeState, CircuitState, ConnectionState};
use crate::infrastructure::bridge::EventBridge;
use crate::infrastructure::cache::{CacheStats, LocalCache};
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::resilience::{
    CircuitBreaker, CircuitBreakerSnapshot, ConnectionManager, ConnectionSnapshot,
};

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Relay version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream connection status.
    pub upstream: ConnectionSnapshot,
    /// Circuit breaker counters.
    pub breaker: CircuitBreakerSnapshot,
    /// Event bridge status.
    pub bridge: BridgeStatus,
    /// Local cache statistics.
    pub cache: CacheStats,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational.
    Healthy,
    /// Serving, but from the local cache or without live updates.
    Degraded,
    /// Upstream unavailable and refusing calls.
    Unhealthy,
}

/// Event bridge status.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    /// Selected transport.
    pub transport: &'static str,
    /// Transport state.
    pub state: BridgeState,
    /// Registered bus subscribers.
    pub subscribers: usize,
    /// Open `/api/events` streams.
    pub stream_clients: usize,
}

// =============================================================================
// Server State
// =============================================================================

/// Shared state for the HTTP server.
pub struct HttpState {
    version: String,
    started_at: Instant,
    connections: Arc<ConnectionManager>,
    breaker: Arc<CircuitBreaker>,
    bridge: Arc<EventBridge>,
    cache: Arc<LocalCache>,
    stream_clients: AtomicUsize,
    shutdown: CancellationToken,
}

impl HttpState {
    /// Create server state.
    ///
    /// Cancelling `shutdown` stops the server and ends every open event
    /// stream.
    #[must_use]
    pub fn new(
        version: String,
        connections: Arc<ConnectionManager>,
        breaker: Arc<CircuitBreaker>,
        bridge: Arc<EventBridge>,
        cache: Arc<LocalCache>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            connections,
            breaker,
            bridge,
            cache,
            stream_clients: AtomicUsize::new(0),
            shutdown,
        }
    }

    /// Open `/api/events` streams.
    #[must_use]
    pub fn stream_clients(&self) -> usize {
        self.stream_clients.load(Ordering::SeqCst)
    }

    /// Bridge serving the event stream.
    #[must_use]
    pub const fn bridge(&self) -> &Arc<EventBridge> {
        &self.bridge
    }

    /// Token that stops the server.
    #[must_use]
    pub const fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}

/// Build the router.
pub fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/api/events", get(events::events_handler))
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Server
// =============================================================================

/// Relay HTTP server.
pub struct HttpServer {
    port: u16,
    state: Arc<HttpState>,
}

impl HttpServer {
    /// Create a new server that stops on the state's shutdown token.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HttpState>) -> Self {
        Self { port, state }
    }

    /// Bind the configured port and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HttpServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HttpServerError::BindFailed(self.port, e.to_string()))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if the HTTP server fails while running.
    pub async fn serve(self, listener: TcpListener) -> Result<(), HttpServerError> {
        let port = listener.local_addr().map_or(self.port, |addr| addr.port());
        tracing::info!(port, "HTTP server listening");

        let shutdown = self.state.shutdown.clone();
        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| HttpServerError::ServerFailed(e.to_string()))?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    // Cache-only deployments have nothing to wait for.
    let is_ready = !state.connections.is_configured()
        || state.connections.state() == ConnectionState::Connected;

    if is_ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HttpState) -> HealthResponse {
    let upstream = state.connections.snapshot();
    let breaker = state.breaker.snapshot();
    let bridge = BridgeStatus {
        transport: state.bridge.transport_name(),
        state: state.bridge.state(),
        subscribers: state.bridge.registry().subscriber_count(),
        stream_clients: state.stream_clients(),
    };

    HealthResponse {
        status: determine_health_status(&upstream, breaker.state, bridge.state),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        upstream,
        breaker,
        bridge,
        cache: state.cache.stats(),
    }
}

fn determine_health_status(
    upstream: &ConnectionSnapshot,
    breaker: CircuitState,
    bridge: BridgeState,
) -> HealthStatus {
    if !upstream.configured {
        return HealthStatus::Degraded;
    }

    let connected = upstream.state == ConnectionState::Connected;
    match (connected, breaker) {
        (false, CircuitState::Open) => HealthStatus::Unhealthy,
        (true, CircuitState::Closed) if !bridge.is_degraded() => HealthStatus::Healthy,
        _ => HealthStatus::Degraded,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
