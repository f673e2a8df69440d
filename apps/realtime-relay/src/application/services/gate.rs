//! Upstream Gate
//!
//! Runs one upstream operation behind the circuit breaker and the
//! connection manager, with a fixed deadline. Every service that talks to the
//! upstream goes through here so failure accounting is uniform: a denied
//! call records nothing, a failed attempt records exactly one breaker
//! failure.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::application::ports::{UpstreamError, UpstreamHandle};
use crate::infrastructure::metrics::{self, Outcome};
use crate::infrastructure::resilience::{AcquireError, CircuitBreaker, ConnectionManager};

/// Default per-operation deadline.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a gated operation produced no value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GateError {
    /// The breaker refused the call.
    #[error("circuit breaker open")]
    CircuitOpen,

    /// No connection was available and none was attempted.
    #[error("upstream unavailable: {0}")]
    Unavailable(AcquireError),

    /// The operation or its connection attempt failed.
    #[error("upstream operation failed: {0}")]
    Failed(UpstreamError),
}

impl GateError {
    /// Whether the upstream was actually contacted.
    #[must_use]
    pub const fn was_attempted(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Breaker + connection gating for upstream operations.
#[derive(Debug, Clone)]
pub struct UpstreamGate {
    breaker: Arc<CircuitBreaker>,
    connections: Arc<ConnectionManager>,
    operation_timeout: Duration,
}

impl UpstreamGate {
    /// Create a gate.
    #[must_use]
    pub const fn new(
        breaker: Arc<CircuitBreaker>,
        connections: Arc<ConnectionManager>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            breaker,
            connections,
            operation_timeout,
        }
    }

    /// The breaker guarding this gate.
    #[must_use]
    pub const fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The connection manager behind this gate.
    #[must_use]
    pub const fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Run `op` against the upstream connection.
    ///
    /// # Errors
    ///
    /// Returns [`GateError`] when the breaker refuses, no connection is
    /// available, or the operation fails or times out.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T, GateError>
    where
        F: FnOnce(UpstreamHandle) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        if !self.breaker.can_request() {
            metrics::record_upstream_operation(operation, Outcome::Denied);
            tracing::trace!(operation, "Upstream call refused by circuit breaker");
            return Err(GateError::CircuitOpen);
        }

        let handle = match self.connections.acquire().await {
            Ok(handle) => handle,
            Err(AcquireError::ConnectFailed(error)) => {
                self.breaker.record_failure(&error);
                metrics::record_upstream_operation(operation, Outcome::Failure);
                return Err(GateError::Failed(error));
            }
            Err(refusal) => {
                metrics::record_upstream_operation(operation, Outcome::Denied);
                tracing::trace!(operation, reason = %refusal, "Upstream connection unavailable");
                return Err(GateError::Unavailable(refusal));
            }
        };

        let started = Instant::now();
        let result = tokio::time::timeout(self.operation_timeout, op(handle.clone()))
            .await
            .unwrap_or_else(|_| Err(UpstreamError::Timeout(self.operation_timeout)));
        metrics::record_upstream_duration(operation, started.elapsed());

        match result {
            Ok(value) => {
                self.breaker.record_success();
                metrics::record_upstream_operation(operation, Outcome::Success);
                Ok(value)
            }
            Err(error) => {
                tracing::warn!(operation, error = %error, "Upstream operation failed");
                self.connections.report_failure(&handle, &error);
                self.breaker.record_failure(&error);
                metrics::record_upstream_operation(operation, Outcome::Failure);
                Err(GateError::Failed(error))
            }
        }
    }
}
