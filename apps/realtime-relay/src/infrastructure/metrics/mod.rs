//! Prometheus Metrics Module
//!
//! Exposes relay metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Cache**: Local cache hits and misses
//! - **Upstream**: Operations by outcome, connection attempts and state
//! - **Breaker**: State and transitions
//! - **Bridge**: Events received and dropped, reconnects, state
//! - **Clients**: SSE stream clients and bus subscribers
//! - **Tasks**: Background task outcomes
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the HTTP server port. Recording before
//! [`init_metrics`] is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::events::EventKind;
use crate::domain::state::{BridgeState, CircuitState, ConnectionState};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Cache
    describe_counter!(
        "relay_local_cache_lookups_total",
        "Local cache lookups by result"
    );

    // Upstream
    describe_counter!(
        "relay_upstream_operations_total",
        "Upstream operations by operation and outcome"
    );
    describe_histogram!(
        "relay_upstream_operation_seconds",
        "Upstream operation latency"
    );
    describe_counter!(
        "relay_connection_attempts_total",
        "Upstream connection attempts by result"
    );
    describe_gauge!(
        "relay_connection_state",
        "Connection manager state (0=disconnected, 1=connecting, 2=connected, 3=suspended)"
    );

    // Breaker
    describe_gauge!(
        "relay_circuit_state",
        "Circuit breaker state (0=closed, 1=half_open, 2=open)"
    );
    describe_counter!(
        "relay_circuit_transitions_total",
        "Circuit breaker transitions by target state"
    );

    // Bridge
    describe_counter!(
        "relay_bridge_events_received_total",
        "Events re-emitted on the local bus by kind"
    );
    describe_counter!(
        "relay_bridge_events_dropped_total",
        "Inbound messages dropped by reason"
    );
    describe_counter!(
        "relay_bridge_reconnects_total",
        "Bridge reconnection attempts by transport"
    );
    describe_gauge!(
        "relay_bridge_state",
        "Bridge state (0=idle, 1=connecting, 2=connected, 3=disconnected, 4=suspended)"
    );

    // Clients
    describe_gauge!("relay_stream_clients", "Active SSE stream clients");
    describe_gauge!("relay_bus_subscribers", "Registered bus subscribers");

    // Tasks
    describe_counter!(
        "relay_tasks_total",
        "Background task outcomes by task type and outcome"
    );
}

// =============================================================================
// Metric Labels
// =============================================================================

/// Outcome of an upstream operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Completed.
    Success,
    /// Attempted and failed.
    Failure,
    /// Not attempted: breaker or connection manager refused.
    Denied,
}

impl Outcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Denied => "denied",
        }
    }
}

/// Reason an inbound bridge message was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Payload was not valid JSON or lacked a discriminator.
    Decode,
    /// Discriminator named no known event kind.
    UnknownType,
    /// No bus subscriber was listening.
    NoListeners,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::UnknownType => "unknown_type",
            Self::NoListeners => "no_listeners",
        }
    }
}

/// Outcome of a processed background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Handler succeeded.
    Completed,
    /// Handler failed; task requeued.
    Retried,
    /// Handler failed with no retries left.
    Failed,
    /// Recovered from a stalled processing state.
    Recovered,
}

impl TaskOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Retried => "retried",
            Self::Failed => "failed",
            Self::Recovered => "recovered",
        }
    }
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a local cache lookup.
pub fn record_local_cache_lookup(hit: bool) {
    counter!(
        "relay_local_cache_lookups_total",
        "result" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// Record an upstream operation outcome.
pub fn record_upstream_operation(operation: &'static str, outcome: Outcome) {
    counter!(
        "relay_upstream_operations_total",
        "operation" => operation,
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record upstream operation latency.
pub fn record_upstream_duration(operation: &'static str, duration: Duration) {
    histogram!(
        "relay_upstream_operation_seconds",
        "operation" => operation
    )
    .record(duration.as_secs_f64());
}

/// Record an upstream connection attempt.
pub fn record_connection_attempt(success: bool) {
    counter!(
        "relay_connection_attempts_total",
        "result" => if success { "success" } else { "failure" }
    )
    .increment(1);
}

/// Update the connection state gauge.
pub fn set_connection_state(state: ConnectionState) {
    gauge!("relay_connection_state").set(state.gauge_value());
}

/// Record a breaker transition and update the state gauge.
pub fn record_circuit_transition(breaker: &str, state: CircuitState) {
    counter!(
        "relay_circuit_transitions_total",
        "breaker" => breaker.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
    gauge!("relay_circuit_state", "breaker" => breaker.to_string()).set(state.gauge_value());
}

/// Record an event re-emitted on the bus.
pub fn record_bridge_event(kind: EventKind) {
    counter!(
        "relay_bridge_events_received_total",
        "kind" => kind.label()
    )
    .increment(1);
}

/// Record a dropped inbound message.
pub fn record_bridge_dropped(reason: DropReason) {
    counter!(
        "relay_bridge_events_dropped_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record a bridge reconnection attempt.
pub fn record_bridge_reconnect(transport: &'static str) {
    counter!(
        "relay_bridge_reconnects_total",
        "transport" => transport
    )
    .increment(1);
}

/// Update the bridge state gauge.
pub fn set_bridge_state(state: BridgeState) {
    gauge!("relay_bridge_state").set(state.gauge_value());
}

/// Update the SSE client count.
pub fn set_stream_clients(count: f64) {
    gauge!("relay_stream_clients").set(count);
}

/// Update the bus subscriber count.
pub fn set_bus_subscribers(count: f64) {
    gauge!("relay_bus_subscribers").set(count);
}

/// Record a background task outcome.
pub fn record_task(task_type: &str, outcome: TaskOutcome) {
    counter!(
        "relay_tasks_total",
        "task_type" => task_type.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_as_str() {
        assert_eq!(Outcome::Success.as_str(), "success");
        assert_eq!(Outcome::Failure.as_str(), "failure");
        assert_eq!(Outcome::Denied.as_str(), "denied");
    }

    #[test]
    fn drop_reason_as_str() {
        assert_eq!(DropReason::Decode.as_str(), "decode");
        assert_eq!(DropReason::UnknownType.as_str(), "unknown_type");
        assert_eq!(DropReason::NoListeners.as_str(), "no_listeners");
    }

    #[test]
    fn task_outcome_as_str() {
        assert_eq!(TaskOutcome::Completed.as_str(), "completed");
        assert_eq!(TaskOutcome::Retried.as_str(), "retried");
        assert_eq!(TaskOutcome::Failed.as_str(), "failed");
        assert_eq!(TaskOutcome::Recovered.as_str(), "recovered");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_local_cache_lookup(true);
        record_upstream_operation("get", Outcome::Denied);
        set_connection_state(ConnectionState::Suspended);
    }
}
