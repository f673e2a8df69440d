//! Connection and Breaker States
//!
//! Observable state machines of the relay. Each is owned and mutated by
//! exactly one component; everything else only reads them.

use serde::{Deserialize, Serialize};

/// State of the single upstream connection.
///
/// ```text
/// Disconnected → Connecting → Connected → Disconnected
///        any state → Suspended → Disconnected (after the window)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No live connection; an attempt may be made.
    #[default]
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// A live, ready connection exists.
    Connected,
    /// Too many consecutive failures; attempts are refused until the
    /// suspension window elapses.
    Suspended,
}

impl ConnectionState {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Suspended => "suspended",
        }
    }

    /// Numeric value exported as a gauge.
    #[must_use]
    pub const fn gauge_value(self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
            Self::Suspended => 3.0,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally.
    #[default]
    Closed,
    /// Calls are rejected without touching the network.
    Open,
    /// A limited number of trial calls are let through.
    HalfOpen,
}

impl CircuitState {
    /// Numeric value exported as a gauge.
    #[must_use]
    pub const fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// State of the event distribution bridge transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    /// Transport not started, or torn down.
    #[default]
    Idle,
    /// Opening the transport.
    Connecting,
    /// Receiving events.
    Connected,
    /// Transport lost; waiting out a backoff delay.
    Disconnected,
    /// Backoff attempts exhausted; waiting out the suspension window.
    Suspended,
}

impl BridgeState {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Suspended => "suspended",
        }
    }

    /// Whether live updates are currently unavailable to consumers.
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        matches!(self, Self::Disconnected | Self::Suspended)
    }

    /// Numeric value exported as a gauge.
    #[must_use]
    pub const fn gauge_value(self) -> f64 {
        match self {
            Self::Idle => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
            Self::Disconnected => 3.0,
            Self::Suspended => 4.0,
        }
    }
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_serialization() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::Suspended).unwrap(),
            "\"suspended\""
        );
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn circuit_state_display() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
        assert_eq!(
            serde_json::to_string(&CircuitState::HalfOpen).unwrap(),
            "\"HALF_OPEN\""
        );
    }

    #[test]
    fn bridge_degraded_states() {
        assert!(BridgeState::Suspended.is_degraded());
        assert!(BridgeState::Disconnected.is_degraded());
        assert!(!BridgeState::Connected.is_degraded());
        assert!(!BridgeState::Idle.is_degraded());
    }
}
