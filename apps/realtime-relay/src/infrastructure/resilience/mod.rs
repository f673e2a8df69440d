//! Resilience patterns for upstream access.
//!
//! Circuit breaker, single-connection manager and reconnection backoff.

mod backoff;
mod circuit_breaker;
mod connection;

pub use backoff::{BackoffConfig, BackoffPolicy, BackoffStep};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, StateListener,
};
pub use connection::{
    AcquireError, ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionSnapshot,
};
