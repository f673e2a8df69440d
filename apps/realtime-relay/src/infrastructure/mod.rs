//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Event distribution bridge (direct and streamed subscriptions).
pub mod bridge;

/// In-process typed event bus.
pub mod bus;

/// Bounded local cache with per-entry TTL.
pub mod cache;

/// Configuration from the environment.
pub mod config;

/// HTTP surface: event stream, health and metrics.
pub mod http;

/// In-memory upstream for tests and local runs.
pub mod memory;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Redis-backed upstream store.
pub mod redis_store;

/// Circuit breaker, connection manager and backoff.
pub mod resilience;

/// OpenTelemetry tracing integration.
pub mod telemetry;
