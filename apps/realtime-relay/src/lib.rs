#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Realtime Relay - Update Distribution and Resilience Layer
//!
//! Keeps a shared cache and pub/sub backend usable when it misbehaves, and
//! fans realtime entity updates out to in-process subscribers and remote
//! HTTP clients.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types and state machines
//!   - `events`: Event kinds, channels and the stream envelope
//!   - `keys`: Cache key namespacing and TTL classes
//!   - `state`: Connection, breaker and bridge states
//!   - `subscription`: Subscriber tracking
//!   - `task`: Background task lifecycle
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Upstream store, connector and event transport interfaces
//!   - `services`: Resilient cache, event publisher, task queue
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `resilience`: Circuit breaker, connection manager, backoff
//!   - `cache`: Bounded local cache
//!   - `redis_store`: Redis upstream
//!   - `bridge`: Direct and streamed event subscriptions
//!   - `bus`: In-process event fan-out
//!   - `http`: Event stream, health and metrics endpoints
//!   - `config`: Configuration from the environment
//!
//! # Data Flow
//!
//! ```text
//!                    ┌──────────────┐
//! publish ──────────►│    Redis     │◄──── get / set / mget (gated)
//!                    │   pub/sub    │
//!                    └──────┬───────┘
//!                           │ direct subscription (server mode)
//!                           ▼
//!                    ┌──────────────┐     ┌──────────────┐
//!                    │ Event Bridge │────►│  Event Bus   │──► in-process subscribers
//!                    └──────▲───────┘     └──────┬───────┘
//!                           │                    │
//!   streamed subscription   │                    ▼
//!   (remote mode, SSE) ─────┘             /api/events (SSE) ──► remote relays
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core relay types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

/// Composition root.
pub mod context;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::events::{EventKind, RealtimeEvent, StreamEnvelope};
pub use domain::keys::{CacheKey, EntityKind, TtlClass};
pub use domain::state::{BridgeState, CircuitState, ConnectionState};
pub use domain::subscription::{ConsumerId, SubscriberRegistry};
pub use domain::task::{Task, TaskPriority, TaskStatus};

// Application services
pub use application::services::{
    EventPublisher, GateError, ResilientCache, TaskHandler, TaskQueue, TaskQueueConfig,
    TaskQueueStats, UpstreamGate,
};

// Resilience
pub use infrastructure::resilience::{
    CircuitBreaker, CircuitBreakerConfig, ConnectionConfig, ConnectionManager,
};

// Bridge and bus
pub use infrastructure::bridge::{
    BridgeConfig, DirectSubscription, EventBridge, StreamedSubscription,
};
pub use infrastructure::bus::{EventBus, SharedEventBus};

// Local cache
pub use infrastructure::cache::{LocalCache, LocalCacheConfig};

// Configuration
pub use infrastructure::config::{ConfigError, RelayConfig, RelayMode, ServerSettings};

// HTTP surface
pub use infrastructure::http::{HttpServer, HttpServerError, HttpState, router};

// Composition root
pub use context::{ContextError, RelayContext};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
