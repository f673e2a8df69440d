//! Relay Context
//!
//! Composition root: builds every long-lived component from a
//! [`RelayConfig`] and hands out shared references to them. One context per
//! process; components never construct each other.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::application::ports::{EventTransport, TransportError, UpstreamConnector};
use crate::application::services::{EventPublisher, ResilientCache, TaskQueue, UpstreamGate};
use crate::domain::subscription::SubscriberRegistry;
use crate::infrastructure::bridge::{
    DEFAULT_STREAM_CONNECT_TIMEOUT, DirectSubscription, EventBridge, StreamedSubscription,
};
use crate::infrastructure::bus::{EventBus, SharedEventBus};
use crate::infrastructure::cache::LocalCache;
use crate::infrastructure::config::{RelayConfig, RelayMode};
use crate::infrastructure::http::HttpState;
use crate::infrastructure::redis_store::RedisConnector;
use crate::infrastructure::resilience::{CircuitBreaker, ConnectionManager};

/// Name of the breaker guarding the shared upstream.
pub const UPSTREAM_BREAKER: &str = "upstream";

/// Errors building the context.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// Remote mode needs a stream URL.
    #[error("remote mode requires a stream URL")]
    MissingStreamUrl,

    /// The event transport could not be constructed.
    #[error("failed to build event transport: {0}")]
    Transport(#[from] TransportError),
}

/// Shared relay components.
#[derive(Debug, Clone)]
pub struct RelayContext {
    mode: RelayMode,
    connections: Arc<ConnectionManager>,
    breaker: Arc<CircuitBreaker>,
    local: Arc<LocalCache>,
    cache: ResilientCache,
    publisher: EventPublisher,
    tasks: Arc<TaskQueue>,
    bridge: Arc<EventBridge>,
}

impl RelayContext {
    /// Build the context described by `config`.
    ///
    /// A missing or malformed upstream URL is not an error: the relay then
    /// runs cache-only.
    ///
    /// # Errors
    ///
    /// Returns an error if the event transport for the configured mode
    /// cannot be built.
    pub fn build(config: &RelayConfig) -> Result<Self, ContextError> {
        let connections = Arc::new(Self::connection_manager(config));

        let transport: Arc<dyn EventTransport> = match config.mode {
            RelayMode::Server => Arc::new(DirectSubscription::new(connections.clone())),
            RelayMode::Remote => {
                let url = config
                    .stream_url
                    .as_deref()
                    .ok_or(ContextError::MissingStreamUrl)?;
                Arc::new(StreamedSubscription::new(url, DEFAULT_STREAM_CONNECT_TIMEOUT)?)
            }
        };

        Ok(Self::assemble(config, connections, transport))
    }

    /// Build a context around an existing connection manager and transport.
    #[must_use]
    pub fn with_parts(
        config: &RelayConfig,
        connections: Arc<ConnectionManager>,
        transport: Arc<dyn EventTransport>,
    ) -> Self {
        Self::assemble(config, connections, transport)
    }

    fn connection_manager(config: &RelayConfig) -> ConnectionManager {
        let Some(url) = &config.redis_url else {
            tracing::info!("No upstream configured, running cache-only");
            return ConnectionManager::unconfigured();
        };

        match RedisConnector::open(url.expose()) {
            Ok(connector) => {
                let connector: Arc<dyn UpstreamConnector> = Arc::new(connector);
                ConnectionManager::new(connector, config.connection)
            }
            Err(error) => {
                tracing::warn!(url = %url.redacted(), error = %error, "Invalid upstream URL, running cache-only");
                ConnectionManager::unconfigured()
            }
        }
    }

    fn assemble(
        config: &RelayConfig,
        connections: Arc<ConnectionManager>,
        transport: Arc<dyn EventTransport>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(UPSTREAM_BREAKER, config.breaker));
        let local = Arc::new(LocalCache::new(config.cache));
        let gate = UpstreamGate::new(breaker.clone(), connections.clone(), config.operation_timeout);

        let bus: SharedEventBus = Arc::new(EventBus::with_defaults());
        let registry = Arc::new(SubscriberRegistry::new());
        let bridge = Arc::new(EventBridge::new(transport, bus, registry, config.bridge));

        Self {
            mode: config.mode,
            cache: ResilientCache::new(local.clone(), gate.clone()),
            publisher: EventPublisher::new(gate.clone()),
            tasks: Arc::new(TaskQueue::new(gate, config.tasks.clone())),
            connections,
            breaker,
            local,
            bridge,
        }
    }

    /// Execution context.
    #[must_use]
    pub const fn mode(&self) -> RelayMode {
        self.mode
    }

    /// Upstream connection manager.
    #[must_use]
    pub const fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Upstream circuit breaker.
    #[must_use]
    pub const fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Local cache tier.
    #[must_use]
    pub const fn local_cache(&self) -> &Arc<LocalCache> {
        &self.local
    }

    /// Resilient cache operations.
    #[must_use]
    pub const fn cache(&self) -> &ResilientCache {
        &self.cache
    }

    /// Event publisher.
    #[must_use]
    pub const fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    /// Background task queue.
    #[must_use]
    pub const fn tasks(&self) -> &Arc<TaskQueue> {
        &self.tasks
    }

    /// Event distribution bridge.
    #[must_use]
    pub const fn bridge(&self) -> &Arc<EventBridge> {
        &self.bridge
    }

    /// State for the HTTP surface, stopped by `shutdown`.
    #[must_use]
    pub fn http_state(
        &self,
        version: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Arc<HttpState> {
        Arc::new(HttpState::new(
            version.into(),
            self.connections.clone(),
            self.breaker.clone(),
            self.bridge.clone(),
            self.local.clone(),
            shutdown,
        ))
    }

    /// Stop the bridge and drop the upstream connection.
    pub async fn shutdown(&self) {
        self.bridge.shutdown().await;
        self.connections.release_all();
    }
}
