//! Connection Manager
//!
//! Sole owner of the upstream connection. Guarantees at most one live
//! connection per process and prevents reconnection storms.
//!
//! # State Machine
//!
//! ```text
//! Disconnected → Connecting → Connected → Disconnected (close/error)
//! any → Suspended (failures > max_retry_attempts)
//! Suspended → Disconnected (suspension window elapsed)
//! ```
//!
//! # Concurrency
//!
//! Connection attempts are serialized by a single async guard. Callers that
//! queue behind an in-flight attempt re-check state once they hold the guard,
//! so they share its outcome instead of starting a second attempt.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::application::ports::{UpstreamConnector, UpstreamError, UpstreamHandle};
use crate::domain::clock::{SharedClock, duration_millis, system_clock};
use crate::domain::state::ConnectionState;
use crate::infrastructure::metrics;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Connection manager configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Minimum time between two connection attempts.
    pub min_retry_spacing: Duration,
    /// Failures tolerated before suspending.
    pub max_retry_attempts: u32,
    /// How long `acquire` refuses after suspension.
    pub suspension_window: Duration,
    /// Deadline for connect plus readiness probe.
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            min_retry_spacing: Duration::from_secs(5),
            max_retry_attempts: 5,
            suspension_window: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// An attempt started.
    Connecting,
    /// The connection is ready.
    Connected,
    /// The connection failed or was lost.
    Disconnected {
        /// Failure description.
        reason: String,
        /// Consecutive failures including this one.
        failure_count: u32,
    },
    /// Too many failures; refusing until the window elapses.
    Suspended {
        /// Refusal window.
        window: Duration,
    },
    /// The suspension window elapsed.
    Resumed,
    /// The connection was dropped by `release_all`.
    Released,
}

/// Why `acquire` returned no connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AcquireError {
    /// No upstream configured; cache-only mode.
    #[error("upstream not configured")]
    NotConfigured,

    /// Refusing while suspended.
    #[error("connection suspended for another {remaining:?}")]
    Suspended {
        /// Time until the window elapses.
        remaining: Duration,
    },

    /// Too soon after the previous attempt.
    #[error("retry spacing not elapsed, {remaining:?} remaining")]
    RetrySpacing {
        /// Time until the next attempt is allowed.
        remaining: Duration,
    },

    /// An attempt was made and failed.
    #[error("connection attempt failed: {0}")]
    ConnectFailed(#[source] UpstreamError),
}

impl AcquireError {
    /// Whether an attempt actually hit the upstream and failed.
    ///
    /// Refusals are not upstream failures and must not feed the breaker.
    #[must_use]
    pub const fn is_attempt_failure(&self) -> bool {
        matches!(self, Self::ConnectFailed(_))
    }
}

/// Snapshot for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    /// Current state.
    pub state: ConnectionState,
    /// Consecutive failures.
    pub failure_count: u32,
    /// Whether an upstream is configured.
    pub configured: bool,
    /// Endpoint description with credentials removed.
    pub endpoint: Option<String>,
}

#[derive(Default)]
struct ManagerState {
    state: ConnectionState,
    connection: Option<UpstreamHandle>,
    failure_count: u32,
    last_attempt_ms: Option<u64>,
    suspended_at_ms: Option<u64>,
}

/// Owner of the single upstream connection.
pub struct ConnectionManager {
    connector: Option<Arc<dyn UpstreamConnector>>,
    config: ConnectionConfig,
    clock: SharedClock,
    inner: Mutex<ManagerState>,
    attempt_guard: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager for a connector on the system clock.
    #[must_use]
    pub fn new(connector: Arc<dyn UpstreamConnector>, config: ConnectionConfig) -> Self {
        Self::build(Some(connector), config, system_clock())
    }

    /// Create a manager for a connector on a specific clock.
    #[must_use]
    pub fn with_clock(
        connector: Arc<dyn UpstreamConnector>,
        config: ConnectionConfig,
        clock: SharedClock,
    ) -> Self {
        Self::build(Some(connector), config, clock)
    }

    /// Create a manager with no upstream. Every `acquire` is refused.
    #[must_use]
    pub fn unconfigured() -> Self {
        Self::build(None, ConnectionConfig::default(), system_clock())
    }

    fn build(
        connector: Option<Arc<dyn UpstreamConnector>>,
        config: ConnectionConfig,
        clock: SharedClock,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            connector,
            config,
            clock,
            inner: Mutex::new(ManagerState::default()),
            attempt_guard: tokio::sync::Mutex::new(()),
            events,
        }
    }

    /// Whether an upstream is configured.
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.connector.is_some()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Consecutive failures.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// The live connection, without attempting one.
    #[must_use]
    pub fn current(&self) -> Option<UpstreamHandle> {
        self.inner.lock().connection.clone()
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Snapshot for health reporting.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionSnapshot {
        let inner = self.inner.lock();
        ConnectionSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            configured: self.connector.is_some(),
            endpoint: self.connector.as_ref().map(|c| c.describe()),
        }
    }

    /// Get the live connection, attempting one if allowed.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError`] when no connection is available. Only
    /// [`AcquireError::ConnectFailed`] means an attempt was made.
    pub async fn acquire(&self) -> Result<UpstreamHandle, AcquireError> {
        let Some(connector) = self.connector.as_ref() else {
            return Err(AcquireError::NotConfigured);
        };

        if let Some(handle) = self.check_available()? {
            return Ok(handle);
        }

        let _guard = self.attempt_guard.lock().await;

        if let Some(handle) = self.check_available()? {
            return Ok(handle);
        }

        {
            let mut inner = self.inner.lock();
            inner.state = ConnectionState::Connecting;
            inner.last_attempt_ms = Some(self.clock.now_millis());
        }
        metrics::set_connection_state(ConnectionState::Connecting);
        self.emit(ConnectionEvent::Connecting);
        tracing::debug!(endpoint = %connector.describe(), "Connecting to upstream");

        let attempt = async {
            let handle = connector.connect().await?;
            handle.ping().await?;
            Ok::<_, UpstreamError>(handle)
        };
        let outcome = match tokio::time::timeout(self.config.connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(self.config.connect_timeout)),
        };

        match outcome {
            Ok(handle) => {
                {
                    let mut inner = self.inner.lock();
                    inner.state = ConnectionState::Connected;
                    inner.connection = Some(handle.clone());
                    inner.failure_count = 0;
                }
                metrics::record_connection_attempt(true);
                metrics::set_connection_state(ConnectionState::Connected);
                tracing::info!(endpoint = %connector.describe(), "Upstream connected");
                self.emit(ConnectionEvent::Connected);
                Ok(handle)
            }
            Err(error) => {
                metrics::record_connection_attempt(false);
                let event = self.register_failure(&mut self.inner.lock(), &error.to_string());
                self.emit(event);
                Err(AcquireError::ConnectFailed(error))
            }
        }
    }

    /// Report a mid-life failure observed on `handle`.
    ///
    /// Only connection-level errors count, and only while `handle` is still
    /// the live connection, so concurrent reports about one broken connection
    /// count once.
    pub fn report_failure(&self, handle: &UpstreamHandle, error: &UpstreamError) {
        if !error.is_connection_error() {
            return;
        }

        let mut inner = self.inner.lock();
        let is_live = inner
            .connection
            .as_ref()
            .is_some_and(|live| Arc::ptr_eq(live, handle));
        if !is_live {
            return;
        }
        let event = self.register_failure(&mut inner, &error.to_string());
        drop(inner);
        self.emit(event);
    }

    /// Drop the connection and reset to `Disconnected`.
    pub fn release_all(&self) {
        {
            let mut inner = self.inner.lock();
            *inner = ManagerState {
                last_attempt_ms: inner.last_attempt_ms,
                ..ManagerState::default()
            };
        }
        metrics::set_connection_state(ConnectionState::Disconnected);
        tracing::info!("Upstream connection released");
        self.emit(ConnectionEvent::Released);
    }

    /// Return the live connection, refuse, or allow an attempt.
    fn check_available(&self) -> Result<Option<UpstreamHandle>, AcquireError> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();

        if let Some(handle) = &inner.connection {
            return Ok(Some(handle.clone()));
        }

        if inner.state == ConnectionState::Suspended {
            let window = duration_millis(self.config.suspension_window);
            let elapsed = now.saturating_sub(inner.suspended_at_ms.unwrap_or(now));
            if elapsed < window {
                return Err(AcquireError::Suspended {
                    remaining: Duration::from_millis(window - elapsed),
                });
            }

            inner.state = ConnectionState::Disconnected;
            inner.failure_count = 0;
            inner.suspended_at_ms = None;
            drop(inner);
            metrics::set_connection_state(ConnectionState::Disconnected);
            tracing::info!("Upstream suspension window elapsed");
            self.emit(ConnectionEvent::Resumed);
            inner = self.inner.lock();
        }

        if let Some(last) = inner.last_attempt_ms {
            let spacing = duration_millis(self.config.min_retry_spacing);
            let elapsed = now.saturating_sub(last);
            if elapsed < spacing {
                return Err(AcquireError::RetrySpacing {
                    remaining: Duration::from_millis(spacing - elapsed),
                });
            }
        }

        Ok(None)
    }

    fn register_failure(&self, inner: &mut ManagerState, reason: &str) -> ConnectionEvent {
        inner.connection = None;
        inner.failure_count = inner.failure_count.saturating_add(1);
        let failure_count = inner.failure_count;

        if failure_count > self.config.max_retry_attempts {
            inner.state = ConnectionState::Suspended;
            inner.suspended_at_ms = Some(self.clock.now_millis());
            metrics::set_connection_state(ConnectionState::Suspended);
            tracing::error!(
                failure_count,
                window_secs = self.config.suspension_window.as_secs(),
                reason,
                "Upstream connection suspended"
            );
            ConnectionEvent::Suspended {
                window: self.config.suspension_window,
            }
        } else {
            inner.state = ConnectionState::Disconnected;
            metrics::set_connection_state(ConnectionState::Disconnected);
            tracing::warn!(failure_count, reason, "Upstream connection failed");
            ConnectionEvent::Disconnected {
                reason: reason.to_string(),
                failure_count,
            }
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::domain::clock::ManualClock;
    use crate::infrastructure::memory::{MemoryConnector, MemoryStore};

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            min_retry_spacing: Duration::from_millis(1_000),
            max_retry_attempts: 2,
            suspension_window: Duration::from_millis(10_000),
            connect_timeout: Duration::from_millis(200),
        }
    }

    fn manager() -> (ConnectionManager, Arc<MemoryConnector>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let connector = Arc::new(MemoryConnector::new(Arc::new(MemoryStore::new())));
        let manager = ConnectionManager::with_clock(connector.clone(), config(), clock.clone());
        (manager, connector, clock)
    }

    #[tokio::test]
    async fn acquire_connects_and_reuses() {
        let (manager, connector, _) = manager();
        let mut events = manager.subscribe_events();

        let first = manager.acquire().await.unwrap();
        let second = manager.acquire().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);

        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connecting);
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connected);
    }

    #[tokio::test]
    async fn failed_ping_after_connect_is_a_failed_attempt() {
        let (manager, connector, clock) = manager();
        let mut events = manager.subscribe_events();
        connector
            .store()
            .fail_next("ping", UpstreamError::Connection("reset by peer".into()));

        let err = manager.acquire().await.err().unwrap();
        assert!(matches!(err, AcquireError::ConnectFailed(UpstreamError::Connection(_))));
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(manager.failure_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.current().is_none());

        assert_eq!(events.try_recv().unwrap(), ConnectionEvent::Connecting);
        assert!(matches!(
            events.try_recv().unwrap(),
            ConnectionEvent::Disconnected { failure_count: 1, .. }
        ));
        assert!(events.try_recv().is_err());

        clock.advance(Duration::from_millis(1_000));
        assert!(manager.acquire().await.is_ok());
        assert_eq!(manager.failure_count(), 0);
    }

    #[tokio::test]
    async fn spacing_denies_without_attempting() {
        let (manager, connector, clock) = manager();
        connector.set_refusing(true);

        let err = manager.acquire().await.err().unwrap();
        assert!(err.is_attempt_failure());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let err = manager.acquire().await.err().unwrap();
        assert!(matches!(err, AcquireError::RetrySpacing { .. }));
        assert!(!err.is_attempt_failure());
        assert_eq!(connector.connect_count(), 1);

        clock.advance(Duration::from_millis(1_000));
        connector.set_refusing(false);
        assert!(manager.acquire().await.is_ok());
        assert_eq!(connector.connect_count(), 2);
        assert_eq!(manager.failure_count(), 0);
    }

    #[tokio::test]
    async fn suspends_after_max_failures_then_resumes() {
        let (manager, connector, clock) = manager();
        connector.set_refusing(true);

        for _ in 0..3 {
            let _ = manager.acquire().await;
            clock.advance(Duration::from_millis(1_000));
        }
        assert_eq!(manager.state(), ConnectionState::Suspended);
        assert_eq!(connector.connect_count(), 3);

        let err = manager.acquire().await.err().unwrap();
        assert!(matches!(err, AcquireError::Suspended { .. }));
        assert_eq!(connector.connect_count(), 3);

        clock.advance(Duration::from_millis(10_000));
        connector.set_refusing(false);
        assert!(manager.acquire().await.is_ok());
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_attempt() {
        let (manager, connector, _) = manager();
        connector.set_connect_delay(Duration::from_millis(50));
        let manager = Arc::new(manager);

        let attempts: Vec<_> = (0..5)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.acquire().await })
            })
            .collect();

        for attempt in futures::future::join_all(attempts).await {
            assert!(attempt.unwrap().is_ok());
        }
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn connect_timeout_counts_as_failure() {
        let (manager, connector, _) = manager();
        connector.set_connect_delay(Duration::from_millis(500));

        let err = manager.acquire().await.err().unwrap();
        assert!(matches!(
            err,
            AcquireError::ConnectFailed(UpstreamError::Timeout(_))
        ));
        assert_eq!(manager.failure_count(), 1);
    }

    #[tokio::test]
    async fn report_failure_drops_live_connection_once() {
        let (manager, _, _) = manager();
        let handle = manager.acquire().await.unwrap();
        let error = UpstreamError::Connection("reset by peer".into());

        manager.report_failure(&handle, &error);
        manager.report_failure(&handle, &error);

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.failure_count(), 1);
        assert!(manager.current().is_none());
    }

    #[tokio::test]
    async fn command_errors_do_not_drop_connection() {
        let (manager, _, _) = manager();
        let handle = manager.acquire().await.unwrap();

        manager.report_failure(&handle, &UpstreamError::Command("WRONGTYPE".into()));
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn release_all_resets_state() {
        let (manager, _, _) = manager();
        manager.acquire().await.unwrap();

        manager.release_all();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.current().is_none());
    }

    #[tokio::test]
    async fn unconfigured_manager_refuses() {
        let manager = ConnectionManager::unconfigured();
        assert!(!manager.is_configured());
        assert!(matches!(
            manager.acquire().await,
            Err(AcquireError::NotConfigured)
        ));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
