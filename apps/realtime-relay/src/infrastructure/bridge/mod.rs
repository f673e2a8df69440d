//! Event Distribution Bridge
//!
//! Receives domain events from exactly one transport and re-emits them on
//! the local [`EventBus`](crate::infrastructure::bus::EventBus).
//!
//! # Transports
//!
//! - [`DirectSubscription`]: backend pub/sub on the managed connection
//!   (server context)
//! - [`StreamedSubscription`]: one SSE request to a relay endpoint (remote
//!   context)
//!
//! The transport is chosen once at construction. Consumers only ever see the
//! bus, so both contexts expose the same API.
//!
//! # Lifecycle
//!
//! ```text
//! Idle → Connecting → Connected → Disconnected ─(backoff)→ Connecting
//!                                      │
//!                                      └─(attempts spent)→ Suspended ─(window)→ Connecting
//! ```

pub mod codec;
mod direct;
mod streamed;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use codec::{CodecError, DecodedFrame, SseDecoder, decode_frame};
pub use direct::DirectSubscription;
pub use streamed::{DEFAULT_STREAM_CONNECT_TIMEOUT, StreamedSubscription};

use crate::application::ports::{EventTransport, FrameStream, InboundFrame};
use crate::domain::clock::{SharedClock, duration_millis, system_clock};
use crate::domain::events::EventKind;
use crate::domain::state::BridgeState;
use crate::domain::subscription::{ConsumerId, SubscriberRegistry, Unregistration};
use crate::infrastructure::bus::SharedEventBus;
use crate::infrastructure::metrics::{self, DropReason};
use crate::infrastructure::resilience::{BackoffConfig, BackoffPolicy, BackoffStep};

/// Default window in which repeated initialization is suppressed.
pub const DEFAULT_INIT_DEBOUNCE: Duration = Duration::from_secs(2);

/// Default deadline for opening one transport session.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Bridge configuration.
#[derive(Debug, Clone, Copy)]
pub struct BridgeConfig {
    /// Reconnection backoff.
    pub backoff: BackoffConfig,
    /// Re-initialization within this window returns the existing bus.
    pub init_debounce: Duration,
    /// Deadline for one transport open; expiry counts as a failed attempt.
    pub open_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            init_debounce: DEFAULT_INIT_DEBOUNCE,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }
}

#[derive(Debug, Default)]
struct Runner {
    last_init_ms: Option<u64>,
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl Runner {
    fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

/// Bridge from one event transport to the local bus.
pub struct EventBridge {
    transport: Arc<dyn EventTransport>,
    bus: SharedEventBus,
    registry: Arc<SubscriberRegistry>,
    config: BridgeConfig,
    clock: SharedClock,
    state_tx: watch::Sender<BridgeState>,
    runner: Mutex<Runner>,
}

impl std::fmt::Debug for EventBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBridge")
            .field("transport", &self.transport.name())
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EventBridge {
    /// Create a bridge on the system clock.
    #[must_use]
    pub fn new(
        transport: Arc<dyn EventTransport>,
        bus: SharedEventBus,
        registry: Arc<SubscriberRegistry>,
        config: BridgeConfig,
    ) -> Self {
        Self::with_clock(transport, bus, registry, config, system_clock())
    }

    /// Create a bridge on a specific clock.
    #[must_use]
    pub fn with_clock(
        transport: Arc<dyn EventTransport>,
        bus: SharedEventBus,
        registry: Arc<SubscriberRegistry>,
        config: BridgeConfig,
        clock: SharedClock,
    ) -> Self {
        let (state_tx, _) = watch::channel(BridgeState::Idle);
        Self {
            transport,
            bus,
            registry,
            config,
            clock,
            state_tx,
            runner: Mutex::new(Runner::default()),
        }
    }

    /// The local bus events are re-emitted on.
    #[must_use]
    pub fn bus(&self) -> SharedEventBus {
        self.bus.clone()
    }

    /// The subscriber registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Name of the selected transport.
    #[must_use]
    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Current transport state.
    #[must_use]
    pub fn state(&self) -> BridgeState {
        *self.state_tx.borrow()
    }

    /// Observe state changes, e.g. to show that live updates are paused.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<BridgeState> {
        self.state_tx.subscribe()
    }

    /// Start the transport if it is not running and return the bus.
    ///
    /// Calls within the debounce window of the previous one return the bus
    /// without touching the transport.
    pub fn initialize(self: &Arc<Self>) -> SharedEventBus {
        let now = self.clock.now_millis();
        let mut runner = self.runner.lock();

        let debounce = duration_millis(self.config.init_debounce);
        if runner
            .last_init_ms
            .is_some_and(|last| now.saturating_sub(last) < debounce)
        {
            tracing::debug!(transport = self.transport.name(), "Bridge initialization debounced");
            return self.bus.clone();
        }
        runner.last_init_ms = Some(now);

        if runner.is_running() {
            return self.bus.clone();
        }

        let cancel = CancellationToken::new();
        let bridge = Arc::clone(self);
        runner.handle = Some(tokio::spawn(bridge.run(cancel.clone())));
        runner.cancel = Some(cancel);
        tracing::info!(transport = self.transport.name(), "Bridge started");

        self.bus.clone()
    }

    /// Register a logical subscriber.
    pub fn register(&self, kinds: &[EventKind]) -> ConsumerId {
        let consumer = self.registry.next_consumer_id();
        let registration = self.registry.register(consumer, kinds);
        if registration.first_subscriber {
            tracing::debug!(consumer, "First bus subscriber registered");
        }
        self.publish_subscriber_gauge();
        consumer
    }

    /// Unregister a logical subscriber.
    ///
    /// Reaching zero subscribers is only a signal; call
    /// [`teardown`](Self::teardown) to act on it.
    pub fn unregister(&self, consumer: ConsumerId) -> Unregistration {
        let unregistration = self.registry.unregister(consumer);
        if unregistration.teardown_signalled() {
            tracing::debug!(consumer, "Last bus subscriber left");
        }
        self.publish_subscriber_gauge();
        unregistration
    }

    /// Stop the transport if nobody is subscribed.
    ///
    /// Returns whether the transport was stopped.
    pub fn teardown(&self) -> bool {
        let remaining = self.registry.subscriber_count();
        if remaining > 0 {
            tracing::debug!(remaining, "Bridge teardown deferred, subscribers remain");
            return false;
        }
        self.stop();
        true
    }

    /// Stop the transport and wait for the runner to finish.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.stop() {
            let _ = handle.await;
        }
        // The runner may have published a state between cancel and exit.
        self.set_state(BridgeState::Idle);
    }

    fn stop(&self) -> Option<JoinHandle<()>> {
        let mut runner = self.runner.lock();
        if let Some(cancel) = runner.cancel.take() {
            cancel.cancel();
            tracing::info!(transport = self.transport.name(), "Bridge stopped");
        }
        runner.last_init_ms = None;
        let handle = runner.handle.take();
        drop(runner);
        self.set_state(BridgeState::Idle);
        handle
    }

    fn publish_subscriber_gauge(&self) {
        #[allow(clippy::cast_precision_loss)]
        metrics::set_bus_subscribers(self.registry.subscriber_count() as f64);
    }

    fn set_state(&self, state: BridgeState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            metrics::set_bridge_state(state);
            tracing::debug!(state = state.as_str(), "Bridge state changed");
        }
    }

    // =========================================================================
    // Runner
    // =========================================================================

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let transport = self.transport.name();
        let mut backoff = BackoffPolicy::new(self.config.backoff);

        while !cancel.is_cancelled() {
            self.set_state(BridgeState::Connecting);

            let opened = tokio::select! {
                () = cancel.cancelled() => break,
                opened = tokio::time::timeout(self.config.open_timeout, self.transport.open()) => opened,
            };

            match opened {
                Ok(Ok(frames)) => {
                    tracing::info!(transport, "Bridge connected");
                    self.set_state(BridgeState::Connected);
                    backoff.reset();
                    if self.pump(frames, &cancel).await {
                        break;
                    }
                    tracing::warn!(transport, "Bridge stream ended");
                }
                Ok(Err(error)) => {
                    tracing::warn!(transport, error = %error, "Bridge transport failed to open");
                }
                Err(_) => {
                    tracing::warn!(
                        transport,
                        timeout_ms = self.config.open_timeout.as_millis(),
                        "Bridge transport open timed out"
                    );
                }
            }

            self.set_state(BridgeState::Disconnected);
            let wait = match backoff.next_step() {
                BackoffStep::Retry { attempt, delay } => {
                    metrics::record_bridge_reconnect(transport);
                    tracing::info!(
                        transport,
                        attempt,
                        delay_ms = delay.as_millis(),
                        "Reconnecting bridge"
                    );
                    delay
                }
                BackoffStep::Suspend { window } => {
                    self.set_state(BridgeState::Suspended);
                    tracing::warn!(
                        transport,
                        window_secs = window.as_secs(),
                        "Bridge reconnect attempts exhausted, suspending"
                    );
                    window
                }
            };

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(wait) => {}
            }
        }

        tracing::debug!(transport, "Bridge runner exited");
    }

    /// Forward frames until the stream ends. Returns `true` if cancelled.
    async fn pump(&self, mut frames: FrameStream, cancel: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return true,
                frame = frames.next() => match frame {
                    Some(frame) => self.dispatch(&frame),
                    None => return false,
                },
            }
        }
    }

    /// Demultiplex one frame onto the bus.
    fn dispatch(&self, frame: &InboundFrame) {
        match decode_frame(frame) {
            Ok(DecodedFrame::Event(event)) => {
                let kind = event.kind;
                metrics::record_bridge_event(kind);
                if self.bus.emit(event).is_none() {
                    metrics::record_bridge_dropped(DropReason::NoListeners);
                    tracing::trace!(channel = kind.channel(), "No bus listeners for event");
                }
            }
            Ok(DecodedFrame::Handshake) => {
                tracing::debug!("Event stream handshake received");
            }
            Ok(DecodedFrame::Unknown(message_type)) => {
                metrics::record_bridge_dropped(DropReason::UnknownType);
                tracing::warn!(message_type = %message_type, "Dropping event with unknown type");
            }
            Err(error) => {
                metrics::record_bridge_dropped(DropReason::Decode);
                tracing::warn!(error = %error, "Dropping undecodable event");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::*;
    use crate::application::ports::{TransportError, UpstreamStore};
    use crate::domain::clock::ManualClock;
    use crate::domain::events::RealtimeEvent;
    use crate::infrastructure::bus::EventBus;
    use crate::infrastructure::memory::{MemoryConnector, MemoryStore};
    use crate::infrastructure::resilience::{ConnectionConfig, ConnectionManager};

    /// Transport handing out pre-built sessions, failing once they run out.
    struct ScriptedTransport {
        sessions: Mutex<Vec<mpsc::UnboundedReceiver<InboundFrame>>>,
        opens: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(sessions: Vec<mpsc::UnboundedReceiver<InboundFrame>>) -> Self {
            Self {
                sessions: Mutex::new(sessions),
                opens: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EventTransport for ScriptedTransport {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn open(&self) -> Result<FrameStream, TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let mut sessions = self.sessions.lock();
            if sessions.is_empty() {
                return Err(TransportError::Open("no session".into()));
            }
            Ok(UnboundedReceiverStream::new(sessions.remove(0)).boxed())
        }
    }

    /// Transport whose open never completes.
    struct StalledTransport {
        opens: AtomicUsize,
    }

    #[async_trait]
    impl EventTransport for StalledTransport {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn open(&self) -> Result<FrameStream, TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    fn fast_config() -> BridgeConfig {
        BridgeConfig {
            backoff: BackoffConfig {
                base: Duration::from_millis(5),
                cap: Duration::from_millis(20),
                max_attempts: 2,
                suspension_window: Duration::from_millis(500),
                jitter_factor: 0.0,
            },
            init_debounce: Duration::from_secs(2),
            open_timeout: Duration::from_millis(50),
        }
    }

    fn bridge(transport: Arc<dyn EventTransport>, clock: Arc<ManualClock>) -> Arc<EventBridge> {
        Arc::new(EventBridge::with_clock(
            transport,
            Arc::new(EventBus::with_defaults()),
            Arc::new(SubscriberRegistry::new()),
            fast_config(),
            clock,
        ))
    }

    async fn wait_for_state(rx: &mut watch::Receiver<BridgeState>, want: BridgeState) {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|state| *state == want))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn demultiplexes_onto_the_bus() {
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = bridge(
            Arc::new(ScriptedTransport::new(vec![rx])),
            Arc::new(ManualClock::new(0)),
        );
        let bus = bridge.initialize();
        let mut pairs = bus.subscribe(EventKind::PairUpdated);
        let mut tokens = bus.subscribe(EventKind::TokenUpdated);

        tx.send(InboundFrame::Envelope(r#"{"type":"connected"}"#.into()))
            .unwrap();
        tx.send(InboundFrame::Envelope(r#"{"type":"pool:updated","payload":{}}"#.into()))
            .unwrap();
        tx.send(InboundFrame::Envelope("{not json".into())).unwrap();
        tx.send(InboundFrame::Envelope(
            r#"{"type":"pair:updated","payload":{"id":"0xabc"}}"#.into(),
        ))
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), pairs.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            RealtimeEvent::new(EventKind::PairUpdated, json!({"id": "0xabc"}))
        );
        assert!(tokens.try_recv().is_err());
        assert!(pairs.try_recv().is_err());
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn initialization_is_debounced() {
        let clock = Arc::new(ManualClock::new(10_000));
        let (_tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(ScriptedTransport::new(vec![rx]));
        let bridge = bridge(transport.clone(), clock.clone());

        let first = bridge.initialize();
        let second = bridge.initialize();
        assert!(Arc::ptr_eq(&first, &second));

        let mut state = bridge.watch_state();
        wait_for_state(&mut state, BridgeState::Connected).await;
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(3));
        let _ = bridge.initialize();
        tokio::task::yield_now().await;
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn reconnects_then_suspends() {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(ScriptedTransport::new(vec![rx]));
        let bridge = bridge(transport.clone(), Arc::new(ManualClock::new(0)));
        let mut state = bridge.watch_state();

        let _ = bridge.initialize();
        wait_for_state(&mut state, BridgeState::Connected).await;

        drop(tx);
        wait_for_state(&mut state, BridgeState::Suspended).await;
        assert!(bridge.state().is_degraded());
        // initial open + two failed retries
        assert_eq!(transport.opens.load(Ordering::SeqCst), 3);

        bridge.shutdown().await;
        assert_eq!(bridge.state(), BridgeState::Idle);
    }

    #[tokio::test]
    async fn stalled_open_times_out_into_backoff() {
        let transport = Arc::new(StalledTransport {
            opens: AtomicUsize::new(0),
        });
        let bridge = bridge(transport.clone(), Arc::new(ManualClock::new(0)));
        let mut state = bridge.watch_state();

        let _ = bridge.initialize();
        wait_for_state(&mut state, BridgeState::Suspended).await;
        assert_eq!(transport.opens.load(Ordering::SeqCst), 3);

        bridge.shutdown().await;
        assert_eq!(bridge.state(), BridgeState::Idle);
    }

    #[tokio::test]
    async fn teardown_waits_for_last_subscriber() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let bridge = bridge(
            Arc::new(ScriptedTransport::new(vec![rx])),
            Arc::new(ManualClock::new(0)),
        );
        let _ = bridge.initialize();

        let a = bridge.register(&EventKind::ALL);
        let b = bridge.register(&[EventKind::PairUpdated]);

        assert!(!bridge.unregister(a).teardown_signalled());
        assert!(!bridge.teardown());

        assert!(bridge.unregister(b).teardown_signalled());
        assert!(bridge.teardown());
        assert_eq!(bridge.state(), BridgeState::Idle);
    }

    #[tokio::test]
    async fn direct_transport_relays_backend_messages() {
        let store = Arc::new(MemoryStore::new());
        let connections = Arc::new(ConnectionManager::new(
            Arc::new(MemoryConnector::new(store.clone())),
            ConnectionConfig::default(),
        ));
        let bridge = bridge(
            Arc::new(DirectSubscription::new(connections)),
            Arc::new(ManualClock::new(0)),
        );
        let bus = bridge.initialize();
        let mut metrics_rx = bus.subscribe(EventKind::MetricsUpdated);

        let mut state = bridge.watch_state();
        wait_for_state(&mut state, BridgeState::Connected).await;

        store
            .publish("metrics:updated", r#"{"tvl":"100"}"#)
            .await
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), metrics_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload, json!({"tvl": "100"}));
        bridge.shutdown().await;
    }
}
