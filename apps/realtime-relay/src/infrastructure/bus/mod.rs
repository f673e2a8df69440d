//! Local Event Bus
//!
//! Typed in-process fan-out of realtime events using tokio broadcast
//! channels.
//!
//! # Architecture
//!
//! The `EventBus` keeps one channel per [`EventKind`], so emitting an event
//! only reaches receivers of that kind. Ordering is preserved per kind, not
//! across kinds. Delivery is at-most-once: a receiver that falls more than
//! `capacity` events behind loses the oldest ones.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::domain::events::{EventKind, RealtimeEvent};

/// Default per-kind channel capacity.
pub const DEFAULT_BUS_CAPACITY: usize = 1_024;

const fn slot(kind: EventKind) -> usize {
    match kind {
        EventKind::MetricsUpdated => 0,
        EventKind::PairUpdated => 1,
        EventKind::TokenUpdated => 2,
        EventKind::TransactionUpdated => 3,
    }
}

/// Typed event bus with one broadcast channel per event kind.
///
/// # Example
///
/// ```rust
/// use realtime_relay::domain::events::{EventKind, RealtimeEvent};
/// use realtime_relay::infrastructure::bus::EventBus;
///
/// let bus = EventBus::with_defaults();
/// let mut rx = bus.subscribe(EventKind::PairUpdated);
///
/// let delivered = bus.emit(RealtimeEvent::new(EventKind::PairUpdated, serde_json::json!({"id": 1})));
/// assert_eq!(delivered, Some(1));
/// assert_eq!(rx.try_recv().unwrap().kind, EventKind::PairUpdated);
/// ```
#[derive(Debug)]
pub struct EventBus {
    senders: [broadcast::Sender<RealtimeEvent>; 4],
}

impl EventBus {
    /// Create a bus with the given per-kind capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            senders: std::array::from_fn(|_| broadcast::channel(capacity).0),
        }
    }

    /// Create a bus with the default capacity.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }

    /// Emit an event to receivers of its kind.
    ///
    /// Returns the number of receivers, or `None` if nobody is listening.
    #[must_use]
    pub fn emit(&self, event: RealtimeEvent) -> Option<usize> {
        self.senders[slot(event.kind)].send(event).ok()
    }

    /// Receive events of one kind.
    #[must_use]
    pub fn subscribe(&self, kind: EventKind) -> broadcast::Receiver<RealtimeEvent> {
        self.senders[slot(kind)].subscribe()
    }

    /// Receive events of several kinds as one stream.
    ///
    /// Events lost to lag are skipped.
    #[must_use]
    pub fn stream(&self, kinds: &[EventKind]) -> BoxStream<'static, RealtimeEvent> {
        let streams = kinds.iter().map(|kind| {
            BroadcastStream::new(self.subscribe(*kind))
                .filter_map(|event| futures::future::ready(event.ok()))
                .boxed()
        });
        futures::stream::select_all(streams).boxed()
    }

    /// Receivers currently listening to a kind.
    #[must_use]
    pub fn receiver_count(&self, kind: EventKind) -> usize {
        self.senders[slot(kind)].receiver_count()
    }

    /// Receiver counts for every kind.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            metrics_receivers: self.receiver_count(EventKind::MetricsUpdated),
            pair_receivers: self.receiver_count(EventKind::PairUpdated),
            token_receivers: self.receiver_count(EventKind::TokenUpdated),
            transaction_receivers: self.receiver_count(EventKind::TransactionUpdated),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Shared event bus reference.
pub type SharedEventBus = Arc<EventBus>;

/// Receiver counts per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    /// `metrics:updated` receivers.
    pub metrics_receivers: usize,
    /// `pair:updated` receivers.
    pub pair_receivers: usize,
    /// `token:updated` receivers.
    pub token_receivers: usize,
    /// `transaction:updated` receivers.
    pub transaction_receivers: usize,
}

impl BusStats {
    /// Total receivers across all kinds.
    #[must_use]
    pub const fn total_receivers(&self) -> usize {
        self.metrics_receivers
            + self.pair_receivers
            + self.token_receivers
            + self.transaction_receivers
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn event(kind: EventKind, id: u64) -> RealtimeEvent {
        RealtimeEvent::new(kind, json!({ "id": id }))
    }

    #[test]
    fn new_bus_has_no_receivers() {
        let bus = EventBus::with_defaults();
        assert_eq!(bus.stats().total_receivers(), 0);
    }

    #[test]
    fn receiver_count_decreases_on_drop() {
        let bus = EventBus::with_defaults();
        {
            let _rx = bus.subscribe(EventKind::TokenUpdated);
            assert_eq!(bus.receiver_count(EventKind::TokenUpdated), 1);
        }
        assert_eq!(bus.receiver_count(EventKind::TokenUpdated), 0);
    }

    #[test]
    fn emit_without_receivers_returns_none() {
        let bus = EventBus::with_defaults();
        assert!(bus.emit(event(EventKind::PairUpdated, 1)).is_none());
    }

    #[tokio::test]
    async fn emit_reaches_only_matching_kind() {
        let bus = EventBus::with_defaults();
        let mut pairs = bus.subscribe(EventKind::PairUpdated);
        let mut tokens = bus.subscribe(EventKind::TokenUpdated);

        assert_eq!(bus.emit(event(EventKind::PairUpdated, 7)), Some(1));

        let received = pairs.recv().await.unwrap();
        assert_eq!(received.payload, json!({ "id": 7 }));
        assert!(tokens.try_recv().is_err());
    }

    #[tokio::test]
    async fn per_kind_order_is_preserved() {
        let bus = EventBus::with_defaults();
        let mut rx = bus.subscribe(EventKind::MetricsUpdated);

        for id in 0..5 {
            let _ = bus.emit(event(EventKind::MetricsUpdated, id));
        }
        for id in 0..5 {
            assert_eq!(rx.recv().await.unwrap().payload, json!({ "id": id }));
        }
    }

    #[tokio::test]
    async fn merged_stream_receives_selected_kinds() {
        let bus = EventBus::with_defaults();
        let mut stream = bus.stream(&[EventKind::PairUpdated, EventKind::TransactionUpdated]);

        let _ = bus.emit(event(EventKind::TokenUpdated, 1));
        let _ = bus.emit(event(EventKind::TransactionUpdated, 2));

        let received = stream.next().await.unwrap();
        assert_eq!(received.kind, EventKind::TransactionUpdated);
    }

    #[test]
    fn stats_reflect_all_channels() {
        let bus = EventBus::with_defaults();
        let _a = bus.subscribe(EventKind::PairUpdated);
        let _b = bus.subscribe(EventKind::PairUpdated);
        let _c = bus.subscribe(EventKind::MetricsUpdated);

        let stats = bus.stats();
        assert_eq!(stats.pair_receivers, 2);
        assert_eq!(stats.metrics_receivers, 1);
        assert_eq!(stats.total_receivers(), 3);
    }
}
