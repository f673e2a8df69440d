//! Realtime Event Types
//!
//! Logical channels carried by the relay and the event shape delivered to
//! local subscribers. The same channel names are used as Redis pub/sub
//! channel names and as the `type` discriminator on the browser stream.

use serde::{Deserialize, Serialize};

/// Discriminator of the handshake frame sent first on every event stream.
pub const HANDSHAKE_TYPE: &str = "connected";

/// Logical channel of a domain event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Protocol-wide metrics were recomputed.
    #[serde(rename = "metrics:updated")]
    MetricsUpdated,
    /// A liquidity pair changed (reserves, volume, price).
    #[serde(rename = "pair:updated")]
    PairUpdated,
    /// A token changed (price, supply, metadata).
    #[serde(rename = "token:updated")]
    TokenUpdated,
    /// A transaction was indexed.
    #[serde(rename = "transaction:updated")]
    TransactionUpdated,
}

impl EventKind {
    /// All event kinds, in channel subscription order.
    pub const ALL: [Self; 4] = [
        Self::MetricsUpdated,
        Self::PairUpdated,
        Self::TokenUpdated,
        Self::TransactionUpdated,
    ];

    /// Channel name on the backend and discriminator on the stream.
    #[must_use]
    pub const fn channel(self) -> &'static str {
        match self {
            Self::MetricsUpdated => "metrics:updated",
            Self::PairUpdated => "pair:updated",
            Self::TokenUpdated => "token:updated",
            Self::TransactionUpdated => "transaction:updated",
        }
    }

    /// Resolve a channel name. Returns `None` for anything unrecognized.
    #[must_use]
    pub fn from_channel(channel: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.channel() == channel)
    }

    /// Short label used in metrics.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::MetricsUpdated => "metrics",
            Self::PairUpdated => "pair",
            Self::TokenUpdated => "token",
            Self::TransactionUpdated => "transaction",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.channel())
    }
}

/// A domain event as seen by local subscribers.
///
/// The payload is an opaque JSON value forwarded verbatim from the producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    /// Logical channel.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Producer payload.
    pub payload: serde_json::Value,
}

impl RealtimeEvent {
    /// Create a new event.
    #[must_use]
    pub const fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self { kind, payload }
    }
}

/// Raw wire frame on the browser stream before demultiplexing.
///
/// `message_type` is kept as a string so unknown discriminators can be
/// reported instead of failing the decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEnvelope {
    /// Channel name or `connected`.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Payload; absent on some handshakes.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl StreamEnvelope {
    /// Build the handshake frame.
    #[must_use]
    pub fn handshake(payload: serde_json::Value) -> Self {
        Self {
            message_type: HANDSHAKE_TYPE.to_string(),
            payload,
        }
    }
}

impl From<RealtimeEvent> for StreamEnvelope {
    fn from(event: RealtimeEvent) -> Self {
        Self {
            message_type: event.kind.channel().to_string(),
            payload: event.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    #[test_case("metrics:updated", Some(EventKind::MetricsUpdated))]
    #[test_case("pair:updated", Some(EventKind::PairUpdated))]
    #[test_case("token:updated", Some(EventKind::TokenUpdated))]
    #[test_case("transaction:updated", Some(EventKind::TransactionUpdated))]
    #[test_case("connected", None)]
    #[test_case("PAIR:UPDATED", None)]
    #[test_case("", None)]
    fn channel_resolution(channel: &str, expected: Option<EventKind>) {
        assert_eq!(EventKind::from_channel(channel), expected);
    }

    #[test]
    fn channel_round_trips_for_every_kind() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_channel(kind.channel()), Some(kind));
        }
    }

    #[test]
    fn event_serializes_with_type_discriminator() {
        let event = RealtimeEvent::new(EventKind::PairUpdated, json!({"id": "0xabc"}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"type": "pair:updated", "payload": {"id": "0xabc"}}));
    }

    #[test]
    fn envelope_defaults_missing_payload_to_null() {
        let envelope: StreamEnvelope = serde_json::from_str(r#"{"type":"connected"}"#).unwrap();
        assert_eq!(envelope.message_type, HANDSHAKE_TYPE);
        assert!(envelope.payload.is_null());
    }
}
