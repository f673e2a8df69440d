//! Event Publisher
//!
//! Producer side of the distribution path: domain events are published onto
//! their backend channel through the same gating as cache operations.

use serde::Serialize;

use super::gate::UpstreamGate;
use crate::domain::events::EventKind;

/// Publishes domain events on backend channels.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    gate: UpstreamGate,
}

impl EventPublisher {
    /// Create a publisher.
    #[must_use]
    pub const fn new(gate: UpstreamGate) -> Self {
        Self { gate }
    }

    /// Publish `payload` on the channel for `kind`.
    ///
    /// Best effort: returns whether the event reached the upstream.
    pub async fn publish<T: Serialize>(&self, kind: EventKind, payload: &T) -> bool {
        let body = match serde_json::to_string(payload) {
            Ok(body) => body,
            Err(error) => {
                tracing::warn!(channel = kind.channel(), error = %error, "Failed to encode event payload");
                return false;
            }
        };

        let channel = kind.channel();
        let body = body.as_str();
        let delivered = self
            .gate
            .run("publish", |upstream| async move {
                upstream.publish(channel, body).await
            })
            .await
            .is_ok();

        if delivered {
            tracing::debug!(channel, "Published event");
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::application::ports::UpstreamStore;
    use crate::infrastructure::memory::{MemoryConnector, MemoryStore};
    use crate::infrastructure::resilience::{
        CircuitBreaker, CircuitBreakerConfig, ConnectionConfig, ConnectionManager,
    };

    fn publisher() -> (EventPublisher, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let gate = UpstreamGate::new(
            Arc::new(CircuitBreaker::new("test", CircuitBreakerConfig::default())),
            Arc::new(ConnectionManager::new(
                Arc::new(MemoryConnector::new(store.clone())),
                ConnectionConfig::default(),
            )),
            Duration::from_millis(500),
        );
        (EventPublisher::new(gate), store)
    }

    #[tokio::test]
    async fn publish_reaches_channel_subscribers() {
        let (publisher, store) = publisher();
        let mut messages = store.subscribe(&["pair:updated"]).await.unwrap();

        assert!(publisher.publish(EventKind::PairUpdated, &json!({"id": "0xabc"})).await);

        let message = messages.next().await.unwrap();
        assert_eq!(message.channel, "pair:updated");
        assert_eq!(message.payload, r#"{"id":"0xabc"}"#);
    }

    #[tokio::test]
    async fn publish_with_open_breaker_is_not_delivered() {
        let (publisher, store) = publisher();
        publisher.gate.breaker().force_open();

        assert!(!publisher.publish(EventKind::TokenUpdated, &json!({})).await);
        assert_eq!(store.command_count("publish"), 0);
    }
}
