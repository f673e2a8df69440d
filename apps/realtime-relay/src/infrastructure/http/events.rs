//! `/api/events` Server-Sent Events stream.
//!
//! Every stream starts with the `connected` handshake, then carries each bus
//! event as `{"type": <channel>, "payload": ...}`. An open stream counts as
//! one registered subscriber until the client disconnects.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};

use super::HttpState;
use crate::domain::events::{EventKind, StreamEnvelope};
use crate::domain::subscription::ConsumerId;
use crate::infrastructure::metrics;

/// Interval between keep-alive comments.
pub const STREAM_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Unregisters the stream's subscriber when the response body is dropped.
struct StreamGuard {
    state: Arc<HttpState>,
    consumer: ConsumerId,
}

impl StreamGuard {
    fn open(state: Arc<HttpState>) -> Self {
        let consumer = state.bridge.register(&EventKind::ALL);
        let clients = state.stream_clients.fetch_add(1, Ordering::SeqCst) + 1;
        publish_clients(clients);
        tracing::debug!(consumer, clients, "Event stream opened");
        Self { state, consumer }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.state.bridge.unregister(self.consumer);
        let clients = self
            .state
            .stream_clients
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        publish_clients(clients);
        tracing::debug!(consumer = self.consumer, clients, "Event stream closed");
    }
}

#[allow(clippy::cast_precision_loss)]
fn publish_clients(clients: usize) {
    metrics::set_stream_clients(clients as f64);
}

pub(super) async fn events_handler(
    State(state): State<Arc<HttpState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let guard = StreamGuard::open(state.clone());
    let handshake = StreamEnvelope::handshake(serde_json::json!({ "consumer": guard.consumer }));

    // Subscribe before the handshake goes out so nothing published after it
    // is missed.
    let events = state.bridge.bus().stream(&EventKind::ALL);

    // Open streams would otherwise hold graceful shutdown forever.
    let stream = futures::stream::once(futures::future::ready(handshake))
        .chain(events.map(StreamEnvelope::from))
        .take_until(state.shutdown.clone().cancelled_owned())
        .filter_map(move |envelope| {
            let _held = &guard;
            let event = match Event::default().json_data(&envelope) {
                Ok(event) => Some(Ok::<_, Infallible>(event)),
                Err(error) => {
                    tracing::warn!(message_type = %envelope.message_type, error = %error, "Failed to encode stream event");
                    None
                }
            };
            futures::future::ready(event)
        });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(STREAM_KEEP_ALIVE))
}
