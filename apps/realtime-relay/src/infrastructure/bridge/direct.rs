//! Direct Subscription
//!
//! Server-side transport: subscribes to the four backend channels on the
//! connection owned by the connection manager. Never opens a connection of
//! its own.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;

use crate::application::ports::{EventTransport, FrameStream, InboundFrame, TransportError};
use crate::domain::events::EventKind;
use crate::infrastructure::resilience::ConnectionManager;

/// Backend pub/sub transport.
#[derive(Debug, Clone)]
pub struct DirectSubscription {
    connections: Arc<ConnectionManager>,
}

impl DirectSubscription {
    /// Create a transport over the shared connection manager.
    #[must_use]
    pub const fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }
}

#[async_trait]
impl EventTransport for DirectSubscription {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn open(&self) -> Result<FrameStream, TransportError> {
        let handle = self
            .connections
            .acquire()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        let channels = EventKind::ALL.map(EventKind::channel);
        let messages = match handle.subscribe(&channels).await {
            Ok(messages) => messages,
            Err(error) => {
                self.connections.report_failure(&handle, &error);
                return Err(TransportError::Open(error.to_string()));
            }
        };

        tracing::info!(channels = ?channels, "Subscribed to backend channels");
        Ok(messages
            .map(|message| InboundFrame::Channel {
                channel: message.channel,
                payload: message.payload,
            })
            .boxed())
    }
}
