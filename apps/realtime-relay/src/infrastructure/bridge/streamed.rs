//! Streamed Subscription
//!
//! Remote-side transport: one long-lived Server-Sent Events request to the
//! relay's `/api/events` endpoint. Each `data:` field becomes one envelope
//! frame.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use super::codec::SseDecoder;
use crate::application::ports::{EventTransport, FrameStream, InboundFrame, TransportError};

/// Default connect timeout for the stream request.
pub const DEFAULT_STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// SSE transport.
#[derive(Debug, Clone)]
pub struct StreamedSubscription {
    client: reqwest::Client,
    url: String,
}

impl StreamedSubscription {
    /// Create a transport for `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TransportError::Open(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Stream endpoint.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EventTransport for StreamedSubscription {
    fn name(&self) -> &'static str {
        "streamed"
    }

    async fn open(&self) -> Result<FrameStream, TransportError> {
        tracing::info!(url = %self.url, "Opening event stream");

        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError::Open(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus(status.as_u16()));
        }

        let frames = response
            .bytes_stream()
            .scan(SseDecoder::new(), |decoder, chunk| {
                let data = match chunk {
                    Ok(bytes) => decoder.push(&bytes).unwrap_or_else(|error| {
                        tracing::warn!(error = %error, "Dropping undecodable stream frame");
                        Vec::new()
                    }),
                    Err(error) => {
                        tracing::warn!(error = %error, "Event stream read failed");
                        return futures::future::ready(None);
                    }
                };
                futures::future::ready(Some(futures::stream::iter(
                    data.into_iter().map(InboundFrame::Envelope),
                )))
            })
            .flatten();
        Ok(frames.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_url() {
        let transport =
            StreamedSubscription::new("http://127.0.0.1:1/api/events", Duration::from_secs(1))
                .unwrap();
        assert_eq!(transport.url(), "http://127.0.0.1:1/api/events");
        assert_eq!(transport.name(), "streamed");
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_to_open() {
        let transport =
            StreamedSubscription::new("http://127.0.0.1:1/api/events", Duration::from_millis(200))
                .unwrap();
        assert!(matches!(transport.open().await, Err(TransportError::Open(_))));
    }
}
