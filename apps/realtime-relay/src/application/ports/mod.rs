//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `UpstreamConnector`: Opens the single upstream connection
//! - `UpstreamStore`: Key/value, list, sorted-set and pub/sub operations on it
//! - `EventTransport`: Opens one inbound event session for the bridge

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

// =============================================================================
// Errors
// =============================================================================

/// Upstream operation failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    /// Connect refused, reset, closed or otherwise lost.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Connect or command deadline elapsed.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The server rejected a command.
    #[error("command failed: {0}")]
    Command(String),

    /// Stored data could not be decoded.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl UpstreamError {
    /// Whether the error means the connection itself is unusable.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    /// Short label used in metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Timeout(_) => "timeout",
            Self::Command(_) => "command",
            Self::InvalidData(_) => "invalid_data",
        }
    }
}

/// Event transport failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The upstream connection could not be obtained.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    /// The transport could not be opened.
    #[error("failed to open transport: {0}")]
    Open(String),

    /// The server answered with a non-success status.
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),
}

// =============================================================================
// Upstream Store
// =============================================================================

/// Message received on a pub/sub channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Raw payload.
    pub payload: String,
}

/// Stream of pub/sub messages; ends when the subscription is lost.
pub type MessageStream = BoxStream<'static, UpstreamMessage>;

/// Operations on a live upstream connection.
#[async_trait]
pub trait UpstreamStore: Send + Sync {
    /// Round-trip health probe.
    async fn ping(&self) -> Result<(), UpstreamError>;

    /// Read a key.
    async fn get(&self, key: &str) -> Result<Option<String>, UpstreamError>;

    /// Write a key with an optional TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>)
    -> Result<(), UpstreamError>;

    /// Read many keys in one round trip, preserving order.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, UpstreamError>;

    /// Delete a key.
    async fn delete(&self, key: &str) -> Result<(), UpstreamError>;

    /// Publish a payload on a channel.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), UpstreamError>;

    /// Subscribe to channels.
    async fn subscribe(&self, channels: &[&str]) -> Result<MessageStream, UpstreamError>;

    /// Append to the tail of a list.
    async fn list_push(&self, key: &str, value: &str) -> Result<(), UpstreamError>;

    /// Length of a list.
    async fn list_len(&self, key: &str) -> Result<usize, UpstreamError>;

    /// Atomically remove the head of `list` and add it to the sorted set
    /// `claims` with score `claimed_at_ms`.
    ///
    /// The id is always in exactly one of the two.
    async fn list_pop_to_sorted(
        &self,
        list: &str,
        claims: &str,
        claimed_at_ms: u64,
    ) -> Result<Option<String>, UpstreamError>;

    /// Members of a sorted set with a score at or below `max_score`,
    /// lowest score first.
    async fn sorted_members_upto(
        &self,
        key: &str,
        max_score: u64,
    ) -> Result<Vec<String>, UpstreamError>;

    /// Remove a sorted set member.
    async fn sorted_remove(&self, key: &str, member: &str) -> Result<(), UpstreamError>;

    /// Size of a sorted set.
    async fn sorted_len(&self, key: &str) -> Result<usize, UpstreamError>;
}

/// Shared handle to a live upstream connection.
pub type UpstreamHandle = Arc<dyn UpstreamStore>;

/// Factory for upstream connections.
///
/// Only the connection manager calls this.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Open a connection and wait until it is ready to serve commands.
    async fn connect(&self) -> Result<UpstreamHandle, UpstreamError>;

    /// Endpoint description safe for logs.
    fn describe(&self) -> String;
}

// =============================================================================
// Event Transport
// =============================================================================

/// Raw frame received by an event transport, before demultiplexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Message from a backend channel.
    Channel {
        /// Channel name.
        channel: String,
        /// Raw JSON payload.
        payload: String,
    },
    /// `{type, payload}` JSON document from the browser stream.
    Envelope(String),
}

/// Stream of inbound frames; ends when the session is lost.
pub type FrameStream = BoxStream<'static, InboundFrame>;

/// Strategy for receiving events, selected once per process.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Transport name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Open one session.
    async fn open(&self) -> Result<FrameStream, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_classified() {
        assert!(UpstreamError::Connection("reset".into()).is_connection_error());
        assert!(UpstreamError::Timeout(Duration::from_secs(1)).is_connection_error());
        assert!(!UpstreamError::Command("WRONGTYPE".into()).is_connection_error());
        assert!(!UpstreamError::InvalidData("bad".into()).is_connection_error());
    }

    #[test]
    fn error_kinds() {
        assert_eq!(UpstreamError::Timeout(Duration::from_secs(1)).kind(), "timeout");
        assert_eq!(UpstreamError::InvalidData("x".into()).kind(), "invalid_data");
    }
}
