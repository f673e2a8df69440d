//! Bridge Codec
//!
//! Decoding for the two inbound wire formats:
//!
//! - **Backend channels**: channel name + raw JSON payload
//! - **Browser stream**: Server-Sent Events where every `data:` field carries
//!   a `{"type": ..., "payload": ...}` document
//!
//! Example SSE frame:
//! ```text
//! data: {"type":"pair:updated","payload":{"id":"0xabc"}}
//!
//! ```

use crate::application::ports::InboundFrame;
use crate::domain::events::{EventKind, HANDSHAKE_TYPE, RealtimeEvent, StreamEnvelope};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// The stream delivered bytes that are not UTF-8.
    #[error("invalid UTF-8 in event stream")]
    InvalidUtf8,

    /// An event grew past the decoder's size limit and was discarded.
    #[error("event exceeds {0} bytes")]
    EventTooLarge(usize),
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    /// The stream handshake; not re-emitted.
    Handshake,
    /// A domain event to re-emit on the bus.
    Event(RealtimeEvent),
    /// A discriminator this relay does not know.
    Unknown(String),
}

/// Decode one inbound frame.
///
/// # Errors
///
/// Returns an error if the payload is not valid JSON.
pub fn decode_frame(frame: &InboundFrame) -> Result<DecodedFrame, CodecError> {
    match frame {
        InboundFrame::Channel { channel, payload } => {
            let Some(kind) = EventKind::from_channel(channel) else {
                return Ok(DecodedFrame::Unknown(channel.clone()));
            };
            let payload: serde_json::Value = serde_json::from_str(payload)?;
            Ok(DecodedFrame::Event(RealtimeEvent::new(kind, payload)))
        }
        InboundFrame::Envelope(text) => {
            let envelope: StreamEnvelope = serde_json::from_str(text)?;
            if envelope.message_type == HANDSHAKE_TYPE {
                return Ok(DecodedFrame::Handshake);
            }
            Ok(EventKind::from_channel(&envelope.message_type).map_or(
                DecodedFrame::Unknown(envelope.message_type),
                |kind| DecodedFrame::Event(RealtimeEvent::new(kind, envelope.payload)),
            ))
        }
    }
}

// =============================================================================
// SSE Decoder
// =============================================================================

/// Largest event [`SseDecoder::new`] buffers before discarding it.
pub const DEFAULT_MAX_EVENT_BYTES: usize = 1024 * 1024;

/// Longest separator minus one: bytes that may start a separator still
/// waiting for its tail.
const SEPARATOR_CARRY: usize = 3;

/// Incremental Server-Sent Events decoder.
///
/// Feed it raw body chunks as they arrive; it returns the `data` of every
/// complete event. Comments (keep-alives), `event:`, `id:` and `retry:`
/// fields are ignored.
///
/// An event larger than the limit is dropped as it streams in, so the
/// buffer never holds much more than one chunk past the limit.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already searched for a separator.
    scanned: usize,
    /// Skipping the rest of an oversized event.
    discarding: bool,
    max_event_bytes: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SseDecoder {
    /// Create an empty decoder with [`DEFAULT_MAX_EVENT_BYTES`].
    #[must_use]
    pub const fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_EVENT_BYTES)
    }

    /// Create an empty decoder that discards events over `max_event_bytes`.
    #[must_use]
    pub const fn with_limit(max_event_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            discarding: false,
            max_event_bytes,
        }
    }

    /// Append a chunk and drain every complete event.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing decoded and an event was either not valid
    /// UTF-8 or over the size limit. The event is discarded; the decoder
    /// stays usable.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, CodecError> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut invalid = false;
        let mut oversized = false;
        while let Some((end, separator_len)) = find_event_boundary(&self.buffer, self.scanned) {
            let block: Vec<u8> = self.buffer.drain(..end + separator_len).take(end).collect();
            self.scanned = 0;
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if block.len() > self.max_event_bytes {
                oversized = true;
                continue;
            }
            match std::str::from_utf8(&block) {
                Ok(text) => events.extend(parse_event_block(text)),
                Err(_) => invalid = true,
            }
        }

        if self.buffer.len() > self.max_event_bytes || self.discarding {
            let drop_upto = self.buffer.len().saturating_sub(SEPARATOR_CARRY);
            self.buffer.drain(..drop_upto);
            oversized |= !std::mem::replace(&mut self.discarding, true);
        }
        self.scanned = self.buffer.len().saturating_sub(SEPARATOR_CARRY);

        if events.is_empty() {
            if oversized {
                return Err(CodecError::EventTooLarge(self.max_event_bytes));
            }
            if invalid {
                return Err(CodecError::InvalidUtf8);
            }
        }
        Ok(events)
    }

    /// Bytes buffered for an incomplete event.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

/// Position and length of the first blank-line separator at or after `from`.
fn find_event_boundary(buffer: &[u8], from: usize) -> Option<(usize, usize)> {
    let tail = buffer.get(from..)?;
    let lf = tail.windows(2).position(|w| w == b"\n\n").map(|i| (from + i, 2));
    let crlf = tail
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (from + i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_event_block(block: &str) -> Option<String> {
    let mut data: Option<String> = None;
    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        if field != "data" {
            continue;
        }
        let value = value.strip_prefix(' ').unwrap_or(value);
        match data.as_mut() {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(value);
            }
            None => data = Some(value.to_string()),
        }
    }
    data
}

// =============================================================================
// Tests
// =============================================================================
