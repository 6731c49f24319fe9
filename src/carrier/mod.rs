//! Carrier abstraction: one bidirectional message-framed channel.
//!
//! A carrier moves whole [`Frame`]s between client and server. Two concrete
//! transports exist:
//!
//! ```text
//! Carrier (trait)
//!     │
//!     ├── WsCarrier          (WebSocket, resumable variant)
//!     │   ├── client side: tokio-tungstenite stream
//!     │   └── server side: axum WebSocket
//!     │
//!     └── StreamCarrier      (length-prefixed frames over a hijacked
//!                             HTTP Upgrade byte stream, stateless variant)
//! ```
//!
//! A carrier must not be read by more than one task at a time, nor written
//! by more than one task at a time. The session guarantees this by keeping
//! all reads in its read loop and all writes in its write loop; the carrier
//! itself only separates the two halves internally so the loops never
//! contend with each other.

pub mod stream;
pub mod ws;

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::frame::Frame;

/// Errors surfaced by carrier reads and writes.
#[derive(Debug)]
pub enum CarrierError {
    /// The underlying transport is closed (EOF, reset, or WebSocket close).
    Closed,
    /// A write missed its deadline.
    Timeout,
    /// The peer violated the carrier contract (e.g. a non-binary message).
    Protocol(String),
    /// A frame arrived but could not be decoded.
    Decode(String),
    /// Transport-level I/O failure.
    Io(String),
}

impl std::fmt::Display for CarrierError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "carrier closed"),
            Self::Timeout => write!(f, "carrier write timed out"),
            Self::Protocol(msg) => write!(f, "carrier protocol violation: {msg}"),
            Self::Decode(msg) => write!(f, "carrier decode error: {msg}"),
            Self::Io(msg) => write!(f, "carrier i/o error: {msg}"),
        }
    }
}

impl std::error::Error for CarrierError {}

impl CarrierError {
    /// Whether the error is a protocol or decode violation, which a session
    /// treats as fatal rather than as a reason to reset the carrier.
    #[must_use]
    pub fn is_violation(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Decode(_))
    }
}

/// A full-duplex, message-framed, reliable-in-order channel.
///
/// `read` and `write` may be called concurrently with each other, but each
/// must only ever be in flight once (the session's loop split enforces
/// this). `close` is idempotent and safe to call from anywhere.
#[async_trait]
pub trait Carrier: Send + Sync {
    /// Block until one complete frame is available.
    ///
    /// # Errors
    ///
    /// `Closed` when the transport ends, `Protocol` on a non-binary
    /// message, `Decode` when the payload does not parse.
    async fn read(&self) -> Result<Frame, CarrierError>;

    /// Serialize one frame and hand it to the transport's write buffer.
    ///
    /// # Errors
    ///
    /// `Closed` when the transport is gone, `Timeout` when a configured
    /// write deadline elapses.
    async fn write(&self, frame: &Frame) -> Result<(), CarrierError>;

    /// Best-effort graceful shutdown of the underlying transport.
    async fn close(&self);

    /// Process-unique carrier id, for logs and for the reset slot
    /// comparison.
    fn id(&self) -> u64;
}

/// Allocate a process-unique carrier id.
pub(crate) fn next_carrier_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_carrier_ids_are_unique() {
        let a = next_carrier_id();
        let b = next_carrier_id();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_violation_classification() {
        assert!(CarrierError::Protocol("text frame".into()).is_violation());
        assert!(CarrierError::Decode("truncated".into()).is_violation());
        assert!(!CarrierError::Closed.is_violation());
        assert!(!CarrierError::Timeout.is_violation());
        assert!(!CarrierError::Io("reset".into()).is_violation());
    }

    #[test]
    fn test_error_display_is_stable() {
        // Log lines grep for these prefixes.
        assert_eq!(CarrierError::Closed.to_string(), "carrier closed");
        assert!(CarrierError::Timeout.to_string().contains("timed out"));
    }
}
