//! Wire frames exchanged over a carrier.
//!
//! Three frame kinds exist: a session-begin request (first message of every
//! carrier), its response, and relay data. All three are serialized with
//! bincode, which is deterministic and keeps the variant tag in the frame
//! itself, so a single decode entry point recovers the kind.
//!
//! On a WebSocket carrier each binary message is exactly one encoded frame.
//! On a byte-stream carrier frames are additionally length-prefixed by the
//! carrier (see [`crate::carrier::stream`]).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::READ_BUF_SIZE;

/// A session id. Positive, server-assigned, monotonically increasing from 1.
/// Zero is reserved: "create a new session" in a request, "refused" in a
/// response.
pub type SessionId = i64;

/// One chunk of tunneled TCP bytes plus the sender's sequence counters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayData {
    /// Sequence number the sender assigned to this frame (from 1).
    pub tx_seq: i64,
    /// The sequence the sender currently expects to receive - a piggybacked
    /// acknowledgement of everything below it.
    pub rx_seq: i64,
    /// Tunneled bytes, at most [`READ_BUF_SIZE`].
    pub data: Vec<u8>,
    /// Wallclock millis at enqueue, used for staleness detection.
    pub time_ms: i64,
}

impl RelayData {
    /// Age of this frame relative to `now_ms`, saturating at zero.
    #[must_use]
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.time_ms).max(0)
    }
}

/// First frame on every carrier: create a new session (`session_id == 0`,
/// `connect` set) or resume an existing one (`session_id > 0`, `connect`
/// ignored).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BeginRequest {
    /// 0 to create, >0 to resume.
    pub session_id: SessionId,
    /// Destination `host:port`. Only meaningful when creating.
    pub connect: String,
}

/// Reply to a [`BeginRequest`]. `session_id == 0` means refused, with the
/// reason in `reason`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BeginResponse {
    /// Assigned or confirmed id; 0 when refused.
    pub session_id: SessionId,
    /// Free-form refusal reason; empty on success.
    pub reason: String,
}

/// A discrete application-level message over a carrier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Frame {
    /// Session-begin request.
    Begin(BeginRequest),
    /// Session-begin response.
    BeginAck(BeginResponse),
    /// Tunneled bytes.
    Relay(RelayData),
}

impl Frame {
    /// Short kind label for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Begin(_) => "begin",
            Frame::BeginAck(_) => "begin-ack",
            Frame::Relay(_) => "relay",
        }
    }
}

/// Encode one frame to its wire bytes.
///
/// # Errors
///
/// Returns an error if serialization fails (it does not for well-formed
/// frames; payload size is enforced at read time by the session loop).
pub fn encode(frame: &Frame) -> Result<Vec<u8>> {
    bincode::serialize(frame).context("failed to encode frame")
}

/// Decode one frame from its wire bytes.
///
/// # Errors
///
/// Returns an error on truncated or malformed input, including payloads
/// above [`READ_BUF_SIZE`].
pub fn decode(bytes: &[u8]) -> Result<Frame> {
    let frame: Frame = bincode::deserialize(bytes).context("failed to decode frame")?;
    if let Frame::Relay(ref data) = frame {
        anyhow::ensure!(
            data.data.len() <= READ_BUF_SIZE,
            "relay payload of {} bytes exceeds the {} byte ceiling",
            data.data.len(),
            READ_BUF_SIZE
        );
    }
    Ok(frame)
}

/// Current wallclock in unix millis, the `time_ms` clock of [`RelayData`].
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
