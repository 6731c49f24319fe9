//! Crate-wide tunables for burrow.
//!
//! This module centralizes the magic numbers of the tunnel so they are
//! discoverable and documented in one place. Constants are grouped by
//! domain.
//!
//! # Categories
//!
//! - **Relay**: buffer and queue sizing for the session loops
//! - **Timeouts**: carrier write, resume, and retry timing

use std::time::Duration;

// ============================================================================
// Relay
// ============================================================================

/// Size of the local TCP read buffer, and therefore the largest payload a
/// single RelayData frame carries.
pub const READ_BUF_SIZE: usize = 16 * 1024;

/// Ceiling for one encoded frame on a byte-stream carrier: the payload plus
/// slack for the sequence counters, timestamp, and codec framing.
pub const MAX_FRAME_SIZE: usize = READ_BUF_SIZE + 256;

/// Retransmit queue depth above which a warning is logged.
///
/// The queue is unbounded; this is a back-pressure signal only. The peer
/// acknowledging frames (via the piggybacked receive sequence) is what
/// actually drains it.
pub const QUEUE_WARN_DEPTH: usize = 100;

/// A received RelayData older than this requests a carrier reset: the frame
/// spent too long in flight, so the carrier is likely half-open.
pub const STALE_FRAME_AGE: Duration = Duration::from_secs(5);

// ============================================================================
// Timeouts
// ============================================================================

/// Per-write deadline the server imposes on its carriers so a stalled peer
/// cannot block a session loop indefinitely.
pub const SERVER_WRITE_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a server-side session waits for the client to rebind a fresh
/// carrier before giving up and closing both TCP peers.
pub const RESUME_TIMEOUT: Duration = Duration::from_secs(60);

/// Delay between failed carrier reset attempts.
pub const RESET_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Backoff after a failed TCP accept on the client listener. Prevents a
/// tight loop on transient fd exhaustion.
pub const ACCEPT_BACKOFF: Duration = Duration::from_secs(5);
