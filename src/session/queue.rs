//! Retransmit queue for the resumable session layer.
//!
//! Every RelayData frame a session produces is appended here before it is
//! written to the carrier, and removed only once the peer's piggybacked
//! receive sequence acknowledges it. When a carrier dies mid-session, the
//! queue is replayed in order over the fresh carrier; the receiver drops
//! anything it has already delivered, so replaying the whole queue is safe.
//!
//! # Protocol
//!
//! ```text
//! Sender                                Receiver
//!   │  Relay { tx_seq: 1, .. }             │
//!   │─────────────────────────────────────>│ delivers, rx_seq -> 2
//!   │  Relay { tx_seq: 2, .. }             │
//!   │────────────X (carrier dies)          │
//!   │                                      │
//!   │  (new carrier bound, replay 1..)     │
//!   │  Relay { tx_seq: 1, .. }             │
//!   │─────────────────────────────────────>│ tx_seq < rx_seq: dropped
//!   │  Relay { tx_seq: 2, .. }             │
//!   │─────────────────────────────────────>│ delivers, rx_seq -> 3
//!   │                                      │
//!   │  Relay { .., rx_seq: 3 }             │
//!   │<─────────────────────────────────────│ prunes 1 and 2
//! ```

use std::collections::VecDeque;

use crate::frame::RelayData;

/// Ordered buffer of produced-but-unacknowledged RelayData frames.
///
/// Frames are appended in `tx_seq` order and only ever removed from the
/// head, so the queue is always a contiguous ascending run of sequences.
#[derive(Debug, Default)]
pub struct RetransmitQueue {
    pending: VecDeque<RelayData>,
}

impl RetransmitQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame. Frames must arrive in ascending `tx_seq` order;
    /// the session's write loop is the only producer, so they do.
    pub fn push(&mut self, frame: RelayData) {
        debug_assert!(
            self.pending.back().is_none_or(|last| last.tx_seq < frame.tx_seq),
            "retransmit queue must stay ordered"
        );
        self.pending.push_back(frame);
    }

    /// Drop every frame the peer has acknowledged: all head frames with
    /// `tx_seq` strictly below the peer's expected receive sequence.
    ///
    /// Returns how many frames were pruned.
    pub fn prune(&mut self, peer_rx_seq: i64) -> usize {
        let mut pruned = 0;
        while self
            .pending
            .front()
            .is_some_and(|frame| frame.tx_seq < peer_rx_seq)
        {
            self.pending.pop_front();
            pruned += 1;
        }
        pruned
    }

    /// Clone the queue contents, oldest first, for replay over a fresh
    /// carrier.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RelayData> {
        self.pending.iter().cloned().collect()
    }

    /// Number of unacknowledged frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether every produced frame has been acknowledged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
