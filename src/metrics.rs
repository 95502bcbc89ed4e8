//! Relay byte accounting.
//!
//! Two per-direction counters, each an atomic running total plus a queue of
//! per-frame byte counts for embedders that want to observe individual
//! frames (e.g. to drive a UI). No user-identifiable data is recorded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::queue::HandlerQueue;

/// One direction's byte counter.
///
/// Per-frame counts are offered to [`frames`](Self::frames); install a
/// handler to consume them, or they accumulate.
pub struct ByteCounter {
    total: AtomicU64,
    frames: Arc<HandlerQueue<usize, usize>>,
}

impl ByteCounter {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            frames: Arc::new(HandlerQueue::new()),
        }
    }

    /// Record one frame of `n` bytes.
    pub fn record(&self, n: usize) {
        self.total.fetch_add(n as u64, Ordering::Relaxed);
        let _ = self.frames.handle(n);
    }

    /// Running total in bytes.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// The per-frame count queue.
    pub fn frames(&self) -> Arc<HandlerQueue<usize, usize>> {
        Arc::clone(&self.frames)
    }
}

/// Byte counters for one relay, shared by its sessions.
pub struct RelayMetrics {
    /// Bytes of binary frames received from the peer.
    pub bytes_received_from_peer: ByteCounter,
    /// Bytes of TCP payload sent to the peer as binary frames.
    pub bytes_sent_to_peer: ByteCounter,
}

impl RelayMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self {
            bytes_received_from_peer: ByteCounter::new(),
            bytes_sent_to_peer: ByteCounter::new(),
        }
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_totals_accumulate() {
        let metrics = RelayMetrics::new();
        metrics.bytes_sent_to_peer.record(4);
        metrics.bytes_sent_to_peer.record(6);
        metrics.bytes_received_from_peer.record(1);

        assert_eq!(metrics.bytes_sent_to_peer.total(), 10);
        assert_eq!(metrics.bytes_received_from_peer.total(), 1);
    }

    #[tokio::test]
    async fn test_per_frame_counts_are_observable() {
        let counter = RelayMetrics::new().bytes_sent_to_peer;
        counter.record(42);
        let first = counter.frames().set_sync_next_handler(|n| n).await.unwrap();
        assert_eq!(first, 42);
    }
}
