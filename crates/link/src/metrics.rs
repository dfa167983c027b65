//! Link metrics for observability

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Counters of one link direction
#[derive(Debug, Default)]
pub struct LinkMetrics {
    /// Frames waiting for delivery
    queue_len: AtomicUsize,
    /// Frames accepted by `send`
    sent: AtomicU64,
    /// Frames handed to the receiver
    delivered: AtomicU64,
    /// Frames lost in flight (simulated loss)
    lost: AtomicU64,
    /// Frames refused because the queue was full
    dropped: AtomicU64,
    /// Frames refused for exceeding the payload limit
    oversize: AtomicU64,
}

impl LinkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_len(&self) -> usize {
        self.queue_len.load(Ordering::Relaxed)
    }

    pub fn set_queue_len(&self, len: usize) {
        self.queue_len.store(len, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn inc_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn inc_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    pub fn inc_lost(&self) {
        self.lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn inc_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn oversize(&self) -> u64 {
        self.oversize.load(Ordering::Relaxed)
    }

    pub fn inc_oversize(&self) {
        self.oversize.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queue_len: self.queue_len(),
            sent: self.sent(),
            delivered: self.delivered(),
            lost: self.lost(),
            dropped: self.dropped(),
            oversize: self.oversize(),
        }
    }
}

/// Snapshot of link metrics (for reporting)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub queue_len: usize,
    pub sent: u64,
    pub delivered: u64,
    pub lost: u64,
    pub dropped: u64,
    pub oversize: u64,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sent={} delivered={} lost={} dropped={} oversize={}",
            self.sent, self.delivered, self.lost, self.dropped, self.oversize
        )
    }
}
