//! Metrics collection for the partition consumer

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Per-consumer metrics collector
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    pub messages_received: AtomicU64,
    pub bytes_received: AtomicU64,

    // gauge-style: incremented on enqueue, decremented on dispatch
    pub prefetched_messages: AtomicU64,
    pub prefetched_bytes: AtomicU64,

    pub acks: AtomicU64,
    pub nacks: AtomicU64,
    pub dlq_messages: AtomicU64,

    pub ack_latency_sum_us: AtomicU64,
    pub ack_latency_count: AtomicU64,
}

impl ConsumerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame's worth of received entries
    pub fn record_received(&self, message_count: u64, byte_count: u64) {
        self.messages_received
            .fetch_add(message_count, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record messages entering the prefetch queue
    pub fn record_prefetched(&self, message_count: u64, byte_count: u64) {
        self.prefetched_messages
            .fetch_add(message_count, Ordering::Relaxed);
        self.prefetched_bytes.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record one message leaving the prefetch queue
    pub fn record_dispatched(&self, byte_count: u64) {
        self.prefetched_messages.fetch_sub(1, Ordering::Relaxed);
        self.prefetched_bytes.fetch_sub(byte_count, Ordering::Relaxed);
    }

    /// Record an acknowledgement and its receive-to-ack latency
    pub fn record_ack(&self, latency: Duration) {
        self.acks.fetch_add(1, Ordering::Relaxed);
        self.ack_latency_sum_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.ack_latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_nack(&self) {
        self.nacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dlq(&self) {
        self.dlq_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Average receive-to-ack latency in microseconds
    pub fn average_ack_latency_us(&self) -> f64 {
        let sum = self.ack_latency_sum_us.load(Ordering::Relaxed);
        let count = self.ack_latency_count.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }

    /// Get a point-in-time view of the counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            prefetched_messages: self.prefetched_messages.load(Ordering::Relaxed),
            prefetched_bytes: self.prefetched_bytes.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            nacks: self.nacks.load(Ordering::Relaxed),
            dlq_messages: self.dlq_messages.load(Ordering::Relaxed),
            average_ack_latency_us: self.average_ack_latency_us(),
        }
    }
}

/// Point-in-time view of [`ConsumerMetrics`]
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub bytes_received: u64,
    pub prefetched_messages: u64,
    pub prefetched_bytes: u64,
    pub acks: u64,
    pub nacks: u64,
    pub dlq_messages: u64,
    pub average_ack_latency_us: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefetch_gauge_balances() {
        let metrics = ConsumerMetrics::new();
        metrics.record_prefetched(3, 300);
        metrics.record_dispatched(100);
        metrics.record_dispatched(100);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.prefetched_messages, 1);
        assert_eq!(snapshot.prefetched_bytes, 100);
    }

    #[test]
    fn test_average_ack_latency() {
        let metrics = ConsumerMetrics::new();
        assert_eq!(metrics.average_ack_latency_us(), 0.0);
        metrics.record_ack(Duration::from_micros(100));
        metrics.record_ack(Duration::from_micros(300));
        assert_eq!(metrics.average_ack_latency_us(), 200.0);
        assert_eq!(metrics.snapshot().acks, 2);
    }
}
