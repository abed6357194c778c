//! Transport layer metrics collection.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Clone, Default, Serialize)]
/// Snapshot of transport metrics at a point in time.
pub struct MetricsSnapshot {
    /// Messages handed to the fabric.
    pub messages_sent: u64,
    /// Messages delivered to the application.
    pub messages_received: u64,
    /// Payload bytes sent.
    pub bytes_sent: u64,
    /// Payload bytes received.
    pub bytes_received: u64,
    /// Work requests posted with a completion requested.
    pub signaled_requests: u64,
    /// Work requests posted without a completion.
    pub unsignaled_requests: u64,
    /// Sends that found the ring full and had to wait for credit.
    pub flow_control_stalls: u64,
    /// Full passes over the doorbell array.
    pub doorbell_scans: u64,
    /// Doorbells found set.
    pub doorbell_hits: u64,
    /// Completions parked in the directional-wait cache.
    pub completions_cached: u64,
    /// Completions with a non-success status.
    pub completion_errors: u64,
    /// Queue pairs that reached ready-to-send.
    pub connections_established: u64,
    /// Queue pairs currently connected.
    pub active_connections: u32,
}

/// Thread-safe transport layer metrics collector.
pub struct TransportMetrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    signaled_requests: AtomicU64,
    unsignaled_requests: AtomicU64,
    flow_control_stalls: AtomicU64,
    doorbell_scans: AtomicU64,
    doorbell_hits: AtomicU64,
    completions_cached: AtomicU64,
    completion_errors: AtomicU64,
    connections_established: AtomicU64,
    active_connections: AtomicU32,
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransportMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl TransportMetrics {
    /// Creates a new TransportMetrics instance with all counters initialized to zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            signaled_requests: AtomicU64::new(0),
            unsignaled_requests: AtomicU64::new(0),
            flow_control_stalls: AtomicU64::new(0),
            doorbell_scans: AtomicU64::new(0),
            doorbell_hits: AtomicU64::new(0),
            completions_cached: AtomicU64::new(0),
            completion_errors: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            active_connections: AtomicU32::new(0),
        }
    }

    /// Records one outbound message of `bytes` payload bytes.
    pub fn message_sent(&self, bytes: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records one inbound message of `bytes` payload bytes.
    pub fn message_received(&self, bytes: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records a posted work request.
    pub fn work_request_posted(&self, signaled: bool) {
        if signaled {
            self.signaled_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.unsignaled_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Counts a sender blocking for ring credit.
    pub fn inc_flow_control_stalls(&self) {
        self.flow_control_stalls.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one pass over the doorbell array.
    pub fn inc_doorbell_scans(&self) {
        self.doorbell_scans.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds doorbells found set in one scan.
    pub fn add_doorbell_hits(&self, hits: u64) {
        self.doorbell_hits.fetch_add(hits, Ordering::Relaxed);
    }

    /// Adds completions parked for another waiter.
    pub fn add_completions_cached(&self, n: u64) {
        self.completions_cached.fetch_add(n, Ordering::Relaxed);
    }

    /// Counts a completion with a non-success status.
    pub fn inc_completion_errors(&self) {
        self.completion_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a queue pair reaching ready-to-send.
    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a connected queue pair being torn down.
    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Takes a snapshot of all current metric values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            signaled_requests: self.signaled_requests.load(Ordering::Relaxed),
            unsignaled_requests: self.unsignaled_requests.load(Ordering::Relaxed),
            flow_control_stalls: self.flow_control_stalls.load(Ordering::Relaxed),
            doorbell_scans: self.doorbell_scans.load(Ordering::Relaxed),
            doorbell_hits: self.doorbell_hits.load(Ordering::Relaxed),
            completions_cached: self.completions_cached.load(Ordering::Relaxed),
            completion_errors: self.completion_errors.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_metrics_new() {
        let snapshot = TransportMetrics::new().snapshot();
        assert_eq!(snapshot.messages_sent, 0);
        assert_eq!(snapshot.messages_received, 0);
        assert_eq!(snapshot.bytes_sent, 0);
        assert_eq!(snapshot.flow_control_stalls, 0);
        assert_eq!(snapshot.active_connections, 0);
    }

    #[test]
    fn test_message_and_bytes_tracking() {
        let metrics = TransportMetrics::new();
        metrics.message_sent(1024);
        metrics.message_sent(512);
        metrics.message_received(2048);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.bytes_sent, 1536);
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.bytes_received, 2048);
    }

    #[test]
    fn test_signaling_split() {
        let metrics = TransportMetrics::new();
        for i in 0..10 {
            metrics.work_request_posted(i % 4 == 0);
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.signaled_requests, 3);
        assert_eq!(snapshot.unsignaled_requests, 7);
    }

    #[test]
    fn test_connection_close_saturating() {
        let metrics = TransportMetrics::new();
        metrics.connection_established();
        metrics.connection_closed();
        metrics.connection_closed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.connections_established, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = TransportMetrics::new();
        metrics.add_doorbell_hits(3);
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"doorbell_hits\":3"));
    }

    #[test]
    fn test_concurrent_metrics() {
        let metrics = Arc::new(TransportMetrics::new());
        std::thread::scope(|s| {
            for _ in 0..8 {
                let metrics = Arc::clone(&metrics);
                s.spawn(move || {
                    for _ in 0..100 {
                        metrics.message_sent(10);
                        metrics.inc_doorbell_scans();
                    }
                });
            }
        });
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_sent, 800);
        assert_eq!(snapshot.bytes_sent, 8000);
        assert_eq!(snapshot.doorbell_scans, 800);
    }
}
