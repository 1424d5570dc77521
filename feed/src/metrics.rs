//! Feed metrics tracking.
//!
//! Provides atomic counters for monitoring one exchange connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for one exchange feed.
#[derive(Debug)]
pub struct FeedMetrics {
    /// Sessions opened.
    connections_opened: AtomicU64,

    /// Sessions closed.
    connections_closed: AtomicU64,

    /// Inbound frames.
    frames_received: AtomicU64,

    /// Outbound frames.
    frames_sent: AtomicU64,

    /// Inbound frames discarded without effect.
    frames_dropped: AtomicU64,

    /// Snapshots applied to a replica.
    snapshots_applied: AtomicU64,

    /// Deltas merged into a replica.
    deltas_applied: AtomicU64,

    /// Forced resynchronizations.
    resyncs: AtomicU64,

    /// Wire subscriptions confirmed.
    subscriptions: AtomicU64,

    /// Wire unsubscriptions confirmed.
    unsubscriptions: AtomicU64,

    /// Acknowledgments that never arrived.
    ack_timeouts: AtomicU64,

    /// Listener invocations that failed.
    listener_failures: AtomicU64,

    /// Start time for uptime.
    start_time: Instant,
}

impl Default for FeedMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedMetrics {
    /// Creates a new metrics instance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            snapshots_applied: AtomicU64::new(0),
            deltas_applied: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
            subscriptions: AtomicU64::new(0),
            unsubscriptions: AtomicU64::new(0),
            ack_timeouts: AtomicU64::new(0),
            listener_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Records a session opened.
    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a session closed.
    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an inbound frame.
    pub fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an outbound frame.
    pub fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a dropped inbound frame.
    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an applied snapshot.
    pub fn record_snapshot(&self) {
        self.snapshots_applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an applied delta.
    pub fn record_delta(&self) {
        self.deltas_applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a forced resynchronization.
    pub fn record_resync(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a confirmed subscription.
    pub fn record_subscription(&self) {
        self.subscriptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a confirmed unsubscription.
    pub fn record_unsubscription(&self) {
        self.unsubscriptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an acknowledgment timeout.
    pub fn record_ack_timeout(&self) {
        self.ack_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records failed listener invocations.
    pub fn record_listener_failures(&self, count: u64) {
        self.listener_failures.fetch_add(count, Ordering::Relaxed);
    }

    /// Returns the sessions opened.
    #[must_use]
    pub fn connections_opened(&self) -> u64 {
        self.connections_opened.load(Ordering::Relaxed)
    }

    /// Returns the sessions closed.
    #[must_use]
    pub fn connections_closed(&self) -> u64 {
        self.connections_closed.load(Ordering::Relaxed)
    }

    /// Returns the inbound frames.
    #[must_use]
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Returns the outbound frames.
    #[must_use]
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Returns the dropped inbound frames.
    #[must_use]
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    /// Returns the applied snapshots.
    #[must_use]
    pub fn snapshots_applied(&self) -> u64 {
        self.snapshots_applied.load(Ordering::Relaxed)
    }

    /// Returns the applied deltas.
    #[must_use]
    pub fn deltas_applied(&self) -> u64 {
        self.deltas_applied.load(Ordering::Relaxed)
    }

    /// Returns the forced resynchronizations.
    #[must_use]
    pub fn resyncs(&self) -> u64 {
        self.resyncs.load(Ordering::Relaxed)
    }

    /// Returns the confirmed subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> u64 {
        self.subscriptions.load(Ordering::Relaxed)
    }

    /// Returns the confirmed unsubscriptions.
    #[must_use]
    pub fn unsubscriptions(&self) -> u64 {
        self.unsubscriptions.load(Ordering::Relaxed)
    }

    /// Returns the acknowledgment timeouts.
    #[must_use]
    pub fn ack_timeouts(&self) -> u64 {
        self.ack_timeouts.load(Ordering::Relaxed)
    }

    /// Returns the failed listener invocations.
    #[must_use]
    pub fn listener_failures(&self) -> u64 {
        self.listener_failures.load(Ordering::Relaxed)
    }

    /// Returns the uptime.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Returns a snapshot of all metrics.
    #[must_use]
    pub fn snapshot(&self) -> FeedMetricsSnapshot {
        FeedMetricsSnapshot {
            connections_opened: self.connections_opened(),
            connections_closed: self.connections_closed(),
            frames_received: self.frames_received(),
            frames_sent: self.frames_sent(),
            frames_dropped: self.frames_dropped(),
            snapshots_applied: self.snapshots_applied(),
            deltas_applied: self.deltas_applied(),
            resyncs: self.resyncs(),
            subscriptions: self.subscriptions(),
            unsubscriptions: self.unsubscriptions(),
            ack_timeouts: self.ack_timeouts(),
            listener_failures: self.listener_failures(),
            uptime: self.uptime(),
        }
    }
}

/// A point-in-time snapshot of feed metrics.
#[derive(Debug, Clone)]
pub struct FeedMetricsSnapshot {
    /// Sessions opened.
    pub connections_opened: u64,
    /// Sessions closed.
    pub connections_closed: u64,
    /// Inbound frames.
    pub frames_received: u64,
    /// Outbound frames.
    pub frames_sent: u64,
    /// Dropped inbound frames.
    pub frames_dropped: u64,
    /// Applied snapshots.
    pub snapshots_applied: u64,
    /// Applied deltas.
    pub deltas_applied: u64,
    /// Forced resynchronizations.
    pub resyncs: u64,
    /// Confirmed subscriptions.
    pub subscriptions: u64,
    /// Confirmed unsubscriptions.
    pub unsubscriptions: u64,
    /// Acknowledgment timeouts.
    pub ack_timeouts: u64,
    /// Failed listener invocations.
    pub listener_failures: u64,
    /// Uptime.
    pub uptime: Duration,
}
