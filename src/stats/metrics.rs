//! Statistics for broadcast servers

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Server-wide statistics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerStats {
    /// Total connections ever accepted
    pub total_connections: u64,
    /// Connections rejected (limit, handshake failure, handler refusal)
    pub rejected_connections: u64,
    /// Current active connections
    pub active_connections: u64,
    /// Records received from clients
    pub messages_received: u64,
    /// Broadcast calls
    pub broadcasts: u64,
    /// Per-client deliveries queued
    pub deliveries_sent: u64,
    /// Per-client deliveries that failed
    pub deliveries_failed: u64,
    /// Time since the server last started
    pub uptime: Duration,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inbound records per second over the uptime
    pub fn receive_rate(&self) -> f64 {
        let secs = self.uptime.as_secs_f64();
        if secs > 0.0 {
            self.messages_received as f64 / secs
        } else {
            0.0
        }
    }

    /// Fraction of deliveries that failed (0.0 when nothing was attempted)
    pub fn failure_ratio(&self) -> f64 {
        let attempted = self.deliveries_sent + self.deliveries_failed;
        if attempted > 0 {
            self.deliveries_failed as f64 / attempted as f64
        } else {
            0.0
        }
    }
}

/// Live counters updated by the server tasks
#[derive(Debug, Default)]
pub struct ServerCounters {
    total_connections: AtomicU64,
    rejected_connections: AtomicU64,
    active_connections: AtomicU64,
    messages_received: AtomicU64,
    broadcasts: AtomicU64,
    deliveries_sent: AtomicU64,
    deliveries_failed: AtomicU64,
    started_at: parking_lot::Mutex<Option<Instant>>,
}

impl ServerCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_started(&self) {
        *self.started_at.lock() = Some(Instant::now());
    }

    pub fn mark_stopped(&self) {
        *self.started_at.lock() = None;
    }

    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturating: never wrap below zero
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn connection_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broadcast_done(&self, sent: usize, failed: usize) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.record_deliveries(sent, failed);
    }

    pub fn record_deliveries(&self, sent: usize, failed: usize) {
        self.deliveries_sent.fetch_add(sent as u64, Ordering::Relaxed);
        self.deliveries_failed.fetch_add(failed as u64, Ordering::Relaxed);
    }

    /// Take a consistent-enough snapshot for reporting
    pub fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            deliveries_sent: self.deliveries_sent.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            uptime: self
                .started_at
                .lock()
                .map(|t| t.elapsed())
                .unwrap_or(Duration::ZERO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_stats_new() {
        let stats = ServerStats::new();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.broadcasts, 0);
        assert_eq!(stats.receive_rate(), 0.0);
        assert_eq!(stats.failure_ratio(), 0.0);
    }

    #[test]
    fn test_connection_counters() {
        let counters = ServerCounters::new();
        counters.connection_opened();
        counters.connection_opened();
        counters.connection_closed();
        counters.connection_closed();
        // Extra close does not underflow
        counters.connection_closed();

        let stats = counters.snapshot();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.active_connections, 0);
    }

    #[test]
    fn test_failure_ratio() {
        let counters = ServerCounters::new();
        counters.broadcast_done(3, 1);

        let stats = counters.snapshot();
        assert_eq!(stats.broadcasts, 1);
        assert_eq!(stats.deliveries_sent, 3);
        assert_eq!(stats.deliveries_failed, 1);
        assert!((stats.failure_ratio() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_uptime_only_while_running() {
        let counters = ServerCounters::new();
        assert_eq!(counters.snapshot().uptime, Duration::ZERO);

        counters.mark_started();
        std::thread::sleep(Duration::from_millis(5));
        assert!(counters.snapshot().uptime >= Duration::from_millis(5));

        counters.mark_stopped();
        assert_eq!(counters.snapshot().uptime, Duration::ZERO);
    }
}
