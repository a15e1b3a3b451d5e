//! Per-worker traffic counters.

use std::sync::{
    atomic::{AtomicU64, Ordering::Relaxed},
    Arc,
};

use serde::{Deserialize, Serialize};

#[derive(Default)]
struct Counters {
    connections: AtomicU64,
    packages: AtomicU64,
    rx: AtomicU64,
    tx: AtomicU64,
}

/// Traffic counters for a worker process.
///
/// Tracks the number of open connections, the number of completed requests (or packages, for non-HTTP protocols), and
/// the cumulative number of bytes received and transmitted.
///
/// `TrafficStatus` is a cheap handle to shared counters: clones observe and update the same values, which lets
/// connection handling code running in its own tasks update the counters without going through the worker. Updates
/// never allocate or block, and the worker reports the counters to the master on its own schedule.
#[derive(Clone, Default)]
pub struct TrafficStatus {
    counters: Arc<Counters>,
}

impl TrafficStatus {
    /// Creates a new `TrafficStatus` with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a newly opened connection.
    pub fn connection_opened(&self) {
        self.counters.connections.fetch_add(1, Relaxed);
    }

    /// Records a closed connection.
    pub fn connection_closed(&self) {
        // Saturate at zero rather than wrapping if a caller reports a close twice.
        let _ = self
            .counters
            .connections
            .fetch_update(Relaxed, Relaxed, |current| current.checked_sub(1));
    }

    /// Records a completed request or package.
    pub fn increment_packages(&self) {
        self.counters.packages.fetch_add(1, Relaxed);
    }

    /// Records received bytes.
    pub fn add_rx(&self, bytes: u64) {
        self.counters.rx.fetch_add(bytes, Relaxed);
    }

    /// Records transmitted bytes.
    pub fn add_tx(&self, bytes: u64) {
        self.counters.tx.fetch_add(bytes, Relaxed);
    }

    /// Returns the number of currently open connections.
    pub fn connections(&self) -> u64 {
        self.counters.connections.load(Relaxed)
    }

    /// Returns the number of completed requests or packages.
    pub fn packages(&self) -> u64 {
        self.counters.packages.load(Relaxed)
    }

    /// Returns the total number of bytes received.
    pub fn rx(&self) -> u64 {
        self.counters.rx.load(Relaxed)
    }

    /// Returns the total number of bytes transmitted.
    pub fn tx(&self) -> u64 {
        self.counters.tx.load(Relaxed)
    }

    /// Takes a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            connections: self.connections(),
            packages: self.packages(),
            rx: self.rx(),
            tx: self.tx(),
        }
    }
}

/// A point-in-time copy of a worker's traffic counters.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct TrafficSnapshot {
    /// Open connections.
    pub connections: u64,

    /// Completed requests or packages.
    pub packages: u64,

    /// Bytes received.
    pub rx: u64,

    /// Bytes transmitted.
    pub tx: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let status = TrafficStatus::new();
        let connection_handler = status.clone();

        connection_handler.connection_opened();
        connection_handler.connection_opened();
        connection_handler.add_rx(512);
        connection_handler.add_tx(2048);
        connection_handler.increment_packages();
        connection_handler.connection_closed();

        assert_eq!(
            status.snapshot(),
            TrafficSnapshot {
                connections: 1,
                packages: 1,
                rx: 512,
                tx: 2048,
            }
        );
    }

    #[test]
    fn closing_without_open_connections_saturates() {
        let status = TrafficStatus::new();
        status.connection_closed();
        assert_eq!(status.connections(), 0);

        status.connection_opened();
        status.connection_closed();
        status.connection_closed();
        assert_eq!(status.connections(), 0);
    }
}
