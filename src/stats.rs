//! # Server Statistics
//!
//! Counter map exposed via the `stats` command. Every counter is a plain
//! `AtomicU64`/`AtomicI64` so increments never need a lock; unknown names
//! read back as zero rather than erroring, so new counters can be added to
//! [`Statistics`] without breaking older clients that poll a fixed set.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Process-wide connection and traffic counters.
///
/// Mutated by the protocol handler (per-command counters) and the server
/// shell (connection and byte counters).
#[derive(Debug)]
pub struct Statistics {
    pub connections: AtomicI64,
    pub total_connections: AtomicU64,
    pub get_requests: AtomicU64,
    pub set_requests: AtomicU64,
    pub delete_requests: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub clean_exits: AtomicU64,
    pub start_time: u64,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            connections: AtomicI64::new(0),
            total_connections: AtomicU64::new(0),
            get_requests: AtomicU64::new(0),
            set_requests: AtomicU64::new(0),
            delete_requests: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            clean_exits: AtomicU64::new(0),
            start_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    /// Returns the named counter, or 0 for any name not tracked here.
    pub fn get_named(&self, name: &str) -> u64 {
        match name {
            "connections" => self.connections.load(Ordering::Relaxed).max(0) as u64,
            "total_connections" => self.total_connections.load(Ordering::Relaxed),
            "get_requests" => self.get_requests.load(Ordering::Relaxed),
            "set_requests" => self.set_requests.load(Ordering::Relaxed),
            "delete_requests" => self.delete_requests.load(Ordering::Relaxed),
            "bytes_read" => self.bytes_read.load(Ordering::Relaxed),
            "bytes_written" => self.bytes_written.load(Ordering::Relaxed),
            "clean_exits" => self.clean_exits.load(Ordering::Relaxed),
            "start_time" => self.start_time,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_counter_reads_zero() {
        let stats = Statistics::new();
        assert_eq!(stats.get_named("no_such_counter"), 0);
    }

    #[test]
    fn counters_are_monotonic_under_increment() {
        let stats = Statistics::new();
        stats.get_requests.fetch_add(1, Ordering::Relaxed);
        stats.get_requests.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.get_named("get_requests"), 2);
    }
}
