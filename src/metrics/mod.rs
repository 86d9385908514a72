//! Node-local metrics.
//!
//! Plain atomics, read through [`NodeMetrics::snapshot`]. Nothing is exported
//! over the network; snapshots are logged and inspected in tests.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     NodeMetrics                       │
//! │  requests   writes   auth_failures   not_responsible  │
//! │  replicated_writes   replication_failures             │
//! │  transfers_in   transfers_out   active_connections    │
//! └──────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a counter at zero.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    /// Metric name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Add one.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n`.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A value that goes up and down.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    value: AtomicI64,
}

impl Gauge {
    /// Create a gauge at zero.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicI64::new(0),
        }
    }

    /// Metric name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters for one storage node.
#[derive(Debug)]
pub struct NodeMetrics {
    /// Client key-value requests handled.
    pub requests: Counter,
    /// Client writes applied.
    pub writes: Counter,
    /// Messages rejected for a bad, missing or replayed tag.
    pub auth_failures: Counter,
    /// Requests for keys this node does not serve.
    pub not_responsible: Counter,
    /// Writes forwarded to replicas.
    pub replicated_writes: Counter,
    /// Replica forwards or reconciliation steps that failed.
    pub replication_failures: Counter,
    /// Records received through data transfers.
    pub transfers_in: Counter,
    /// Records sent through data transfers.
    pub transfers_out: Counter,
    /// Open client and peer connections.
    pub active_connections: Gauge,
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self {
            requests: Counter::new("ringkv_requests_total"),
            writes: Counter::new("ringkv_writes_total"),
            auth_failures: Counter::new("ringkv_auth_failures_total"),
            not_responsible: Counter::new("ringkv_not_responsible_total"),
            replicated_writes: Counter::new("ringkv_replicated_writes_total"),
            replication_failures: Counter::new("ringkv_replication_failures_total"),
            transfers_in: Counter::new("ringkv_transfer_records_in_total"),
            transfers_out: Counter::new("ringkv_transfer_records_out_total"),
            active_connections: Gauge::new("ringkv_active_connections"),
        }
    }

    /// Point-in-time copy of every value.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.get(),
            writes: self.writes.get(),
            auth_failures: self.auth_failures.get(),
            not_responsible: self.not_responsible.get(),
            replicated_writes: self.replicated_writes.get(),
            replication_failures: self.replication_failures.get(),
            transfers_in: self.transfers_in.get(),
            transfers_out: self.transfers_out.get(),
            active_connections: self.active_connections.get(),
        }
    }
}

/// Copy of [`NodeMetrics`] values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub writes: u64,
    pub auth_failures: u64,
    pub not_responsible: u64,
    pub replicated_writes: u64,
    pub replication_failures: u64,
    pub transfers_in: u64,
    pub transfers_out: u64,
    pub active_connections: i64,
}
