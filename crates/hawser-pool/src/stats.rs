//! Thread-safe pool statistics, global and per-endpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Lock-free counter set for one scope (global or one endpoint)
#[derive(Debug, Default)]
pub struct PoolCounters {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    connections_failed: AtomicU64,
    acquires: AtomicU64,
    acquire_timeouts: AtomicU64,
    releases: AtomicU64,
    validation_failures: AtomicU64,
    active: AtomicU64,
    idle: AtomicU64,
    acquire_wait_nanos: AtomicU64,
}

impl PoolCounters {
    /// Record a successful connection creation
    pub fn note_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection close
    pub fn note_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed connection creation
    pub fn note_create_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful acquire and how long the caller waited
    pub fn note_acquired(&self, wait: Duration) {
        self.acquires.fetch_add(1, Ordering::Relaxed);
        self.acquire_wait_nanos
            .fetch_add(wait.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Record an acquire that timed out
    pub fn note_acquire_timeout(&self) {
        self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection release
    pub fn note_released(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a validation failure
    pub fn note_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the active-connection gauge
    pub fn gauge_active_inc(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the active-connection gauge
    pub fn gauge_active_dec(&self) {
        saturating_dec(&self.active);
    }

    /// Increment the idle-connection gauge
    pub fn gauge_idle_inc(&self) {
        self.idle.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the idle-connection gauge
    pub fn gauge_idle_dec(&self) {
        saturating_dec(&self.idle);
    }

    /// Take a point-in-time copy of the counters
    #[must_use]
    pub fn snapshot(&self) -> CountersSnapshot {
        let acquires = self.acquires.load(Ordering::Relaxed);
        let wait_nanos = self.acquire_wait_nanos.load(Ordering::Relaxed);
        let mean_acquire_wait_ms = if acquires == 0 {
            0.0
        } else {
            (wait_nanos as f64 / acquires as f64) / 1_000_000.0
        };

        CountersSnapshot {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            acquires,
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            idle: self.idle.load(Ordering::Relaxed),
            mean_acquire_wait_ms,
        }
    }
}

fn saturating_dec(counter: &AtomicU64) {
    let mut current = counter.load(Ordering::Relaxed);
    while current > 0 {
        match counter.compare_exchange_weak(
            current,
            current - 1,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

/// Point-in-time copy of one counter scope
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CountersSnapshot {
    /// Total connections created
    pub connections_created: u64,
    /// Total connections closed
    pub connections_closed: u64,
    /// Total connection creation failures
    pub connections_failed: u64,
    /// Total successful acquires
    pub acquires: u64,
    /// Total acquires that timed out
    pub acquire_timeouts: u64,
    /// Total releases
    pub releases: u64,
    /// Total validation failures
    pub validation_failures: u64,
    /// Connections currently checked out
    pub active: u64,
    /// Connections currently idle
    pub idle: u64,
    /// Mean acquire wait in milliseconds
    pub mean_acquire_wait_ms: f64,
}

/// Snapshot of the whole statistics registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatsSnapshot {
    /// When the snapshot was taken
    pub taken_at: chrono::DateTime<chrono::Utc>,
    /// Counters aggregated across every endpoint
    pub global: CountersSnapshot,
    /// Counters per canonical endpoint key
    pub per_endpoint: HashMap<String, CountersSnapshot>,
}

/// Statistics registry: one global counter set plus one per endpoint.
///
/// Every recording method updates both scopes, so the global counters are
/// always the sum of the per-endpoint ones. A disabled registry turns every
/// recording into a no-op and snapshots as all zeros.
#[derive(Debug)]
pub struct StatsRegistry {
    enabled: bool,
    global: PoolCounters,
    per_endpoint: DashMap<String, Arc<PoolCounters>>,
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: true,
            global: PoolCounters::default(),
            per_endpoint: DashMap::new(),
        }
    }

    /// Create a registry that records nothing
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    /// Counters for one endpoint, created on first use
    #[must_use]
    pub fn endpoint(&self, key: &str) -> Arc<PoolCounters> {
        self.per_endpoint
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Global counters
    #[must_use]
    pub fn global(&self) -> &PoolCounters {
        &self.global
    }

    /// Apply a recording closure to both the global and the endpoint scope.
    /// No-op when statistics are disabled.
    pub fn apply<F>(&self, key: &str, record: F)
    where
        F: Fn(&PoolCounters),
    {
        if !self.enabled {
            return;
        }
        record(&self.global);
        record(&self.endpoint(key));
    }

    /// Take a point-in-time snapshot of every scope
    #[must_use]
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        let per_endpoint = self
            .per_endpoint
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();

        PoolStatsSnapshot {
            taken_at: chrono::Utc::now(),
            global: self.global.snapshot(),
            per_endpoint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_updates_both_scopes() {
        let stats = StatsRegistry::new();
        stats.apply("tcp://a:1", PoolCounters::note_created);
        stats.apply("tcp://a:1", PoolCounters::note_created);
        stats.apply("tcp://b:2", PoolCounters::note_created);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.global.connections_created, 3);
        assert_eq!(
            snapshot.per_endpoint["tcp://a:1"].connections_created,
            2
        );
        assert_eq!(
            snapshot.per_endpoint["tcp://b:2"].connections_created,
            1
        );
    }

    #[test]
    fn test_mean_wait_derivation() {
        let counters = PoolCounters::default();
        counters.note_acquired(Duration::from_millis(10));
        counters.note_acquired(Duration::from_millis(30));

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.acquires, 2);
        assert!((snapshot.mean_acquire_wait_ms - 20.0).abs() < 0.5);
    }

    #[test]
    fn test_gauge_never_underflows() {
        let counters = PoolCounters::default();
        counters.gauge_idle_dec();
        counters.gauge_idle_dec();
        assert_eq!(counters.snapshot().idle, 0);

        counters.gauge_idle_inc();
        counters.gauge_idle_dec();
        assert_eq!(counters.snapshot().idle, 0);
    }

    #[test]
    fn test_reconciliation_arithmetic() {
        let counters = PoolCounters::default();
        for _ in 0..5 {
            counters.note_created();
            counters.gauge_active_inc();
        }
        // Two go back to idle, one closes
        for _ in 0..2 {
            counters.gauge_active_dec();
            counters.gauge_idle_inc();
        }
        counters.gauge_active_dec();
        counters.note_closed();

        let s = counters.snapshot();
        assert_eq!(
            s.connections_created - s.connections_closed,
            s.active + s.idle
        );
    }

    #[test]
    fn test_disabled_registry_records_nothing() {
        let stats = StatsRegistry::disabled();
        stats.apply("tcp://a:1", PoolCounters::note_created);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.global.connections_created, 0);
        assert!(snapshot.per_endpoint.is_empty());
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = StatsRegistry::new();
        stats.apply("tcp://a:1", |c| c.note_acquired(Duration::from_millis(5)));
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("tcp://a:1"));
    }
}
