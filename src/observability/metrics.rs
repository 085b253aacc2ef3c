//! Recovery and failover counters
//!
//! Counters only ever increase. All updates use relaxed atomics; readers
//! take a `MetricsSnapshot`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    ranges_recovered: AtomicU64,
    phantom_entities_stripped: AtomicU64,
    blocks_replayed: AtomicU64,
    pairs_applied: AtomicU64,
    /// Pairs outside every owned range, or outside the receiver plan
    pairs_skipped: AtomicU64,
    corrupt_fragments_skipped: AtomicU64,
    maintenance_tasks_scheduled: AtomicU64,
    phantom_ranges_loaded: AtomicU64,
    phantom_ranges_prepared: AtomicU64,
    phantom_ranges_committed: AtomicU64,
    phantom_updates_accepted: AtomicU64,
    phantom_updates_duplicate: AtomicU64,
    replay_batches_sent: AtomicU64,
    stale_requests_ignored: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ranges_recovered(&self, n: u64) {
        self.ranges_recovered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn increment_phantom_entities_stripped(&self) {
        self.phantom_entities_stripped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_blocks_replayed(&self) {
        self.blocks_replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_pairs_applied(&self, n: u64) {
        self.pairs_applied.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_pairs_skipped(&self, n: u64) {
        self.pairs_skipped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_corrupt_fragments_skipped(&self, n: u64) {
        self.corrupt_fragments_skipped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn increment_maintenance_tasks_scheduled(&self) {
        self.maintenance_tasks_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_phantom_ranges_loaded(&self, n: u64) {
        self.phantom_ranges_loaded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn increment_phantom_ranges_prepared(&self) {
        self.phantom_ranges_prepared.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_phantom_ranges_committed(&self, n: u64) {
        self.phantom_ranges_committed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn increment_phantom_updates_accepted(&self) {
        self.phantom_updates_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_phantom_updates_duplicate(&self) {
        self.phantom_updates_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_replay_batches_sent(&self, n: u64) {
        self.replay_batches_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn increment_stale_requests_ignored(&self) {
        self.stale_requests_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ranges_recovered: self.ranges_recovered.load(Ordering::Relaxed),
            phantom_entities_stripped: self.phantom_entities_stripped.load(Ordering::Relaxed),
            blocks_replayed: self.blocks_replayed.load(Ordering::Relaxed),
            pairs_applied: self.pairs_applied.load(Ordering::Relaxed),
            pairs_skipped: self.pairs_skipped.load(Ordering::Relaxed),
            corrupt_fragments_skipped: self.corrupt_fragments_skipped.load(Ordering::Relaxed),
            maintenance_tasks_scheduled: self.maintenance_tasks_scheduled.load(Ordering::Relaxed),
            phantom_ranges_loaded: self.phantom_ranges_loaded.load(Ordering::Relaxed),
            phantom_ranges_prepared: self.phantom_ranges_prepared.load(Ordering::Relaxed),
            phantom_ranges_committed: self.phantom_ranges_committed.load(Ordering::Relaxed),
            phantom_updates_accepted: self.phantom_updates_accepted.load(Ordering::Relaxed),
            phantom_updates_duplicate: self.phantom_updates_duplicate.load(Ordering::Relaxed),
            replay_batches_sent: self.replay_batches_sent.load(Ordering::Relaxed),
            stale_requests_ignored: self.stale_requests_ignored.load(Ordering::Relaxed),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

/// A point-in-time copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub ranges_recovered: u64,
    pub phantom_entities_stripped: u64,
    pub blocks_replayed: u64,
    pub pairs_applied: u64,
    pub pairs_skipped: u64,
    pub corrupt_fragments_skipped: u64,
    pub maintenance_tasks_scheduled: u64,
    pub phantom_ranges_loaded: u64,
    pub phantom_ranges_prepared: u64,
    pub phantom_ranges_committed: u64,
    pub phantom_updates_accepted: u64,
    pub phantom_updates_duplicate: u64,
    pub replay_batches_sent: u64,
    pub stale_requests_ignored: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registry_has_zero_values() {
        let registry = MetricsRegistry::new();
        assert_eq!(registry.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_increment_counters() {
        let registry = MetricsRegistry::new();
        registry.add_ranges_recovered(3);
        registry.add_pairs_applied(10);
        registry.add_pairs_applied(5);
        registry.increment_blocks_replayed();
        registry.increment_stale_requests_ignored();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.ranges_recovered, 3);
        assert_eq!(snapshot.pairs_applied, 15);
        assert_eq!(snapshot.blocks_replayed, 1);
        assert_eq!(snapshot.stale_requests_ignored, 1);
        assert_eq!(snapshot.pairs_skipped, 0);
    }

    #[test]
    fn test_to_json() {
        let registry = MetricsRegistry::new();
        registry.add_replay_batches_sent(1);

        let parsed: serde_json::Value = serde_json::from_str(&registry.to_json()).unwrap();
        assert_eq!(parsed["replay_batches_sent"], 1);
        assert_eq!(parsed["phantom_ranges_committed"], 0);
    }

    #[test]
    fn test_thread_safety() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(MetricsRegistry::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let reg = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    reg.increment_phantom_updates_accepted();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.snapshot().phantom_updates_accepted, 1000);
    }
}
