//! Registry statistics

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by a [`crate::House`]
#[derive(Debug, Default)]
pub struct HouseStats {
    /// Calls to `acquire`
    pub acquires: AtomicU64,
    /// Download grants handed out (new entries and refreshes)
    pub grants: AtomicU64,
    /// Grants caused by a newer source version
    pub refreshes: AtomicU64,
    /// Completed cleanup passes
    pub cleanup_runs: AtomicU64,
    /// Cleanup passes abandoned on error
    pub cleanup_failures: AtomicU64,
    /// Entries removed by cleanup
    pub evicted_entries: AtomicU64,
    /// Bytes released by cleanup
    pub evicted_bytes: AtomicU64,
    /// Entries removed by the non-archive purge
    pub purged_entries: AtomicU64,
}

/// Plain copy of [`HouseStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HouseStatsSnapshot {
    pub acquires: u64,
    pub grants: u64,
    pub refreshes: u64,
    pub cleanup_runs: u64,
    pub cleanup_failures: u64,
    pub evicted_entries: u64,
    pub evicted_bytes: u64,
    pub purged_entries: u64,
}

impl HouseStats {
    /// Read all counters
    pub fn snapshot(&self) -> HouseStatsSnapshot {
        HouseStatsSnapshot {
            acquires: self.acquires.load(Ordering::Relaxed),
            grants: self.grants.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            cleanup_runs: self.cleanup_runs.load(Ordering::Relaxed),
            cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
            evicted_entries: self.evicted_entries.load(Ordering::Relaxed),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
            purged_entries: self.purged_entries.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.acquires.store(0, Ordering::Relaxed);
        self.grants.store(0, Ordering::Relaxed);
        self.refreshes.store(0, Ordering::Relaxed);
        self.cleanup_runs.store(0, Ordering::Relaxed);
        self.cleanup_failures.store(0, Ordering::Relaxed);
        self.evicted_entries.store(0, Ordering::Relaxed);
        self.evicted_bytes.store(0, Ordering::Relaxed);
        self.purged_entries.store(0, Ordering::Relaxed);
    }
}
