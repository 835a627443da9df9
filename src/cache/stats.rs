//! Cache Statistics Module
//!
//! Tracks cache activity: hits, misses, fetches, invalidations, evictions and rollbacks.

use serde::Serialize;

// == Cache Stats ==
/// Tracks cache performance metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Reads served from fresh data
    pub hits: u64,
    /// Reads served from stale data while a refetch runs
    pub stale_hits: u64,
    /// Reads that had to wait for a fetch
    pub misses: u64,
    /// Fetches started (deduplicated requests are not counted)
    pub fetches: u64,
    /// Fetches that ended in error after retries
    pub fetch_errors: u64,
    /// Entries marked stale by invalidation
    pub invalidations: u64,
    /// Entries removed by garbage collection
    pub evictions: u64,
    /// Optimistic layers undone after a failed mutation
    pub rollbacks: u64,
    /// Current number of entries in the cache
    pub total_entries: usize,
}

impl CacheStats {
    // == Constructor ==
    /// Creates a new CacheStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Fraction of reads answered without waiting, stale hits included.
    ///
    /// Returns 0.0 if no reads have been made.
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.stale_hits;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_stale_hit(&mut self) {
        self.stale_hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_fetch(&mut self) {
        self.fetches += 1;
    }

    pub fn record_fetch_error(&mut self) {
        self.fetch_errors += 1;
    }

    pub fn record_invalidation(&mut self) {
        self.invalidations += 1;
    }

    pub fn record_eviction(&mut self) {
        self.evictions += 1;
    }

    pub fn record_rollback(&mut self) {
        self.rollbacks += 1;
    }

    // == Update Entry Count ==
    /// Updates the total entries count.
    pub fn set_total_entries(&mut self, count: usize) {
        self.total_entries = count;
    }
}
