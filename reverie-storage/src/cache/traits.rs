//! Shared tier statistics.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use reverie_core::TierKind;

/// Statistics about one tier's usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierStats {
    pub tier: TierKind,
    /// Number of lookups answered by this tier.
    pub hits: u64,
    /// Number of lookups that fell through.
    pub misses: u64,
    /// Number of entries currently resident.
    pub entry_count: u64,
    pub bytes_used: u64,
    /// Zero when the tier is unbounded or disabled.
    pub byte_budget: u64,
    /// Entries removed by eviction or sweeps.
    pub evictions: u64,
    /// Entries purged after failing verification.
    pub corrupt_purged: u64,
}

impl TierStats {
    pub fn empty(tier: TierKind) -> Self {
        Self {
            tier,
            hits: 0,
            misses: 0,
            entry_count: 0,
            bytes_used: 0,
            byte_budget: 0,
            evictions: 0,
            corrupt_purged: 0,
        }
    }

    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Lock-free counters backing [`TierStats`].
#[derive(Debug, Default)]
pub(crate) struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    corrupt_purged: AtomicU64,
}

impl TierCounters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn evicted(&self, n: u64) {
        self.evictions.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn corrupt(&self) {
        self.corrupt_purged.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fill(&self, stats: &mut TierStats) {
        stats.hits = self.hits.load(Ordering::Relaxed);
        stats.misses = self.misses.load(Ordering::Relaxed);
        stats.evictions = self.evictions.load(Ordering::Relaxed);
        stats.corrupt_purged = self.corrupt_purged.load(Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let mut stats = TierStats::empty(TierKind::Memory);
        assert_eq!(stats.hit_rate(), 0.0);
        stats.hits = 3;
        stats.misses = 1;
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_counters_fill_stats() {
        let counters = TierCounters::default();
        counters.hit();
        counters.hit();
        counters.miss();
        counters.evicted(4);
        counters.corrupt();
        let mut stats = TierStats::empty(TierKind::Local);
        counters.fill(&mut stats);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 4);
        assert_eq!(stats.corrupt_purged, 1);
    }
}
