//! Observability snapshot for one cache instance.

use std::sync::atomic::Ordering;

use serde::Serialize;

use reverie_core::{CacheKeySource, KeyDeriver, QuotaSnapshot};
use reverie_llm::Generator;
use reverie_storage::TierStats;

use crate::orchestrator::TieredCache;

/// Point-in-time view of every tier, the governor and the coalescer.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsReport {
    pub generator: String,
    pub memory: TierStats,
    /// `None` when the cache runs without a local tier.
    pub local: Option<TierStats>,
    pub remote: TierStats,
    pub quota: QuotaSnapshot,
    /// Keys with a generation in flight.
    pub pending: usize,
    pub waiters: usize,
    pub remote_writes_pending: usize,
    pub remote_writes_ok: u64,
    pub remote_writes_failed: u64,
    pub generated: u64,
    pub generation_failures: u64,
    pub coalesced: u64,
}

impl CacheStatsReport {
    /// Fraction of lookups answered by any tier without generating.
    pub fn overall_hit_rate(&self) -> f64 {
        let hits = self.memory.hits
            + self.local.as_ref().map_or(0, |s| s.hits)
            + self.remote.hits;
        // every lookup that is not a hit in some tier ends in the coalescer
        let total = hits + self.generated + self.generation_failures + self.coalesced;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

impl<G, K> TieredCache<G, K>
where
    G: Generator,
    G::Request: CacheKeySource,
    K: KeyDeriver<G::Request> + 'static,
{
    pub fn stats(&self) -> CacheStatsReport {
        let inner = &self.inner;
        let (_, coalesced) = inner.coalescer.counts();
        let (remote_writes_ok, remote_writes_failed) = inner.remote.write_counts();
        CacheStatsReport {
            generator: inner.generator.name().to_string(),
            memory: inner.memory.stats(),
            local: inner.local.as_ref().map(|local| local.stats()),
            remote: inner.remote.stats(),
            quota: inner.governor.snapshot(),
            pending: inner.coalescer.pending_count(),
            waiters: inner.coalescer.waiter_count(),
            remote_writes_pending: inner.remote.pending_writes(),
            remote_writes_ok,
            remote_writes_failed,
            generated: inner.generated.load(Ordering::Relaxed),
            generation_failures: inner.generation_failures.load(Ordering::Relaxed),
            coalesced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverie_core::{InMemoryQuotaStore, QuotaLimits, ResetSchedule, SpeechRequest};
    use reverie_llm::MockSynthesizer;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stats_track_hits_and_generation() {
        let cache = TieredCache::builder(Arc::new(MockSynthesizer::new()))
            .quota(
                QuotaLimits::paid_tier().with_min_interval(Duration::ZERO),
                ResetSchedule::default(),
                Arc::new(InMemoryQuotaStore::new()),
            )
            .build();
        let request = SpeechRequest::new("Exhale slowly");
        cache.fetch(&request).await.unwrap();
        cache.fetch(&request).await.unwrap();
        cache.fetch(&request).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.generator, "mock-synthesizer");
        assert_eq!(stats.generated, 1);
        assert_eq!(stats.memory.hits, 2);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.quota.daily_count, 1);
        assert_eq!(stats.quota.limits.tier_name, "paid");
        assert!(stats.local.is_none());
        assert!((stats.overall_hit_rate() - 2.0 / 3.0).abs() < 1e-9);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["generated"], 1);
    }
}
