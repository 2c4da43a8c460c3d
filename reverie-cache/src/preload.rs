//! Batch preloading with bounded concurrency and pacing.
//!
//! Requests are processed in chunks of `PreloadConfig::concurrency`, capped so
//! the last item of a chunk can wait out the governor's spacing for the items
//! ahead of it without exceeding the retry ceiling. Between
//! chunks the preload pauses for the longer of the configured batch pause and
//! the governor's minimum spacing. A daily-quota denial stops the batch and
//! the remaining items are reported as skipped; short rate-limit and backoff
//! waits are slept through and retried.

use std::time::Duration;

use futures_util::future::join_all;

use reverie_core::{CacheKey, CacheKeySource, KeyDeriver, QuotaDenial, ReverieError, ReverieResult};
use reverie_llm::Generator;

use crate::orchestrator::{FetchSource, Fetched, TieredCache};

/// Result for one preloaded request.
#[derive(Debug, Clone)]
pub enum PreloadOutcome {
    /// Already cached in the given tier.
    Cached(FetchSource),
    /// Generated by this preload, or by a concurrent caller it joined.
    Generated,
    Failed(ReverieError),
    /// Not attempted because the daily quota ran out earlier in the batch.
    Skipped,
    /// Not attempted because `cancel_all` ran.
    Cancelled,
}

impl PreloadOutcome {
    fn from_result<A>(result: ReverieResult<Fetched<A>>) -> Self {
        match result {
            Ok(fetched) if fetched.source.is_cache_hit() => Self::Cached(fetched.source),
            Ok(_) => Self::Generated,
            Err(ReverieError::Cancelled { .. }) => Self::Cancelled,
            Err(e) => Self::Failed(e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Cached(_) | Self::Generated)
    }
}

/// Reported after every item.
#[derive(Debug, Clone)]
pub struct PreloadProgress {
    /// Items finished so far, including this one.
    pub completed: usize,
    pub total: usize,
    pub key: CacheKey,
    pub outcome: PreloadOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct PreloadSummary {
    pub total: usize,
    pub cached: usize,
    pub generated: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    /// The denial that ended the batch early, if any.
    pub stopped_by: Option<QuotaDenial>,
}

impl PreloadSummary {
    fn record(&mut self, outcome: &PreloadOutcome) {
        match outcome {
            PreloadOutcome::Cached(_) => self.cached += 1,
            PreloadOutcome::Generated => self.generated += 1,
            PreloadOutcome::Failed(_) => self.failed += 1,
            PreloadOutcome::Skipped => self.skipped += 1,
            PreloadOutcome::Cancelled => self.cancelled += 1,
        }
    }

    /// Every item is now cached.
    pub fn is_complete(&self) -> bool {
        self.cached + self.generated == self.total
    }
}

impl<G, K> TieredCache<G, K>
where
    G: Generator,
    G::Request: CacheKeySource,
    K: KeyDeriver<G::Request> + 'static,
{
    /// Warm the cache for `requests`, calling `on_progress` after each item.
    pub async fn preload<F>(&self, requests: &[G::Request], mut on_progress: F) -> PreloadSummary
    where
        F: FnMut(&PreloadProgress),
    {
        let epoch = self.inner.cancel_epoch.load(std::sync::atomic::Ordering::SeqCst);
        let min_interval = self.inner.governor.limits().min_interval();
        let concurrency = paced_concurrency(
            self.inner.preload.concurrency,
            min_interval,
            self.inner.preload.max_retry_wait(),
        );
        let pause = self.inner.preload.batch_pause().max(min_interval);
        let total = requests.len();

        tracing::info!(total, concurrency, pause_ms = pause.as_millis() as u64, "Preload started");

        let mut summary = PreloadSummary {
            total,
            ..Default::default()
        };
        let mut completed = 0usize;

        for (index, chunk) in requests.chunks(concurrency).enumerate() {
            if index > 0 && !pause.is_zero() && summary.stopped_by.is_none() {
                tokio::time::sleep(pause).await;
            }

            let halt = if self.inner.cancelled_since(epoch) {
                Some(PreloadOutcome::Cancelled)
            } else if summary.stopped_by.is_some() {
                Some(PreloadOutcome::Skipped)
            } else {
                None
            };
            if let Some(outcome) = halt {
                for request in &requests[index * concurrency..] {
                    completed += 1;
                    summary.record(&outcome);
                    on_progress(&PreloadProgress {
                        completed,
                        total,
                        key: self.key_for(request),
                        outcome: outcome.clone(),
                    });
                }
                break;
            }

            let results = join_all(chunk.iter().map(|request| self.preload_one(request, epoch))).await;

            for (request, result) in chunk.iter().zip(results) {
                let outcome = PreloadOutcome::from_result(result);
                if let PreloadOutcome::Failed(ReverieError::Quota(
                    denial @ QuotaDenial::QuotaExceeded { .. },
                )) = &outcome
                {
                    summary.stopped_by.get_or_insert_with(|| denial.clone());
                }
                completed += 1;
                summary.record(&outcome);
                on_progress(&PreloadProgress {
                    completed,
                    total,
                    key: self.key_for(request),
                    outcome,
                });
            }
        }

        tracing::info!(
            total,
            cached = summary.cached,
            generated = summary.generated,
            failed = summary.failed,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            "Preload finished"
        );
        summary
    }

    /// Fetch one item, sleeping through transient governor denials while the
    /// total wait stays under `max_retry_wait`.
    async fn preload_one(&self, request: &G::Request, epoch: u64) -> ReverieResult<Fetched<G::Output>> {
        let ceiling = self.inner.preload.max_retry_wait();
        let mut waited = Duration::ZERO;
        loop {
            match self.fetch_in_epoch(request, epoch).await {
                Err(ReverieError::Quota(denial)) if !matches!(denial, QuotaDenial::QuotaExceeded { .. }) => {
                    let wait = denial
                        .wait(self.inner.clock.now())
                        .max(Duration::from_millis(1));
                    if waited + wait > ceiling {
                        return Err(denial.into());
                    }
                    tracing::debug!(wait_ms = wait.as_millis() as u64, reason = %denial, "Preload item waiting on governor");
                    tokio::time::sleep(wait).await;
                    waited += wait;
                }
                other => return other,
            }
        }
    }
}

/// Largest chunk whose last item waits at most `ceiling` while the items
/// ahead of it are spaced `min_interval` apart.
fn paced_concurrency(configured: usize, min_interval: Duration, ceiling: Duration) -> usize {
    let configured = configured.max(1);
    if min_interval.is_zero() {
        return configured;
    }
    let fits = ceiling.as_millis() / min_interval.as_millis().max(1) + 1;
    configured.min(usize::try_from(fits).unwrap_or(usize::MAX))
}
