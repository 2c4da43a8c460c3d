//! Background maintenance task.
//!
//! Periodically runs the local tier's age and size sweeps and collects the
//! outcomes of detached remote uploads so failures are counted and logged
//! rather than lost.
//!
//! ```ignore
//! let handle = spawn_maintenance(cache.clone(), MaintenanceConfig::from_env());
//! // ...
//! let metrics = handle.shutdown().await;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use reverie_core::{CacheKeySource, KeyDeriver};
use reverie_llm::Generator;
use reverie_storage::RemoteWriteOutcome;

use crate::orchestrator::TieredCache;

const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3600;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// How often to sweep the local tier (default: 1 hour)
    pub sweep_interval: Duration,
    /// Collect detached remote write outcomes on every pass (default: true)
    pub flush_remote: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            flush_remote: true,
        }
    }
}

impl MaintenanceConfig {
    /// # Environment Variables
    /// - `REVERIE_SWEEP_INTERVAL_SECS`: sweep period (default: 3600)
    /// - `REVERIE_FLUSH_REMOTE`: collect remote write outcomes (default: true)
    pub fn from_env() -> Self {
        let sweep_interval = Duration::from_secs(
            std::env::var("REVERIE_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
        );
        let flush_remote = std::env::var("REVERIE_FLUSH_REMOTE")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(true);

        Self {
            sweep_interval,
            flush_remote,
        }
    }

    /// Short interval for development and tests.
    pub fn development() -> Self {
        Self {
            sweep_interval: Duration::from_secs(10),
            flush_remote: true,
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct MaintenanceMetrics {
    pub passes: AtomicU64,
    pub expired: AtomicU64,
    pub evicted: AtomicU64,
    pub bytes_freed: AtomicU64,
    pub remote_writes_ok: AtomicU64,
    pub remote_writes_failed: AtomicU64,
    pub errors: AtomicU64,
}

impl MaintenanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MaintenanceSnapshot {
        MaintenanceSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            bytes_freed: self.bytes_freed.load(Ordering::Relaxed),
            remote_writes_ok: self.remote_writes_ok.load(Ordering::Relaxed),
            remote_writes_failed: self.remote_writes_failed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaintenanceSnapshot {
    pub passes: u64,
    pub expired: u64,
    pub evicted: u64,
    pub bytes_freed: u64,
    pub remote_writes_ok: u64,
    pub remote_writes_failed: u64,
    pub errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Runs maintenance passes until `shutdown_rx` carries `true`. The first pass
/// runs immediately.
pub async fn maintenance_task<G, K>(
    cache: TieredCache<G, K>,
    config: MaintenanceConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<MaintenanceMetrics>
where
    G: Generator,
    G::Request: CacheKeySource,
    K: KeyDeriver<G::Request> + 'static,
{
    let metrics = Arc::new(MaintenanceMetrics::new());

    let mut sweep_interval = interval(config.sweep_interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        sweep_interval_secs = config.sweep_interval.as_secs(),
        flush_remote = config.flush_remote,
        "Cache maintenance task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Cache maintenance task shutting down");
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                maintenance_pass(&cache, &config, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        passes = snapshot.passes,
        expired = snapshot.expired,
        evicted = snapshot.evicted,
        remote_writes_failed = snapshot.remote_writes_failed,
        errors = snapshot.errors,
        "Cache maintenance task completed"
    );

    metrics
}

/// One sweep of the local tier plus, if enabled, a remote write flush.
pub async fn maintenance_pass<G, K>(
    cache: &TieredCache<G, K>,
    config: &MaintenanceConfig,
    metrics: &MaintenanceMetrics,
) where
    G: Generator,
    G::Request: CacheKeySource,
    K: KeyDeriver<G::Request> + 'static,
{
    metrics.passes.fetch_add(1, Ordering::Relaxed);

    if let Some(local) = cache.local() {
        match local.sweep().await {
            Ok(report) => {
                metrics.expired.fetch_add(report.expired, Ordering::Relaxed);
                metrics.evicted.fetch_add(report.evicted, Ordering::Relaxed);
                metrics
                    .bytes_freed
                    .fetch_add(report.bytes_freed, Ordering::Relaxed);
                if report.expired > 0 || report.evicted > 0 {
                    tracing::info!(
                        expired = report.expired,
                        evicted = report.evicted,
                        bytes_freed = report.bytes_freed,
                        "Local sweep completed"
                    );
                } else {
                    tracing::trace!("Local sweep completed with nothing to remove");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Local sweep failed");
                metrics.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    if config.flush_remote {
        for outcome in cache.flush_remote_writes().await {
            match outcome {
                RemoteWriteOutcome::Written { .. } => {
                    metrics.remote_writes_ok.fetch_add(1, Ordering::Relaxed);
                }
                RemoteWriteOutcome::Failed { key, error } => {
                    tracing::warn!(key = %key, error = %error, "Remote write failed");
                    metrics.remote_writes_failed.fetch_add(1, Ordering::Relaxed);
                }
                RemoteWriteOutcome::Skipped { .. } => {}
            }
        }
    }
}

/// Handle to a spawned maintenance task.
pub struct MaintenanceHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Arc<MaintenanceMetrics>>,
}

impl MaintenanceHandle {
    /// Signal shutdown and wait for the task. `None` if it panicked.
    pub async fn shutdown(self) -> Option<Arc<MaintenanceMetrics>> {
        let _ = self.shutdown_tx.send(true);
        match self.task.await {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                tracing::error!(error = %e, "Cache maintenance task failed");
                None
            }
        }
    }
}

/// Spawn [`maintenance_task`] on the current runtime.
pub fn spawn_maintenance<G, K>(cache: TieredCache<G, K>, config: MaintenanceConfig) -> MaintenanceHandle
where
    G: Generator,
    G::Request: CacheKeySource,
    K: KeyDeriver<G::Request> + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(maintenance_task(cache, config, shutdown_rx));
    MaintenanceHandle { shutdown_tx, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverie_core::{
        Clock, InMemoryQuotaStore, LocalTierConfig, ManualClock, QuotaLimits, ResetSchedule,
        SpeechRequest,
    };
    use reverie_llm::MockSynthesizer;
    use reverie_storage::LocalTier;
    use tempfile::TempDir;

    #[test]
    fn test_config_from_env_defaults() {
        let config = MaintenanceConfig::default();
        assert_eq!(config.sweep_interval, Duration::from_secs(3600));
        assert!(config.flush_remote);
        assert_eq!(MaintenanceConfig::development().sweep_interval, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_maintenance_sweeps_expired_entries() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(
            chrono::DateTime::parse_from_rfc3339("2026-03-02T15:00:00Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
        ));
        let mut local_config = LocalTierConfig::new(dir.path());
        local_config.max_age_secs = 60;
        let local = LocalTier::open(local_config, clock.clone() as Arc<dyn Clock>)
            .await
            .unwrap();

        let cache = TieredCache::builder(Arc::new(MockSynthesizer::new()))
            .clock(clock.clone())
            .local(local)
            .quota(
                QuotaLimits::paid_tier(),
                ResetSchedule::default(),
                Arc::new(InMemoryQuotaStore::new()),
            )
            .build();
        cache.fetch(&SpeechRequest::new("Old news")).await.unwrap();
        assert_eq!(cache.local().map(|l| l.len()), Some(1));

        clock.advance(Duration::from_secs(120));
        let handle = spawn_maintenance(
            cache.clone(),
            MaintenanceConfig {
                sweep_interval: Duration::from_secs(3600),
                flush_remote: true,
            },
        );
        // the first tick fires immediately
        tokio::time::sleep(Duration::from_millis(200)).await;
        let metrics = handle.shutdown().await.expect("task completes").snapshot();

        assert!(metrics.passes >= 1);
        assert_eq!(metrics.expired, 1);
        assert_eq!(metrics.errors, 0);
        assert_eq!(cache.local().map(|l| l.len()), Some(0));
    }
}
