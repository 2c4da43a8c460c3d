//! The tiered cache orchestrator.
//!
//! One [`TieredCache`] serves one artifact family. It is generic over the
//! [`Generator`] that produces artifacts on a full miss and the
//! [`KeyDeriver`] that maps requests to cache keys, so text personalization
//! and speech synthesis are two instantiations of the same type.
//!
//! Lookup order on `fetch`:
//!
//! ```text
//! memory ──miss──▶ local ──miss──▶ remote ──miss──▶ coalescer ──▶ governor ──▶ generator
//!   ▲                │                │                                            │
//!   └── backfill ────┴── backfill ────┘◀──────────── write-through ────────────────┘
//! ```
//!
//! Tier failures are logged and treated as misses. Only quota denials,
//! generation failures and cancellation reach the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use reverie_core::{
    Artifact, CacheKey, CacheKeySource, CanonicalKeyDeriver, Clock, InMemoryQuotaStore,
    KeyDeriver, PreloadConfig, QuotaLimits, QuotaStore, ResetSchedule, ReverieConfig,
    ReverieError, ReverieResult, SourceMetadata, SystemClock, TierError,
};
use reverie_llm::{Generator, QuotaGovernor};
use reverie_storage::{
    HttpRemoteStore, LmdbQuotaStore, LocalTier, MemoryTier, RemoteStore, RemoteTier,
    RemoteWriteOutcome,
};

use crate::coalescer::{CoalesceRole, RequestCoalescer};

// ============================================================================
// PUBLIC TYPES
// ============================================================================

/// Which layer satisfied a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchSource {
    Memory,
    Local,
    Remote,
    /// This caller's own generation.
    Generated,
    /// Joined a generation started by another caller.
    Coalesced,
}

impl FetchSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Generated => "generated",
            Self::Coalesced => "coalesced",
        }
    }

    /// Served without a generation call.
    pub fn is_cache_hit(&self) -> bool {
        matches!(self, Self::Memory | Self::Local | Self::Remote)
    }
}

/// A fetched artifact with its key and provenance.
#[derive(Debug, Clone)]
pub struct Fetched<A> {
    pub key: CacheKey,
    pub artifact: A,
    pub source: FetchSource,
}

/// What [`TieredCache::clear`] removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearScope {
    Memory,
    Local,
    /// Memory and local. The remote store is shared and never wiped wholesale.
    All,
    /// One key from every tier, including the remote copy.
    Key(CacheKey),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClearReport {
    pub memory: u64,
    pub local: u64,
    pub remote: u64,
}

// ============================================================================
// SHARED STATE
// ============================================================================

pub(crate) struct CacheInner<G: Generator, K> {
    pub(crate) generator: Arc<G>,
    pub(crate) deriver: K,
    pub(crate) memory: MemoryTier<G::Output>,
    pub(crate) local: Option<LocalTier>,
    pub(crate) remote: RemoteTier,
    pub(crate) governor: Arc<QuotaGovernor>,
    pub(crate) coalescer: Arc<RequestCoalescer<G::Output>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) preload: PreloadConfig,
    /// Bumped by `cancel_all`; work captured under an older epoch that has
    /// not reached the provider yet is abandoned.
    pub(crate) cancel_epoch: AtomicU64,
    pub(crate) generated: AtomicU64,
    pub(crate) generation_failures: AtomicU64,
}

/// Tiered, quota-gated, coalescing cache for one artifact family.
///
/// Cloning is cheap and every clone shares the same tiers, governor and
/// pending-request registry.
pub struct TieredCache<G: Generator, K = CanonicalKeyDeriver> {
    pub(crate) inner: Arc<CacheInner<G, K>>,
}

impl<G: Generator, K> Clone for TieredCache<G, K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G: Generator> TieredCache<G, CanonicalKeyDeriver> {
    pub fn builder(generator: Arc<G>) -> TieredCacheBuilder<G> {
        TieredCacheBuilder::new(generator)
    }
}

impl<G, K> TieredCache<G, K>
where
    G: Generator,
    G::Request: CacheKeySource,
    K: KeyDeriver<G::Request> + 'static,
{
    /// Key the cache would store `request` under.
    pub fn key_for(&self, request: &G::Request) -> CacheKey {
        self.inner.deriver.derive(request)
    }

    /// Resolve `request` from the fastest tier that has it, generating it on
    /// a full miss.
    ///
    /// # Errors
    /// - [`ReverieError::Quota`] when the governor refuses the generation
    /// - [`ReverieError::Generation`] when the provider fails
    /// - [`ReverieError::Cancelled`] when `cancel_all` ran before generation
    ///   started
    pub async fn fetch(&self, request: &G::Request) -> ReverieResult<G::Output> {
        self.fetch_with_source(request)
            .await
            .map(|fetched| fetched.artifact)
    }

    /// Like [`fetch`](Self::fetch) but also reports which layer served it.
    pub async fn fetch_with_source(
        &self,
        request: &G::Request,
    ) -> ReverieResult<Fetched<G::Output>> {
        let epoch = self.inner.cancel_epoch.load(Ordering::SeqCst);
        self.fetch_in_epoch(request, epoch).await
    }

    pub(crate) async fn fetch_in_epoch(
        &self,
        request: &G::Request,
        epoch: u64,
    ) -> ReverieResult<Fetched<G::Output>> {
        let key = self.inner.deriver.derive(request);

        if let Some((artifact, source)) = self.inner.lookup(&key).await {
            return Ok(Fetched {
                key,
                artifact,
                source,
            });
        }

        if self.inner.cancelled_since(epoch) {
            return Err(ReverieError::Cancelled { key });
        }

        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let task_request = request.clone();
        let (result, role) = self
            .inner
            .coalescer
            .run(key.clone(), move || async move {
                inner.generate_and_store(task_key, task_request, epoch).await
            })
            .await;

        let source = match role {
            CoalesceRole::Leader => FetchSource::Generated,
            CoalesceRole::Follower => FetchSource::Coalesced,
        };
        result.map(|artifact| Fetched {
            key,
            artifact,
            source,
        })
    }

    /// Remove cached content. Tier failures are returned here, unlike in
    /// `fetch`, since the caller asked for the removal explicitly.
    pub async fn clear(&self, scope: ClearScope) -> ReverieResult<ClearReport> {
        let mut report = ClearReport::default();
        match scope {
            ClearScope::Memory => {
                report.memory = self.inner.memory.clear();
            }
            ClearScope::Local => {
                report.local = self.clear_local().await?;
            }
            ClearScope::All => {
                report.memory = self.inner.memory.clear();
                report.local = self.clear_local().await?;
            }
            ClearScope::Key(key) => {
                report.memory = u64::from(self.inner.memory.remove(&key));
                if let Some(local) = &self.inner.local {
                    report.local = u64::from(local.remove(&key).await?);
                }
                report.remote = u64::from(self.inner.remote.delete(&key).await);
            }
        }
        tracing::info!(
            memory = report.memory,
            local = report.local,
            remote = report.remote,
            "Cache cleared"
        );
        Ok(report)
    }

    /// Shorthand for clearing the key `request` maps to.
    pub async fn clear_request(&self, request: &G::Request) -> ReverieResult<ClearReport> {
        self.clear(ClearScope::Key(self.key_for(request))).await
    }

    async fn clear_local(&self) -> Result<u64, TierError> {
        match &self.inner.local {
            Some(local) => local.clear().await,
            None => Ok(0),
        }
    }

    /// Drop the pending-request registry and abandon queued work that has
    /// not reached the provider. Calls already sent are left to finish and
    /// their results are still cached. Returns how many pending keys were
    /// dropped.
    pub fn cancel_all(&self) -> usize {
        self.inner.cancel_epoch.fetch_add(1, Ordering::SeqCst);
        let dropped = self.inner.coalescer.cancel_all();
        tracing::info!(dropped, "Cancelled pending generations");
        dropped
    }

    /// Wait for detached remote uploads and collect their outcomes.
    pub async fn flush_remote_writes(&self) -> Vec<RemoteWriteOutcome> {
        self.inner.remote.flush().await
    }

    pub fn governor(&self) -> &Arc<QuotaGovernor> {
        &self.inner.governor
    }

    pub fn generator(&self) -> &Arc<G> {
        &self.inner.generator
    }

    pub fn memory(&self) -> &MemoryTier<G::Output> {
        &self.inner.memory
    }

    pub fn local(&self) -> Option<&LocalTier> {
        self.inner.local.as_ref()
    }

    pub fn remote(&self) -> &RemoteTier {
        &self.inner.remote
    }

    pub fn preload_config(&self) -> &PreloadConfig {
        &self.inner.preload
    }
}

impl<G, K> CacheInner<G, K>
where
    G: Generator,
    G::Request: CacheKeySource,
    K: KeyDeriver<G::Request> + 'static,
{
    pub(crate) fn cancelled_since(&self, epoch: u64) -> bool {
        self.cancel_epoch.load(Ordering::SeqCst) != epoch
    }

    async fn lookup(&self, key: &CacheKey) -> Option<(G::Output, FetchSource)> {
        if let Some(artifact) = self.memory.get(key) {
            return Some((artifact, FetchSource::Memory));
        }
        if let Some(artifact) = self.lookup_local(key).await {
            self.fill_memory(key, &artifact);
            return Some((artifact, FetchSource::Local));
        }
        if let Some(artifact) = self.lookup_remote(key).await {
            return Some((artifact, FetchSource::Remote));
        }
        tracing::debug!(key = %key, "Miss in every tier");
        None
    }

    async fn lookup_local(&self, key: &CacheKey) -> Option<G::Output> {
        let local = self.local.as_ref()?;
        match local.get(key).await {
            Ok(Some((bytes, _record))) => match G::Output::from_bytes(bytes) {
                Ok(artifact) => Some(artifact),
                Err(e) => {
                    tracing::warn!(
                        key = %key,
                        tier = "local",
                        error = %e,
                        "Local entry does not decode, purging"
                    );
                    if let Err(e) = local.remove(key).await {
                        tracing::warn!(key = %key, error = %e, "Failed to purge local entry");
                    }
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key = %key, tier = "local", error = %e, "Local tier unavailable");
                None
            }
        }
    }

    async fn lookup_remote(&self, key: &CacheKey) -> Option<G::Output> {
        let (bytes, entry) = self.remote.fetch(key).await?;
        let artifact = match G::Output::from_bytes(bytes.clone()) {
            Ok(artifact) => artifact,
            Err(e) => {
                tracing::warn!(key = %key, tier = "remote", error = %e, "Remote entry does not decode");
                return None;
            }
        };

        if let Some(local) = &self.local {
            if let Err(e) = local.put(key, &bytes, entry.source).await {
                tracing::warn!(key = %key, error = %e, "Failed to backfill local tier");
            }
        }
        self.fill_memory(key, &artifact);
        Some(artifact)
    }

    fn fill_memory(&self, key: &CacheKey, artifact: &G::Output) {
        if let Err(e) = self.memory.put(key.clone(), artifact.clone()) {
            tracing::debug!(key = %key, error = %e, "Not cached in memory");
        }
    }

    /// Leader side of a miss: runs inside the coalescer's detached task.
    async fn generate_and_store(
        self: Arc<Self>,
        key: CacheKey,
        request: G::Request,
        epoch: u64,
    ) -> ReverieResult<G::Output> {
        // an earlier leader may have finished between our lookup and now
        if let Some(artifact) = self.memory.peek(&key) {
            return Ok(artifact);
        }
        if self.cancelled_since(epoch) {
            return Err(ReverieError::Cancelled { key });
        }

        let reservation = self.governor.try_acquire()?;

        tracing::info!(key = %key, generator = self.generator.name(), "Generating artifact");
        let artifact = match self.generator.generate(&request).await {
            Ok(artifact) => {
                reservation.succeed();
                artifact
            }
            Err(e) => {
                if e.is_provider_quota() {
                    reservation.provider_error();
                } else {
                    reservation.release();
                }
                self.generation_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, error = %e, "Generation failed");
                return Err(e.into());
            }
        };
        self.generated.fetch_add(1, Ordering::Relaxed);

        self.write_through(&key, &request, &artifact).await;
        Ok(artifact)
    }

    /// Local synchronously, then memory, then a detached remote upload.
    async fn write_through(&self, key: &CacheKey, request: &G::Request, artifact: &G::Output) {
        let fields = request.key_fields();
        let source = SourceMetadata::describe(
            self.generator.name(),
            fields.namespace(),
            fields.to_map(),
            artifact,
        );
        let bytes = artifact.to_bytes();

        if let Some(local) = &self.local {
            if let Err(e) = local.put(key, &bytes, source.clone()).await {
                tracing::warn!(key = %key, error = %e, "Local write failed, serving from memory only");
            }
        }
        self.fill_memory(key, artifact);
        self.remote.put_detached(key.clone(), bytes, source);
    }
}

impl<G: Generator, K> std::fmt::Debug for TieredCache<G, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("generator", &self.inner.generator.name())
            .field("memory_bytes", &self.inner.memory.bytes_used())
            .field("local", &self.inner.local.is_some())
            .field("remote", &self.inner.remote.is_enabled())
            .finish()
    }
}

// ============================================================================
// BUILDER
// ============================================================================

const DEFAULT_MEMORY_BYTES: u64 = 32 * 1024 * 1024;

/// Wires tiers, governor and generator together.
///
/// Defaults: 32 MiB memory tier, no local tier, remote disabled, free-tier
/// quota with in-memory persistence, system clock.
pub struct TieredCacheBuilder<G: Generator, K = CanonicalKeyDeriver> {
    generator: Arc<G>,
    deriver: K,
    memory_bytes: u64,
    local: Option<LocalTier>,
    remote: RemoteTier,
    governor: Option<Arc<QuotaGovernor>>,
    clock: Arc<dyn Clock>,
    preload: PreloadConfig,
}

impl<G: Generator> TieredCacheBuilder<G> {
    pub fn new(generator: Arc<G>) -> Self {
        Self {
            generator,
            deriver: CanonicalKeyDeriver::new(),
            memory_bytes: DEFAULT_MEMORY_BYTES,
            local: None,
            remote: RemoteTier::disabled(),
            governor: None,
            clock: Arc::new(SystemClock),
            preload: PreloadConfig::default(),
        }
    }
}

impl<G: Generator, K> TieredCacheBuilder<G, K> {
    pub fn key_deriver<K2>(self, deriver: K2) -> TieredCacheBuilder<G, K2> {
        TieredCacheBuilder {
            generator: self.generator,
            deriver,
            memory_bytes: self.memory_bytes,
            local: self.local,
            remote: self.remote,
            governor: self.governor,
            clock: self.clock,
            preload: self.preload,
        }
    }

    pub fn memory_budget(mut self, max_bytes: u64) -> Self {
        self.memory_bytes = max_bytes;
        self
    }

    pub fn local(mut self, local: LocalTier) -> Self {
        self.local = Some(local);
        self
    }

    pub fn remote(mut self, remote: RemoteTier) -> Self {
        self.remote = remote;
        self
    }

    pub fn remote_store(mut self, store: Arc<dyn RemoteStore>, timeout: std::time::Duration) -> Self {
        self.remote = RemoteTier::new(store, timeout);
        self
    }

    pub fn governor(mut self, governor: Arc<QuotaGovernor>) -> Self {
        self.governor = Some(governor);
        self
    }

    /// Build a governor from limits, schedule and store, using the builder's
    /// clock. Set the clock first.
    pub fn quota(
        mut self,
        limits: QuotaLimits,
        schedule: ResetSchedule,
        store: Arc<dyn QuotaStore>,
    ) -> Self {
        self.governor = Some(Arc::new(QuotaGovernor::new(
            limits,
            schedule,
            store,
            Arc::clone(&self.clock),
        )));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn preload(mut self, preload: PreloadConfig) -> Self {
        self.preload = preload;
        self
    }

    /// Apply a full configuration.
    ///
    /// The local tier opens at `<root_dir>/<namespace>` so several cache
    /// instances can share one root. Quota state is persisted in the local
    /// tier's LMDB environment. If the local tier cannot be opened the cache
    /// runs without it and quota state is kept in memory.
    pub async fn configure(mut self, config: &ReverieConfig, namespace: &str) -> ReverieResult<Self> {
        config.validate()?;

        self.memory_bytes = config.memory.max_bytes;
        self.preload = config.preload.clone();

        let mut local_config = config.local.clone();
        local_config.root_dir = local_config.root_dir.join(namespace);

        let mut quota_store: Arc<dyn QuotaStore> = Arc::new(InMemoryQuotaStore::new());
        match LocalTier::open(local_config, Arc::clone(&self.clock)).await {
            Ok(local) => {
                match LmdbQuotaStore::with_env(local.index().env().clone()) {
                    Ok(store) => quota_store = Arc::new(store),
                    Err(e) => {
                        tracing::error!(error = %e, "Quota state will not survive restart");
                    }
                }
                self.local = Some(local);
            }
            Err(e) => {
                tracing::warn!(
                    namespace,
                    error = %e,
                    "Local tier unavailable, continuing with memory and remote only"
                );
            }
        }

        self.remote = match (config.remote.enabled, &config.remote.base_url) {
            (true, Some(url)) => RemoteTier::new(
                Arc::new(HttpRemoteStore::new(url.clone())),
                config.remote.timeout(),
            ),
            _ => RemoteTier::disabled(),
        };

        self.governor = Some(Arc::new(QuotaGovernor::new(
            config.quota.limits.clone(),
            config.quota.reset.clone(),
            quota_store,
            Arc::clone(&self.clock),
        )));
        Ok(self)
    }

    pub fn build(self) -> TieredCache<G, K> {
        let clock = self.clock;
        let governor = self.governor.unwrap_or_else(|| {
            Arc::new(QuotaGovernor::new(
                QuotaLimits::default(),
                ResetSchedule::default(),
                Arc::new(InMemoryQuotaStore::new()),
                Arc::clone(&clock),
            ))
        });

        tracing::info!(
            generator = self.generator.name(),
            memory_bytes = self.memory_bytes,
            local = self.local.is_some(),
            remote = self.remote.is_enabled(),
            quota_tier = %governor.limits().tier_name,
            "Tiered cache ready"
        );

        TieredCache {
            inner: Arc::new(CacheInner {
                generator: self.generator,
                deriver: self.deriver,
                memory: MemoryTier::new(self.memory_bytes),
                local: self.local,
                remote: self.remote,
                governor,
                coalescer: Arc::new(RequestCoalescer::new()),
                clock,
                preload: self.preload,
                cancel_epoch: AtomicU64::new(0),
                generated: AtomicU64::new(0),
                generation_failures: AtomicU64::new(0),
            }),
        }
    }
}
