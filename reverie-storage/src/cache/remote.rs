//! Shared remote tier.
//!
//! Lookups and downloads are bounded by a timeout and every failure becomes a
//! miss. Writes run as detached tasks whose outcomes are collected rather
//! than discarded; [`RemoteTier::flush`] hands them back to callers that care.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use reverie_core::{compute_content_hash, CacheKey, SourceMetadata, TierError, TierKind};

use super::traits::{TierCounters, TierStats};

/// Metadata index row for one remote object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub key: CacheKey,
    pub url: String,
    pub byte_size: u64,
    pub source: SourceMetadata,
    pub uploaded_at: DateTime<Utc>,
}

/// Key-addressed object store plus metadata index.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Metadata lookup only; no bytes are transferred.
    async fn lookup(&self, key: &CacheKey) -> Result<Option<RemoteEntry>, TierError>;

    async fn download(&self, entry: &RemoteEntry) -> Result<Vec<u8>, TierError>;

    /// Upload the blob, then write its metadata. Returns the blob URL.
    async fn upload(
        &self,
        key: &CacheKey,
        bytes: Vec<u8>,
        source: &SourceMetadata,
    ) -> Result<String, TierError>;

    async fn delete(&self, key: &CacheKey) -> Result<(), TierError>;
}

/// Result of one best-effort remote write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteWriteOutcome {
    Written { key: CacheKey, url: String },
    Failed { key: CacheKey, error: TierError },
    /// Remote tier disabled.
    Skipped { key: CacheKey },
}

impl RemoteWriteOutcome {
    pub fn key(&self) -> &CacheKey {
        match self {
            Self::Written { key, .. } | Self::Failed { key, .. } | Self::Skipped { key } => key,
        }
    }

    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written { .. })
    }
}

/// Completed outcomes retained between flushes.
const MAX_RETAINED_OUTCOMES: usize = 256;

#[derive(Default)]
struct WriteTracker {
    tasks: JoinSet<RemoteWriteOutcome>,
    completed: VecDeque<RemoteWriteOutcome>,
}

impl WriteTracker {
    fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Ok(outcome) = joined {
                if self.completed.len() == MAX_RETAINED_OUTCOMES {
                    self.completed.pop_front();
                }
                self.completed.push_back(outcome);
            }
        }
    }
}

pub struct RemoteTier {
    store: Option<Arc<dyn RemoteStore>>,
    timeout: Duration,
    writes: Mutex<WriteTracker>,
    counters: TierCounters,
    writes_ok: AtomicU64,
    writes_failed: AtomicU64,
}

impl RemoteTier {
    pub fn new(store: Arc<dyn RemoteStore>, timeout: Duration) -> Self {
        Self {
            store: Some(store),
            timeout,
            writes: Mutex::new(WriteTracker::default()),
            counters: TierCounters::default(),
            writes_ok: AtomicU64::new(0),
            writes_failed: AtomicU64::new(0),
        }
    }

    /// Every lookup misses and every write is skipped.
    pub fn disabled() -> Self {
        Self {
            store: None,
            timeout: Duration::ZERO,
            writes: Mutex::new(WriteTracker::default()),
            counters: TierCounters::default(),
            writes_ok: AtomicU64::new(0),
            writes_failed: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Metadata lookup. Errors and timeouts are logged and reported as a miss.
    pub async fn get(&self, key: &CacheKey) -> Option<RemoteEntry> {
        let store = self.store.as_ref()?;
        match tokio::time::timeout(self.timeout, store.lookup(key)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                tracing::warn!(key = %key, error = %e, "Remote lookup failed, treating as miss");
                None
            }
            Err(_) => {
                tracing::warn!(key = %key, timeout_ms = self.timeout.as_millis() as u64, "Remote lookup timed out");
                None
            }
        }
    }

    /// Lookup plus download under one timeout. The downloaded bytes are
    /// checked against the recorded size and hash.
    pub async fn fetch(&self, key: &CacheKey) -> Option<(Vec<u8>, RemoteEntry)> {
        let Some(store) = self.store.as_ref() else {
            self.counters.miss();
            return None;
        };

        let attempt = async {
            let Some(entry) = store.lookup(key).await? else {
                return Ok(None);
            };
            let bytes = store.download(&entry).await?;
            Ok::<_, TierError>(Some((bytes, entry)))
        };

        let found = match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                tracing::warn!(key = %key, error = %e, "Remote fetch failed, treating as miss");
                None
            }
            Err(_) => {
                tracing::warn!(key = %key, timeout_ms = self.timeout.as_millis() as u64, "Remote fetch timed out");
                None
            }
        };

        match found {
            Some((bytes, entry)) if verify(&bytes, &entry) => {
                self.counters.hit();
                tracing::debug!(key = %key, tier = "remote", bytes = bytes.len(), "Cache hit");
                Some((bytes, entry))
            }
            Some((bytes, _)) => {
                self.counters.corrupt();
                self.counters.miss();
                tracing::warn!(
                    key = %key,
                    bytes = bytes.len(),
                    "Remote object failed verification, treating as miss"
                );
                None
            }
            None => {
                self.counters.miss();
                None
            }
        }
    }

    /// Upload and wait for the outcome.
    pub async fn put(
        &self,
        key: &CacheKey,
        bytes: Vec<u8>,
        source: &SourceMetadata,
    ) -> RemoteWriteOutcome {
        let Some(store) = self.store.clone() else {
            return RemoteWriteOutcome::Skipped { key: key.clone() };
        };
        let outcome = upload(store, key.clone(), bytes, source.clone()).await;
        self.record_outcome(&outcome);
        outcome
    }

    /// Upload in a detached task. Never blocks and never fails the caller.
    /// Must be called from within a Tokio runtime.
    pub fn put_detached(&self, key: CacheKey, bytes: Vec<u8>, source: SourceMetadata) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let mut writes = self.writes.lock().unwrap_or_else(|e| e.into_inner());
        writes.reap();
        writes.tasks.spawn(upload(store, key, bytes, source));
    }

    /// Wait for every outstanding detached write and return all outcomes
    /// collected since the previous flush.
    pub async fn flush(&self) -> Vec<RemoteWriteOutcome> {
        let (mut tasks, completed) = {
            let mut writes = self.writes.lock().unwrap_or_else(|e| e.into_inner());
            (
                std::mem::take(&mut writes.tasks),
                std::mem::take(&mut writes.completed),
            )
        };

        let mut outcomes: Vec<RemoteWriteOutcome> = completed.into_iter().collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::error!(error = %e, "Remote write task panicked"),
            }
        }
        for outcome in &outcomes {
            self.record_outcome(outcome);
        }
        outcomes
    }

    pub fn pending_writes(&self) -> usize {
        let writes = self.writes.lock().unwrap_or_else(|e| e.into_inner());
        writes.tasks.len()
    }

    /// Best-effort delete; failures are logged.
    pub async fn delete(&self, key: &CacheKey) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        match tokio::time::timeout(self.timeout, store.delete(key)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(key = %key, error = %e, "Remote delete failed");
                false
            }
            Err(_) => {
                tracing::warn!(key = %key, "Remote delete timed out");
                false
            }
        }
    }

    fn record_outcome(&self, outcome: &RemoteWriteOutcome) {
        match outcome {
            RemoteWriteOutcome::Written { .. } => {
                self.writes_ok.fetch_add(1, Ordering::Relaxed);
            }
            RemoteWriteOutcome::Failed { .. } => {
                self.writes_failed.fetch_add(1, Ordering::Relaxed);
            }
            RemoteWriteOutcome::Skipped { .. } => {}
        }
    }

    /// Writes settled so far as `(written, failed)`. Detached writes are
    /// counted when flushed.
    pub fn write_counts(&self) -> (u64, u64) {
        (
            self.writes_ok.load(Ordering::Relaxed),
            self.writes_failed.load(Ordering::Relaxed),
        )
    }

    pub fn stats(&self) -> TierStats {
        let mut stats = TierStats::empty(TierKind::Remote);
        self.counters.fill(&mut stats);
        stats
    }
}

fn verify(bytes: &[u8], entry: &RemoteEntry) -> bool {
    bytes.len() as u64 == entry.byte_size
        && (entry.source.content_hash.is_empty()
            || compute_content_hash(bytes) == entry.source.content_hash)
}

async fn upload(
    store: Arc<dyn RemoteStore>,
    key: CacheKey,
    bytes: Vec<u8>,
    source: SourceMetadata,
) -> RemoteWriteOutcome {
    match store.upload(&key, bytes, &source).await {
        Ok(url) => {
            tracing::debug!(key = %key, url = %url, "Remote write complete");
            RemoteWriteOutcome::Written { key, url }
        }
        Err(error) => {
            tracing::warn!(key = %key, error = %error, "Remote write failed");
            RemoteWriteOutcome::Failed { key, error }
        }
    }
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// Process-local [`RemoteStore`], used in tests and when no server is
/// configured but a shared tier is still wanted between cache instances.
#[derive(Default)]
pub struct InMemoryRemoteStore {
    objects: Mutex<HashMap<CacheKey, (RemoteEntry, Vec<u8>)>>,
    lookups: AtomicU64,
    uploads: AtomicU64,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    /// Overwrite stored bytes without touching metadata.
    pub fn tamper(&self, key: &CacheKey, bytes: Vec<u8>) {
        if let Some(object) = self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(key)
        {
            object.1 = bytes;
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn lookup(&self, key: &CacheKey) -> Result<Option<RemoteEntry>, TierError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        Ok(objects.get(key).map(|(entry, _)| entry.clone()))
    }

    async fn download(&self, entry: &RemoteEntry) -> Result<Vec<u8>, TierError> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects
            .get(&entry.key)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| TierError::unavailable(TierKind::Remote, format!("no object at {}", entry.url)))
    }

    async fn upload(
        &self,
        key: &CacheKey,
        bytes: Vec<u8>,
        source: &SourceMetadata,
    ) -> Result<String, TierError> {
        self.uploads.fetch_add(1, Ordering::Relaxed);
        let url = format!("memory://reverie/blobs/{}", key);
        let entry = RemoteEntry {
            key: key.clone(),
            url: url.clone(),
            byte_size: bytes.len() as u64,
            source: source.clone(),
            uploaded_at: Utc::now(),
        };
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), (entry, bytes));
        Ok(url)
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), TierError> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn key(n: u8) -> CacheKey {
        CacheKey::from_hex(&format!("{:032x}", n)).expect("valid key")
    }

    fn source_for(bytes: &[u8]) -> SourceMetadata {
        SourceMetadata {
            generator: "test".to_string(),
            namespace: "speech".to_string(),
            parameters: BTreeMap::new(),
            content_type: "audio/mpeg".to_string(),
            content_hash: compute_content_hash(bytes),
        }
    }

    /// Store whose every call fails or hangs.
    struct BrokenStore {
        hang: bool,
    }

    #[async_trait]
    impl RemoteStore for BrokenStore {
        async fn lookup(&self, _key: &CacheKey) -> Result<Option<RemoteEntry>, TierError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Err(TierError::unavailable(TierKind::Remote, "connection refused"))
        }

        async fn download(&self, _entry: &RemoteEntry) -> Result<Vec<u8>, TierError> {
            Err(TierError::unavailable(TierKind::Remote, "connection refused"))
        }

        async fn upload(
            &self,
            _key: &CacheKey,
            _bytes: Vec<u8>,
            _source: &SourceMetadata,
        ) -> Result<String, TierError> {
            Err(TierError::unavailable(TierKind::Remote, "connection refused"))
        }

        async fn delete(&self, _key: &CacheKey) -> Result<(), TierError> {
            Err(TierError::unavailable(TierKind::Remote, "connection refused"))
        }
    }

    #[tokio::test]
    async fn test_put_then_fetch() {
        let store = Arc::new(InMemoryRemoteStore::new());
        let tier = RemoteTier::new(store.clone(), Duration::from_secs(1));
        let outcome = tier.put(&key(1), b"audio".to_vec(), &source_for(b"audio")).await;
        assert!(outcome.is_written());

        let entry = tier.get(&key(1)).await.expect("metadata present");
        assert_eq!(entry.byte_size, 5);
        let (bytes, _) = tier.fetch(&key(1)).await.expect("should hit");
        assert_eq!(bytes, b"audio");
        assert!(tier.fetch(&key(2)).await.is_none());
        assert_eq!(tier.stats().hits, 1);
        assert_eq!(tier.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_detached_writes_are_flushed() {
        let store = Arc::new(InMemoryRemoteStore::new());
        let tier = RemoteTier::new(store.clone(), Duration::from_secs(1));
        for n in 0..3 {
            tier.put_detached(key(n), vec![n; 4], source_for(&[n; 4]));
        }
        let outcomes = tier.flush().await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(RemoteWriteOutcome::is_written));
        assert_eq!(store.len(), 3);
        assert_eq!(tier.pending_writes(), 0);
        assert_eq!(tier.write_counts(), (3, 0));
        assert!(tier.flush().await.is_empty());
    }

    #[tokio::test]
    async fn test_failures_become_misses_and_failed_outcomes() {
        let tier = RemoteTier::new(Arc::new(BrokenStore { hang: false }), Duration::from_secs(1));
        assert!(tier.get(&key(1)).await.is_none());
        assert!(tier.fetch(&key(1)).await.is_none());

        tier.put_detached(key(1), vec![1], source_for(&[1]));
        let outcomes = tier.flush().await;
        assert!(matches!(
            outcomes.as_slice(),
            [RemoteWriteOutcome::Failed { error: TierError::Unavailable { .. }, .. }]
        ));
        assert!(!tier.delete(&key(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_timeout_is_a_miss() {
        let tier = RemoteTier::new(Arc::new(BrokenStore { hang: true }), Duration::from_millis(50));
        assert!(tier.fetch(&key(1)).await.is_none());
        assert_eq!(tier.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_tampered_object_fails_verification() {
        let store = Arc::new(InMemoryRemoteStore::new());
        let tier = RemoteTier::new(store.clone(), Duration::from_secs(1));
        tier.put(&key(1), b"abcd".to_vec(), &source_for(b"abcd")).await;
        store.tamper(&key(1), b"abce".to_vec());
        assert!(tier.fetch(&key(1)).await.is_none());
        assert_eq!(tier.stats().corrupt_purged, 1);
    }

    #[tokio::test]
    async fn test_disabled_tier() {
        let tier = RemoteTier::disabled();
        assert!(!tier.is_enabled());
        assert!(tier.fetch(&key(1)).await.is_none());
        let outcome = tier.put(&key(1), vec![1], &source_for(&[1])).await;
        assert_eq!(outcome, RemoteWriteOutcome::Skipped { key: key(1) });
        tier.put_detached(key(1), vec![1], source_for(&[1]));
        assert!(tier.flush().await.is_empty());
    }
}
