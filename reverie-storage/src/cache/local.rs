//! Persistent on-device tier: blob files plus an LMDB index.
//!
//! # Write ordering
//!
//! A blob is written to a unique temp file, synced and renamed into place
//! before its index entry is committed. The index stores the blob's size and
//! SHA-256, so a blob that was truncated, altered or replaced out from under
//! its entry fails verification on read and is purged instead of served.
//!
//! # Concurrency
//!
//! Reads take no lock until they need to mutate the index. All mutations are
//! serialized by one async mutex; LMDB transactions never span an await.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use reverie_core::{
    compute_content_hash, ArtifactRecord, CacheKey, Clock, LocalTierConfig, SourceMetadata,
    TierError, TierKind,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::local_index::LocalIndex;
use super::traits::{TierCounters, TierStats};

const BLOB_EXT: &str = "bin";
const TEMP_PREFIX: &str = ".tmp-";

/// What a sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: u64,
    pub evicted: u64,
    pub bytes_freed: u64,
}

/// What reconciliation cleaned up at open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub temp_files_removed: u64,
    pub orphan_blobs_removed: u64,
    pub dangling_entries_purged: u64,
}

pub struct LocalTier {
    config: LocalTierConfig,
    blobs_dir: PathBuf,
    index: LocalIndex,
    usage: AtomicU64,
    entries: AtomicU64,
    write_lock: Mutex<()>,
    counters: TierCounters,
    clock: Arc<dyn Clock>,
}

impl LocalTier {
    /// Open the tier rooted at `config.root_dir`, reconciling blobs against
    /// the index before returning.
    pub async fn open(config: LocalTierConfig, clock: Arc<dyn Clock>) -> Result<Self, TierError> {
        let blobs_dir = config.root_dir.join("blobs");
        std::fs::create_dir_all(&blobs_dir).map_err(|e| TierError::io(TierKind::Local, e))?;
        let index = LocalIndex::open(config.root_dir.join("index"), config.index_map_size)?;

        let tier = Self {
            config,
            blobs_dir,
            index,
            usage: AtomicU64::new(0),
            entries: AtomicU64::new(0),
            write_lock: Mutex::new(()),
            counters: TierCounters::default(),
            clock,
        };

        let report = tier.reconcile().await?;
        tracing::info!(
            root = %tier.config.root_dir.display(),
            entries = tier.entries.load(Ordering::Relaxed),
            bytes = tier.usage.load(Ordering::Relaxed),
            temp_files_removed = report.temp_files_removed,
            orphan_blobs_removed = report.orphan_blobs_removed,
            dangling_entries_purged = report.dangling_entries_purged,
            "Local tier opened"
        );
        Ok(tier)
    }

    /// Index environment, shared with the quota store.
    pub fn index(&self) -> &LocalIndex {
        &self.index
    }

    pub fn blob_path(&self, key: &CacheKey) -> PathBuf {
        self.blobs_dir.join(format!("{}.{}", key, BLOB_EXT))
    }

    // ========================================================================
    // READ PATH
    // ========================================================================

    /// Look up `key`. Returns the verified blob bytes and the updated record.
    ///
    /// A missing, truncated or altered blob is purged and reported as a miss.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<(Vec<u8>, ArtifactRecord)>, TierError> {
        let Some(record) = self.index.get(key)? else {
            self.counters.miss();
            return Ok(None);
        };

        let path = self.blob_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.purge_corrupt(&record, "blob file missing").await?;
                return Ok(None);
            }
            Err(e) => {
                self.counters.miss();
                return Err(TierError::io(TierKind::Local, e));
            }
        };

        if bytes.len() as u64 != record.byte_size {
            let reason = format!("expected {} bytes, found {}", record.byte_size, bytes.len());
            self.purge_corrupt(&record, &reason).await?;
            return Ok(None);
        }
        if compute_content_hash(&bytes) != record.source.content_hash {
            self.purge_corrupt(&record, "content hash mismatch").await?;
            return Ok(None);
        }

        let record = self.touch(record).await?;
        self.counters.hit();
        tracing::debug!(key = %key, tier = "local", bytes = bytes.len(), "Cache hit");
        Ok(Some((bytes, record)))
    }

    async fn touch(&self, record: ArtifactRecord) -> Result<ArtifactRecord, TierError> {
        let _guard = self.write_lock.lock().await;
        // a concurrent put may have replaced the entry since it was read
        let mut current = match self.index.get(&record.key)? {
            Some(current) if current.source.content_hash == record.source.content_hash => current,
            _ => return Ok(record),
        };
        current.touch(self.clock.now());
        self.index.put(&current)?;
        Ok(current)
    }

    async fn purge_corrupt(&self, record: &ArtifactRecord, reason: &str) -> Result<(), TierError> {
        self.counters.miss();
        let _guard = self.write_lock.lock().await;
        match self.index.get(&record.key)? {
            Some(current) if current.source.content_hash == record.source.content_hash => {}
            // replaced by a newer write; leave it alone
            _ => return Ok(()),
        }

        let err = TierError::CorruptEntry {
            tier: TierKind::Local,
            key: record.key.clone(),
            reason: reason.to_string(),
        };
        tracing::warn!(key = %record.key, error = %err, "Purging corrupt local entry");

        self.remove_locked(&record.key).await?;
        self.counters.corrupt();
        Ok(())
    }

    // ========================================================================
    // WRITE PATH
    // ========================================================================

    /// Store `bytes` under `key`, replacing any previous entry.
    ///
    /// Returns once both the blob and the index entry are durable. If the
    /// write pushes usage over budget, least recently accessed entries are
    /// evicted down to the target fraction; the entry just written is never
    /// chosen.
    pub async fn put(
        &self,
        key: &CacheKey,
        bytes: &[u8],
        source: SourceMetadata,
    ) -> Result<ArtifactRecord, TierError> {
        let size = bytes.len() as u64;
        if size > self.config.max_bytes {
            return Err(TierError::TooLarge {
                tier: TierKind::Local,
                size,
                budget: self.config.max_bytes,
            });
        }

        let _guard = self.write_lock.lock().await;

        let final_path = self.blob_path(key);
        self.write_blob(&final_path, bytes).await?;

        let mut source = source;
        source.content_hash = compute_content_hash(bytes);
        let record = ArtifactRecord::new(
            key.clone(),
            TierKind::Local,
            final_path.to_string_lossy(),
            size,
            source,
            self.clock.now(),
        );

        let previous = match self.index.put(&record) {
            Ok(previous) => previous,
            Err(e) => {
                // the blob is unreferenced now; reconcile would catch it too
                let _ = tokio::fs::remove_file(&final_path).await;
                return Err(e.into());
            }
        };
        match previous {
            Some(old) => {
                self.usage.fetch_sub(old.byte_size, Ordering::Relaxed);
            }
            None => {
                self.entries.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.usage.fetch_add(size, Ordering::Relaxed);

        if self.usage.load(Ordering::Relaxed) > self.config.max_bytes {
            let report = self.evict_to_target(Some(key)).await?;
            tracing::info!(
                evicted = report.evicted,
                bytes_freed = report.bytes_freed,
                "Local tier over budget, evicted least recently accessed entries"
            );
        }

        tracing::debug!(key = %key, tier = "local", bytes = size, "Stored artifact");
        Ok(record)
    }

    async fn write_blob(&self, final_path: &Path, bytes: &[u8]) -> Result<(), TierError> {
        let temp_path = self
            .blobs_dir
            .join(format!("{}{}", TEMP_PREFIX, uuid::Uuid::now_v7()));

        let result = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&temp_path, final_path).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(TierError::io(TierKind::Local, e));
        }
        Ok(())
    }

    pub async fn remove(&self, key: &CacheKey) -> Result<bool, TierError> {
        let _guard = self.write_lock.lock().await;
        self.remove_locked(key).await
    }

    /// Caller must hold `write_lock`.
    async fn remove_locked(&self, key: &CacheKey) -> Result<bool, TierError> {
        let removed = self.index.delete(key)?;
        match tokio::fs::remove_file(self.blob_path(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to delete local blob");
            }
        }
        match removed {
            Some(old) => {
                self.usage.fetch_sub(old.byte_size, Ordering::Relaxed);
                self.entries.fetch_sub(1, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove every entry and blob. Returns the number of entries removed.
    pub async fn clear(&self) -> Result<u64, TierError> {
        let _guard = self.write_lock.lock().await;
        let removed = self.index.clear()?;
        let mut dir = tokio::fs::read_dir(&self.blobs_dir)
            .await
            .map_err(|e| TierError::io(TierKind::Local, e))?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| TierError::io(TierKind::Local, e))?
        {
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                tracing::warn!(path = %entry.path().display(), error = %e, "Failed to delete blob");
            }
        }
        self.usage.store(0, Ordering::Relaxed);
        self.entries.store(0, Ordering::Relaxed);
        tracing::info!(removed, "Local tier cleared");
        Ok(removed)
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// Age sweep followed by a size sweep.
    pub async fn sweep(&self) -> Result<SweepReport, TierError> {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();
        let max_age = chrono::Duration::from_std(self.config.max_age())
            .unwrap_or(chrono::Duration::MAX);

        let (records, _) = self.index.scan()?;
        let mut report = SweepReport::default();
        for record in records.iter().filter(|r| r.age(now) > max_age) {
            if self.remove_locked(&record.key).await? {
                report.expired += 1;
                report.bytes_freed += record.byte_size;
            }
        }

        if self.usage.load(Ordering::Relaxed) > self.config.max_bytes {
            let sized = self.evict_to_target(None).await?;
            report.evicted = sized.evicted;
            report.bytes_freed += sized.bytes_freed;
        }

        self.counters.evicted(report.expired);
        if report.expired + report.evicted > 0 {
            tracing::info!(
                expired = report.expired,
                evicted = report.evicted,
                bytes_freed = report.bytes_freed,
                "Local tier sweep complete"
            );
        }
        Ok(report)
    }

    /// Evict least recently accessed entries until usage is at or below the
    /// target. Caller must hold `write_lock`.
    async fn evict_to_target(&self, keep: Option<&CacheKey>) -> Result<SweepReport, TierError> {
        let target = self.config.target_bytes();
        let (mut records, _) = self.index.scan()?;
        records.sort_by_key(|r| r.last_accessed_at);

        let mut report = SweepReport::default();
        for record in records {
            if self.usage.load(Ordering::Relaxed) <= target {
                break;
            }
            if Some(&record.key) == keep {
                continue;
            }
            if self.remove_locked(&record.key).await? {
                report.evicted += 1;
                report.bytes_freed += record.byte_size;
            }
        }
        self.counters.evicted(report.evicted);
        Ok(report)
    }

    /// Bring blobs and index back into agreement: delete temp files and blobs
    /// no entry references, purge entries whose blob is gone, and recompute
    /// usage from what remains.
    pub async fn reconcile(&self) -> Result<ReconcileReport, TierError> {
        let _guard = self.write_lock.lock().await;
        let mut report = ReconcileReport::default();

        let (records, broken) = self.index.scan()?;
        if !broken.is_empty() {
            report.dangling_entries_purged += self.index.delete_raw(&broken)?;
        }

        let mut on_disk = HashSet::new();
        let mut dir = tokio::fs::read_dir(&self.blobs_dir)
            .await
            .map_err(|e| TierError::io(TierKind::Local, e))?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| TierError::io(TierKind::Local, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TEMP_PREFIX) {
                if tokio::fs::remove_file(entry.path()).await.is_ok() {
                    report.temp_files_removed += 1;
                }
                continue;
            }
            on_disk.insert(name);
        }

        let mut referenced = HashSet::new();
        let mut usage = 0u64;
        let mut entries = 0u64;
        for record in records {
            let name = format!("{}.{}", record.key, BLOB_EXT);
            if on_disk.contains(&name) {
                usage += record.byte_size;
                entries += 1;
                referenced.insert(name);
            } else {
                self.index.delete(&record.key)?;
                report.dangling_entries_purged += 1;
            }
        }

        for name in on_disk.difference(&referenced) {
            if tokio::fs::remove_file(self.blobs_dir.join(name)).await.is_ok() {
                report.orphan_blobs_removed += 1;
            }
        }

        self.usage.store(usage, Ordering::Relaxed);
        self.entries.store(entries, Ordering::Relaxed);
        Ok(report)
    }

    // ========================================================================
    // OBSERVABILITY
    // ========================================================================

    pub fn bytes_used(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &LocalTierConfig {
        &self.config
    }

    pub fn stats(&self) -> TierStats {
        let mut stats = TierStats::empty(TierKind::Local);
        stats.entry_count = self.len();
        stats.bytes_used = self.bytes_used();
        stats.byte_budget = self.config.max_bytes;
        self.counters.fill(&mut stats);
        stats
    }
}

impl std::fmt::Debug for LocalTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTier")
            .field("root_dir", &self.config.root_dir)
            .field("bytes_used", &self.bytes_used())
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverie_core::{ManualClock, SystemClock};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;

    fn key(n: u8) -> CacheKey {
        CacheKey::from_hex(&format!("{:032x}", n)).expect("valid key")
    }

    fn source() -> SourceMetadata {
        SourceMetadata {
            generator: "test".to_string(),
            namespace: "speech".to_string(),
            parameters: BTreeMap::new(),
            content_type: "audio/mpeg".to_string(),
            content_hash: String::new(),
        }
    }

    fn config(dir: &TempDir, max_bytes: u64) -> LocalTierConfig {
        let mut config = LocalTierConfig::new(dir.path());
        config.max_bytes = max_bytes;
        config.index_map_size = 10 * 1024 * 1024;
        config
    }

    async fn create_test_tier(max_bytes: u64) -> (LocalTier, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let tier = LocalTier::open(config(&temp_dir, max_bytes), Arc::new(SystemClock))
            .await
            .expect("open should succeed");
        (tier, temp_dir)
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (tier, _dir) = create_test_tier(1024).await;
        let record = tier.put(&key(1), b"hello", source()).await.expect("put should succeed");
        assert_eq!(record.byte_size, 5);
        assert_eq!(record.source.content_hash, compute_content_hash(b"hello"));

        let (bytes, record) = tier.get(&key(1)).await.unwrap().expect("should hit");
        assert_eq!(bytes, b"hello");
        assert_eq!(record.access_count, 1);
        assert_eq!(tier.bytes_used(), 5);
        assert!(tier.get(&key(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_reaccounts_usage() {
        let (tier, _dir) = create_test_tier(1024).await;
        tier.put(&key(1), &[1u8; 100], source()).await.unwrap();
        tier.put(&key(1), &[2u8; 30], source()).await.unwrap();
        assert_eq!(tier.bytes_used(), 30);
        assert_eq!(tier.len(), 1);
        let (bytes, _) = tier.get(&key(1)).await.unwrap().unwrap();
        assert_eq!(bytes, vec![2u8; 30]);
    }

    #[tokio::test]
    async fn test_missing_blob_is_purged() {
        let (tier, _dir) = create_test_tier(1024).await;
        tier.put(&key(1), b"data", source()).await.unwrap();
        std::fs::remove_file(tier.blob_path(&key(1))).unwrap();

        assert!(tier.get(&key(1)).await.unwrap().is_none());
        assert!(tier.index().get(&key(1)).unwrap().is_none());
        assert_eq!(tier.bytes_used(), 0);
        assert_eq!(tier.stats().corrupt_purged, 1);
    }

    #[tokio::test]
    async fn test_truncated_blob_is_never_served() {
        let (tier, _dir) = create_test_tier(1024).await;
        tier.put(&key(1), &[9u8; 64], source()).await.unwrap();
        std::fs::write(tier.blob_path(&key(1)), [9u8; 20]).unwrap();
        assert!(tier.get(&key(1)).await.unwrap().is_none());

        tier.put(&key(2), &[9u8; 64], source()).await.unwrap();
        std::fs::write(tier.blob_path(&key(2)), [8u8; 64]).unwrap();
        assert!(tier.get(&key(2)).await.unwrap().is_none());
        assert_eq!(tier.len(), 0);
    }

    #[tokio::test]
    async fn test_oversize_rejected() {
        let (tier, _dir) = create_test_tier(16).await;
        let err = tier.put(&key(1), &[0u8; 17], source()).await.unwrap_err();
        assert!(matches!(err, TierError::TooLarge { tier: TierKind::Local, .. }));
    }

    #[tokio::test]
    async fn test_size_eviction_stays_within_budget() {
        let (tier, _dir) = create_test_tier(100).await;
        for n in 0..10 {
            tier.put(&key(n), &[n; 30], source()).await.unwrap();
            assert!(tier.bytes_used() <= 100);
        }
        // the newest entry always survives its own write
        assert!(tier.get(&key(9)).await.unwrap().is_some());
        assert!(tier.bytes_used() <= 80);
        assert!(tier.stats().evictions > 0);
    }

    #[tokio::test]
    async fn test_size_eviction_prefers_least_recently_accessed() {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let tier = LocalTier::open(config(&temp_dir, 100), clock.clone())
            .await
            .unwrap();

        tier.put(&key(1), &[1u8; 30], source()).await.unwrap();
        clock.advance(Duration::from_secs(1));
        tier.put(&key(2), &[2u8; 30], source()).await.unwrap();
        clock.advance(Duration::from_secs(1));
        tier.put(&key(3), &[3u8; 30], source()).await.unwrap();
        clock.advance(Duration::from_secs(1));
        // key 1 becomes the most recently accessed
        assert!(tier.get(&key(1)).await.unwrap().is_some());
        clock.advance(Duration::from_secs(1));

        tier.put(&key(4), &[4u8; 30], source()).await.unwrap();
        assert!(tier.index().get(&key(1)).unwrap().is_some());
        assert!(tier.index().get(&key(2)).unwrap().is_none());
        assert!(tier.index().get(&key(4)).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_age_sweep() {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let mut cfg = config(&temp_dir, 1024);
        cfg.max_age_secs = 60;
        let tier = LocalTier::open(cfg, clock.clone()).await.unwrap();

        tier.put(&key(1), b"old", source()).await.unwrap();
        clock.advance(Duration::from_secs(45));
        tier.put(&key(2), b"new", source()).await.unwrap();
        clock.advance(Duration::from_secs(30));

        let report = tier.sweep().await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.bytes_freed, 3);
        assert!(tier.get(&key(1)).await.unwrap().is_none());
        assert!(tier.get(&key(2)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reconcile_removes_temp_and_orphans() {
        let temp_dir = TempDir::new().unwrap();
        let orphan;
        {
            let tier = LocalTier::open(config(&temp_dir, 1024), Arc::new(SystemClock))
                .await
                .unwrap();
            tier.put(&key(1), b"kept", source()).await.unwrap();
            orphan = tier.blob_path(&key(2));
            std::fs::write(&orphan, b"orphan").unwrap();
            std::fs::write(tier.blobs_dir.join(".tmp-crashed"), b"partial").unwrap();
        }

        let tier = LocalTier::open(config(&temp_dir, 1024), Arc::new(SystemClock))
            .await
            .unwrap();
        assert!(!orphan.exists());
        assert!(!temp_dir.path().join("blobs/.tmp-crashed").exists());
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.bytes_used(), 4);
        let (bytes, _) = tier.get(&key(1)).await.unwrap().unwrap();
        assert_eq!(bytes, b"kept");
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let (tier, _dir) = create_test_tier(1024).await;
        tier.put(&key(1), b"a", source()).await.unwrap();
        tier.put(&key(2), b"b", source()).await.unwrap();
        assert!(tier.remove(&key(1)).await.unwrap());
        assert!(!tier.remove(&key(1)).await.unwrap());
        assert!(!tier.blob_path(&key(1)).exists());
        assert_eq!(tier.clear().await.unwrap(), 1);
        assert_eq!(tier.bytes_used(), 0);
        assert!(tier.is_empty());
    }
}
