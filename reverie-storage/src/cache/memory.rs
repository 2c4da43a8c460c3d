//! In-process LRU tier bounded by bytes rather than entry count.

use lru::LruCache;
use std::sync::{Mutex, MutexGuard};

use reverie_core::{Artifact, CacheKey, TierError, TierKind};

use super::traits::{TierCounters, TierStats};

struct MemoryInner<A> {
    entries: LruCache<CacheKey, A>,
    bytes_used: u64,
}

/// Byte-budgeted LRU map from key to artifact.
///
/// `get` promotes the entry to most-recently-used. `put` evicts from the
/// least-recently-used end until the new artifact fits. Artifacts larger than
/// the whole budget are rejected with [`TierError::TooLarge`].
pub struct MemoryTier<A: Artifact> {
    inner: Mutex<MemoryInner<A>>,
    max_bytes: u64,
    counters: TierCounters,
}

impl<A: Artifact> MemoryTier<A> {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                entries: LruCache::unbounded(),
                bytes_used: 0,
            }),
            max_bytes,
            counters: TierCounters::default(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner<A>>, TierError> {
        self.inner.lock().map_err(|_| TierError::LockPoisoned {
            tier: TierKind::Memory,
        })
    }

    pub fn get(&self, key: &CacheKey) -> Option<A> {
        let found = self
            .lock()
            .ok()
            .and_then(|mut inner| inner.entries.get(key).cloned());
        match found {
            Some(artifact) => {
                self.counters.hit();
                tracing::debug!(key = %key, tier = "memory", "Cache hit");
                Some(artifact)
            }
            None => {
                self.counters.miss();
                None
            }
        }
    }

    /// Presence check that neither promotes nor counts as a lookup.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock()
            .map(|inner| inner.entries.contains(key))
            .unwrap_or(false)
    }

    /// Lookup that neither promotes nor counts toward hit statistics.
    pub fn peek(&self, key: &CacheKey) -> Option<A> {
        self.lock()
            .ok()
            .and_then(|inner| inner.entries.peek(key).cloned())
    }

    pub fn put(&self, key: CacheKey, artifact: A) -> Result<(), TierError> {
        let size = artifact.byte_size();
        if size > self.max_bytes {
            return Err(TierError::TooLarge {
                tier: TierKind::Memory,
                size,
                budget: self.max_bytes,
            });
        }

        let mut inner = self.lock()?;
        if let Some(previous) = inner.entries.pop(&key) {
            inner.bytes_used -= previous.byte_size();
        }

        let mut evicted = 0u64;
        while inner.bytes_used + size > self.max_bytes {
            match inner.entries.pop_lru() {
                Some((_, old)) => {
                    inner.bytes_used -= old.byte_size();
                    evicted += 1;
                }
                None => break,
            }
        }

        inner.entries.put(key, artifact);
        inner.bytes_used += size;
        drop(inner);

        if evicted > 0 {
            self.counters.evicted(evicted);
            tracing::debug!(evicted, tier = "memory", "Evicted least recently used entries");
        }
        Ok(())
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        let Ok(mut inner) = self.lock() else {
            return false;
        };
        match inner.entries.pop(key) {
            Some(old) => {
                inner.bytes_used -= old.byte_size();
                true
            }
            None => false,
        }
    }

    /// Drop every entry. Returns how many were removed.
    pub fn clear(&self) -> u64 {
        let Ok(mut inner) = self.lock() else {
            return 0;
        };
        let removed = inner.entries.len() as u64;
        inner.entries.clear();
        inner.bytes_used = 0;
        removed
    }

    pub fn bytes_used(&self) -> u64 {
        self.lock().map(|inner| inner.bytes_used).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn stats(&self) -> TierStats {
        let mut stats = TierStats::empty(TierKind::Memory);
        if let Ok(inner) = self.lock() {
            stats.entry_count = inner.entries.len() as u64;
            stats.bytes_used = inner.bytes_used;
        }
        stats.byte_budget = self.max_bytes;
        self.counters.fill(&mut stats);
        stats
    }
}
