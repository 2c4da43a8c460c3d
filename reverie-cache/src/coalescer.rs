//! Request coalescing for cache misses.
//!
//! The first caller for a key becomes the leader: its generation future is
//! spawned as a detached task, so callers that give up waiting never cancel a
//! generation other subscribers still need. Later callers for the same key
//! subscribe to the leader's result. The pending entry is removed before the
//! result is published, so a call arriving after completion starts fresh.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use reverie_core::{CacheKey, GenerationError, ReverieError, ReverieResult};
use tokio::sync::watch;

type Slot<T> = Option<ReverieResult<T>>;

struct Pending<T> {
    rx: watch::Receiver<Slot<T>>,
    waiters: usize,
    /// Distinguishes this attempt from a later one for the same key after
    /// `cancel_all` dropped the registry.
    epoch: u64,
}

/// How a caller's result was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalesceRole {
    /// Started the generation.
    Leader,
    /// Subscribed to an in-flight generation.
    Follower,
}

pub struct RequestCoalescer<T> {
    pending: Mutex<HashMap<CacheKey, Pending<T>>>,
    next_epoch: AtomicU64,
    started: AtomicU64,
    joined: AtomicU64,
}

impl<T> Default for RequestCoalescer<T> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_epoch: AtomicU64::new(0),
            started: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }
}

impl<T> RequestCoalescer<T> {
    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Pending<T>>> {
        // the map is only ever inserted into or removed from under the lock
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn complete(&self, key: &CacheKey, epoch: u64) {
        let mut pending = self.lock();
        if pending.get(key).is_some_and(|entry| entry.epoch == epoch) {
            pending.remove(key);
        }
    }

    fn unsubscribe(&self, key: &CacheKey, epoch: u64) {
        let mut pending = self.lock();
        if let Some(entry) = pending.get_mut(key).filter(|entry| entry.epoch == epoch) {
            entry.waiters = entry.waiters.saturating_sub(1);
        }
    }
}

impl<T: Clone + Send + Sync + 'static> RequestCoalescer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `generate` for `key` unless a generation for it is already in
    /// flight, in which case wait for that one instead. `generate` is only
    /// invoked by the leader. Must be called from within a Tokio runtime.
    pub async fn run<F, Fut>(self: &Arc<Self>, key: CacheKey, generate: F) -> (ReverieResult<T>, CoalesceRole)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ReverieResult<T>> + Send + 'static,
    {
        let (rx, role, epoch) = {
            let mut pending = self.lock();
            match pending.get_mut(&key) {
                Some(entry) => {
                    entry.waiters += 1;
                    (entry.rx.clone(), CoalesceRole::Follower, entry.epoch)
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
                    pending.insert(
                        key.clone(),
                        Pending {
                            rx: rx.clone(),
                            waiters: 1,
                            epoch,
                        },
                    );
                    drop(pending);

                    let future = generate();
                    let completion = Completion {
                        coalescer: Arc::clone(self),
                        key: key.clone(),
                        epoch,
                    };
                    tokio::spawn(async move {
                        // dropped on unwind too, so a panicking generator
                        // never leaves the key pending
                        let completion = completion;
                        let result = future.await;
                        drop(completion);
                        let _ = tx.send(Some(result));
                    });
                    (rx, CoalesceRole::Leader, epoch)
                }
            }
        };

        match role {
            CoalesceRole::Leader => self.started.fetch_add(1, Ordering::Relaxed),
            CoalesceRole::Follower => {
                tracing::debug!(key = %key, "Joined in-flight generation");
                self.joined.fetch_add(1, Ordering::Relaxed)
            }
        };

        let subscription = Subscription {
            coalescer: self.as_ref(),
            key: &key,
            epoch,
        };
        let published = wait_for_result(rx).await;
        drop(subscription);

        let result = match published {
            Some(result) => result,
            None => {
                self.complete(&key, epoch);
                Err(aborted(&key))
            }
        };
        (result, role)
    }

    /// Forget every pending entry. In-flight generations keep running and
    /// their current subscribers still receive results; new callers start
    /// fresh attempts. Returns how many entries were dropped.
    pub fn cancel_all(&self) -> usize {
        let mut pending = self.lock();
        let dropped = pending.len();
        pending.clear();
        dropped
    }

    /// Keys with a generation in flight.
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Callers currently waiting across all pending keys. Callers that
    /// dropped their future are not counted.
    pub fn waiter_count(&self) -> usize {
        self.lock().values().map(|entry| entry.waiters).sum()
    }

    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.lock().contains_key(key)
    }

    /// `(generations started, callers that joined an existing one)`.
    pub fn counts(&self) -> (u64, u64) {
        (
            self.started.load(Ordering::Relaxed),
            self.joined.load(Ordering::Relaxed),
        )
    }
}

/// Owned by the leader task; clears the pending entry however the task ends.
struct Completion<T> {
    coalescer: Arc<RequestCoalescer<T>>,
    key: CacheKey,
    epoch: u64,
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        self.coalescer.complete(&self.key, self.epoch);
    }
}

/// One waiting caller. Dropping the caller's future releases the count.
struct Subscription<'a, T> {
    coalescer: &'a RequestCoalescer<T>,
    key: &'a CacheKey,
    epoch: u64,
}

impl<T> Drop for Subscription<'_, T> {
    fn drop(&mut self) {
        self.coalescer.unsubscribe(self.key, self.epoch);
    }
}

/// `None` when the leader task ended without publishing.
async fn wait_for_result<T: Clone>(mut rx: watch::Receiver<Slot<T>>) -> Option<ReverieResult<T>> {
    match rx.wait_for(Option::is_some).await {
        Ok(slot) => slot.as_ref().cloned(),
        Err(_) => None,
    }
}

fn aborted(key: &CacheKey) -> ReverieError {
    tracing::error!(key = %key, "Generation task ended without a result");
    GenerationError::Provider {
        provider: "reverie".to_string(),
        message: format!("generation task for {} aborted", key),
    }
    .into()
}

impl<T> std::fmt::Debug for RequestCoalescer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.pending.lock().map(|p| p.len()).unwrap_or(0);
        f.debug_struct("RequestCoalescer")
            .field("pending", &pending)
            .finish()
    }
}
