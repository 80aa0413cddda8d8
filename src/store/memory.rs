//! In-process state store with per-key locks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use super::{LocalStore, StateStore};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::ratelimit::BucketState;

type LockTable = DashMap<String, Arc<Mutex<()>>>;

/// Minimum store-clock time between two purges of expired entries.
const PURGE_INTERVAL_SECS: f64 = 60.0;

struct Entry {
    state: BucketState,
    expires_at: f64,
}

/// Thread-safe in-memory store.
///
/// Expiry is passive: an expired entry is dropped the next time it is read,
/// and writes purge every expired entry at most once per
/// [`PURGE_INTERVAL_SECS`] so keys that are never read again are reclaimed.
/// The lock table only holds keys that are currently locked or awaited.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    locks: Arc<LockTable>,
    clock: Arc<dyn Clock>,
    next_purge: SyncMutex<f64>,
}

impl MemoryStore {
    /// Create a store that expires entries by wall-clock time.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store that expires entries by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            locks: Arc::new(DashMap::new()),
            clock,
            next_purge: SyncMutex::new(f64::NEG_INFINITY),
        }
    }

    /// Number of stored entries, including expired ones not yet read.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of keys with a live lock.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop expired entries if the purge interval has passed. Concurrent
    /// writers skip the purge instead of waiting for it.
    fn purge_expired(&self, now: f64) {
        let Some(mut next_purge) = self.next_purge.try_lock() else {
            return;
        };
        if now < *next_purge {
            return;
        }
        *next_purge = now + PURGE_INTERVAL_SECS;

        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            trace!(purged, remaining = self.entries.len(), "Purged expired entries");
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.len())
            .field("locks", &self.locks.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<BucketState>, StoreError> {
        let now = self.clock.now();

        // Copy out before removing: holding a shard ref while removing deadlocks.
        let found = self
            .entries
            .get(key)
            .map(|entry| (entry.state, entry.expires_at));

        match found {
            Some((state, expires_at)) if now < expires_at => Ok(Some(state)),
            Some(_) => {
                trace!(key = %key, "Dropping expired entry");
                self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, state: BucketState, ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.purge_expired(now);

        let expires_at = now + ttl.as_secs_f64();
        self.entries.insert(key.to_string(), Entry { state, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    type Guard = KeyGuard;

    async fn acquire(&self, key: &str) -> KeyGuard {
        let lock = Arc::clone(&*self.locks.entry(key.to_string()).or_default());
        let guard = lock.lock_owned().await;

        KeyGuard {
            key: key.to_string(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }
}

/// Exclusive hold on one key of a [`MemoryStore`].
///
/// Dropping the guard releases the key and removes its lock from the table
/// when nobody else is waiting for it.
pub struct KeyGuard {
    key: String,
    locks: Arc<LockTable>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Waiters hold a clone of the Arc, so a count of one means only the table refers to it.
        self.locks.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}
