//! State stores for rate limiting backends.
//!
//! Two tiers are supported:
//! - [`LocalStore`]: a single-process store. Callers serialize their
//!   read-modify-write sequence on a key by holding the guard returned from
//!   [`LocalStore::acquire`]; dropping the guard releases the key.
//! - [`ScriptedStore`]: a shared store that runs an [`AtomicScript`] as one
//!   indivisible step on the server.
//!
//! Every write carries a TTL, so keys that stop receiving traffic are
//! reclaimed by the store without a background task. Store futures can be dropped at
//! any await point, which lets callers apply their own timeouts; stores never
//! retry internally.

mod memory;
mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::ratelimit::BucketState;

pub use self::memory::{KeyGuard, MemoryStore};
pub use self::redis_store::{RedisStore, RedisStoreConfig};

/// Minimal key-value contract shared by both tiers.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the state under `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<BucketState>, StoreError>;

    /// Write `state` under `key`, expiring it after `ttl`.
    async fn set(&self, key: &str, state: BucketState, ttl: Duration) -> Result<(), StoreError>;

    /// Remove any state under `key`.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Single-process tier: explicit per-key mutual exclusion.
#[async_trait]
pub trait LocalStore: StateStore {
    /// Exclusive hold on one key. Releasing is dropping it.
    type Guard: Send;

    /// Wait for exclusive access to `key`. Holding the guard of one key never
    /// blocks callers of another key.
    async fn acquire(&self, key: &str) -> Self::Guard;
}

/// Shared tier: server-side atomic read-modify-write.
#[async_trait]
pub trait ScriptedStore: StateStore {
    /// Run `script` against `key` with numeric `args`, as one step that no other
    /// caller's read or write of the same key can interleave with.
    async fn atomic_update(
        &self,
        key: &str,
        script: &AtomicScript,
        args: &[f64],
    ) -> Result<i64, StoreError>;
}

/// A named server-side script.
///
/// The script reads `KEYS[1]` and `ARGV[n]` and returns an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicScript {
    name: &'static str,
    source: &'static str,
}

impl AtomicScript {
    pub const fn new(name: &'static str, source: &'static str) -> Self {
        Self { name, source }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn source(&self) -> &'static str {
        self.source
    }
}

/// The store a policy's backend runs against.
#[derive(Debug, Clone)]
pub enum StoreHandle {
    Local(Arc<MemoryStore>),
    Shared(Arc<RedisStore>),
}

impl StoreHandle {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreHandle::Local(_) => "local",
            StoreHandle::Shared(_) => "shared",
        }
    }
}
