//! Leaky bucket.
//!
//! Each request pours one unit of water into the bucket, which drains
//! continuously at `leak_rate` units per second. A request that finds the
//! bucket at or above `capacity` is denied. Levels are real numbers, so the
//! bucket smooths throughput instead of counting discrete requests.
//!
//! Denials persist the drained level with the current time. The level has
//! already been drained up to `now`, so this loses no accounting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::backend::{Decision, RateLimiterBackend};
use super::fixed_window::foreign_state;
use super::state::{BucketState, LeakyBucketState};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::{AtomicScript, LocalStore, MemoryStore, RedisStore, ScriptedStore};

/// Parameters of a leaky bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeakyBucketParams {
    /// Level at which requests start being denied.
    pub capacity: u64,
    /// Units drained per second.
    pub leak_rate: f64,
}

fn step(
    state: Option<LeakyBucketState>,
    now: f64,
    params: &LeakyBucketParams,
) -> (Decision, LeakyBucketState) {
    let Some(current) = state else {
        return (
            Decision::Allow,
            LeakyBucketState {
                level: 1.0,
                last_drain: now,
            },
        );
    };

    let elapsed = (now - current.last_drain).max(0.0);
    let level = (current.level - elapsed * params.leak_rate).max(0.0);

    if level >= params.capacity as f64 {
        return (
            Decision::Deny,
            LeakyBucketState {
                level,
                last_drain: now,
            },
        );
    }

    (
        Decision::Allow,
        LeakyBucketState {
            level: level + 1.0,
            last_drain: now,
        },
    )
}

/// In-process leaky bucket.
pub struct LocalLeakyBucket<S: LocalStore = MemoryStore> {
    store: Arc<S>,
    params: LeakyBucketParams,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl<S: LocalStore> LocalLeakyBucket<S> {
    pub fn new(
        store: Arc<S>,
        params: LeakyBucketParams,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            params,
            clock,
            ttl,
        }
    }
}

#[async_trait]
impl<S: LocalStore + 'static> RateLimiterBackend for LocalLeakyBucket<S> {
    async fn allow(&self, key: &str) -> Result<Decision, StoreError> {
        let _guard = self.store.acquire(key).await;
        let now = self.clock.now();

        let current = match self.store.get(key).await? {
            Some(BucketState::LeakyBucket(state)) => Some(state),
            Some(_) => return Err(foreign_state(key)),
            None => {
                debug!(key = %key, capacity = self.params.capacity, "Creating leaky bucket");
                None
            }
        };

        let (decision, next) = step(current, now, &self.params);
        self.store
            .set(key, BucketState::LeakyBucket(next), self.ttl)
            .await?;

        trace!(key = %key, level = next.level, %decision, "Leaky bucket checked");
        Ok(decision)
    }

    fn algorithm(&self) -> &'static str {
        "leaky-bucket"
    }
}

/// KEYS[1] = bucket key
/// ARGV[1] = leak_rate, ARGV[2] = capacity, ARGV[3] = now, ARGV[4] = ttl (seconds)
pub(crate) const LEAKY_BUCKET_SCRIPT: AtomicScript = AtomicScript::new(
    "leaky_bucket",
    r#"
local now = tonumber(ARGV[3])
local ttl_ms = math.ceil(tonumber(ARGV[4]) * 1000)

local data = redis.call("HMGET", KEYS[1], "level", "last_drain")
local level = tonumber(data[1])
local last_drain = tonumber(data[2])

if (not level or not last_drain) and redis.call("EXISTS", KEYS[1]) == 1 then
    return redis.error_reply("state belongs to another algorithm")
end

if not level or not last_drain then
    redis.call("HSET", KEYS[1], "level", 1, "last_drain", ARGV[3])
    redis.call("PEXPIRE", KEYS[1], ttl_ms)
    return 1
end

level = math.max(0, level - math.max(0, now - last_drain) * tonumber(ARGV[1]))

if level >= tonumber(ARGV[2]) then
    redis.call("HSET", KEYS[1], "level", tostring(level), "last_drain", ARGV[3])
    redis.call("PEXPIRE", KEYS[1], ttl_ms)
    return 0
end

redis.call("HSET", KEYS[1], "level", tostring(level + 1), "last_drain", ARGV[3])
redis.call("PEXPIRE", KEYS[1], ttl_ms)
return 1
"#,
);

/// Leaky bucket over a shared scripted store.
pub struct SharedLeakyBucket<S: ScriptedStore = RedisStore> {
    store: Arc<S>,
    params: LeakyBucketParams,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl<S: ScriptedStore> SharedLeakyBucket<S> {
    pub fn new(
        store: Arc<S>,
        params: LeakyBucketParams,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            params,
            clock,
            ttl,
        }
    }
}

#[async_trait]
impl<S: ScriptedStore + 'static> RateLimiterBackend for SharedLeakyBucket<S> {
    async fn allow(&self, key: &str) -> Result<Decision, StoreError> {
        let args = [
            self.params.leak_rate,
            self.params.capacity as f64,
            self.clock.now(),
            self.ttl.as_secs_f64(),
        ];
        let result = self
            .store
            .atomic_update(key, &LEAKY_BUCKET_SCRIPT, &args)
            .await?;

        let decision = Decision::from_allowed(result == 1);
        trace!(key = %key, %decision, "Shared leaky bucket checked");
        Ok(decision)
    }

    fn algorithm(&self) -> &'static str {
        "leaky-bucket"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::StateStore;

    fn bucket(capacity: u64, leak_rate: f64) -> (LocalLeakyBucket, ManualClock, Arc<MemoryStore>) {
        let clock = ManualClock::new(500.0);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let limiter = LocalLeakyBucket::new(
            Arc::clone(&store),
            LeakyBucketParams {
                capacity,
                leak_rate,
            },
            Arc::new(clock.clone()),
            Duration::from_secs(3600),
        );
        (limiter, clock, store)
    }

    #[tokio::test]
    async fn test_fills_to_capacity_then_denies() {
        let (limiter, _clock, _store) = bucket(3, 1.0);

        for _ in 0..3 {
            assert!(limiter.allow("k").await.unwrap().is_allowed());
        }
        assert!(!limiter.allow("k").await.unwrap().is_allowed());
        assert!(!limiter.allow("k").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_partial_drain_admits_one() {
        let (limiter, clock, store) = bucket(2, 0.5);

        limiter.allow("k").await.unwrap();
        limiter.allow("k").await.unwrap();
        assert!(!limiter.allow("k").await.unwrap().is_allowed());

        clock.advance(1.0);
        assert!(limiter.allow("k").await.unwrap().is_allowed());

        match store.get("k").await.unwrap() {
            Some(BucketState::LeakyBucket(state)) => {
                assert!((state.level - 2.5).abs() < 1e-9);
                assert_eq!(state.last_drain, 501.0);
            }
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_idle_for_capacity_over_rate_always_allows() {
        for (capacity, leak_rate) in [(1u64, 1.0), (5, 2.0), (10, 0.25), (3, 7.5)] {
            let (limiter, clock, _store) = bucket(capacity, leak_rate);

            for _ in 0..(capacity * 3) {
                limiter.allow("k").await.unwrap();
            }
            assert!(!limiter.allow("k").await.unwrap().is_allowed());

            clock.advance(capacity as f64 / leak_rate);
            assert!(limiter.allow("k").await.unwrap().is_allowed());
        }
    }

    #[tokio::test]
    async fn test_level_never_negative() {
        let (limiter, clock, store) = bucket(2, 10.0);

        limiter.allow("k").await.unwrap();
        clock.advance(1000.0);
        limiter.allow("k").await.unwrap();

        match store.get("k").await.unwrap() {
            Some(BucketState::LeakyBucket(state)) => assert_eq!(state.level, 1.0),
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_never_overfill() {
        let (limiter, _clock, _store) = bucket(6, 1.0);
        let limiter = Arc::new(limiter);

        let tasks: Vec<_> = (0..30)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.allow("hot").await.unwrap() })
            })
            .collect();

        let allowed = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|d| d.as_ref().map(|d| d.is_allowed()).unwrap_or(false))
            .count();
        assert_eq!(allowed, 6);
    }
}
