//! Token bucket.
//!
//! A bucket holds up to `bucket_size` whole tokens and gains `refill_rate`
//! tokens per second, rounded down at each check. Each allowed request takes
//! one token.
//!
//! A denied request leaves the stored state untouched, so the refill time it
//! has accumulated is not discarded by the floor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::backend::{Decision, RateLimiterBackend};
use super::fixed_window::foreign_state;
use super::state::{BucketState, TokenBucketState};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::{AtomicScript, LocalStore, MemoryStore, RedisStore, ScriptedStore};

/// Parameters of a token bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketParams {
    /// Maximum number of tokens.
    pub bucket_size: u64,
    /// Tokens added per second.
    pub refill_rate: f64,
}

/// Apply one request to the bucket. Returns the state to persist, if any.
fn step(
    state: Option<TokenBucketState>,
    now: f64,
    params: &TokenBucketParams,
) -> (Decision, Option<TokenBucketState>) {
    let Some(current) = state else {
        let first = TokenBucketState {
            tokens: params.bucket_size.saturating_sub(1),
            last_refill: now,
        };
        return (Decision::Allow, Some(first));
    };

    let elapsed = (now - current.last_refill).max(0.0);
    let refill = (elapsed * params.refill_rate).floor() as u64;
    let tokens = current.tokens.saturating_add(refill).min(params.bucket_size);

    if tokens == 0 {
        return (Decision::Deny, None);
    }

    let next = TokenBucketState {
        tokens: tokens - 1,
        last_refill: now,
    };
    (Decision::Allow, Some(next))
}

/// In-process token bucket.
pub struct LocalTokenBucket<S: LocalStore = MemoryStore> {
    store: Arc<S>,
    params: TokenBucketParams,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl<S: LocalStore> LocalTokenBucket<S> {
    /// `ttl` is how long an idle bucket is kept before it resets to full.
    pub fn new(
        store: Arc<S>,
        params: TokenBucketParams,
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
impl<S: LocalStore + 'static> RateLimiterBackend for LocalTokenBucket<S> {
    async fn allow(&self, key: &str) -> Result<Decision, StoreError> {
        let _guard = self.store.acquire(key).await;
        let now = self.clock.now();

        let current = match self.store.get(key).await? {
            Some(BucketState::TokenBucket(state)) => Some(state),
            Some(_) => return Err(foreign_state(key)),
            None => {
                debug!(key = %key, bucket_size = self.params.bucket_size, "Creating token bucket");
                None
            }
        };

        let (decision, next) = step(current, now, &self.params);
        if let Some(next) = next {
            self.store
                .set(key, BucketState::TokenBucket(next), self.ttl)
                .await?;
        }

        trace!(key = %key, tokens = ?next.map(|s| s.tokens), %decision, "Token bucket checked");
        Ok(decision)
    }

    fn algorithm(&self) -> &'static str {
        "token-bucket"
    }
}

/// KEYS[1] = bucket key
/// ARGV[1] = bucket_size, ARGV[2] = refill_rate, ARGV[3] = now, ARGV[4] = ttl (seconds)
pub(crate) const TOKEN_BUCKET_SCRIPT: AtomicScript = AtomicScript::new(
    "token_bucket",
    r#"
local capacity = tonumber(ARGV[1])
local now = tonumber(ARGV[3])
local ttl_ms = math.ceil(tonumber(ARGV[4]) * 1000)

local data = redis.call("HMGET", KEYS[1], "tokens", "last_refill")
local tokens = tonumber(data[1])
local last_refill = tonumber(data[2])

if (not tokens or not last_refill) and redis.call("EXISTS", KEYS[1]) == 1 then
    return redis.error_reply("state belongs to another algorithm")
end

if not tokens or not last_refill then
    redis.call("HSET", KEYS[1], "tokens", capacity - 1, "last_refill", ARGV[3])
    redis.call("PEXPIRE", KEYS[1], ttl_ms)
    return 1
end

local elapsed = math.max(0, now - last_refill)
tokens = math.min(capacity, tokens + math.floor(elapsed * tonumber(ARGV[2])))

if tokens <= 0 then
    return 0
end

redis.call("HSET", KEYS[1], "tokens", tokens - 1, "last_refill", ARGV[3])
redis.call("PEXPIRE", KEYS[1], ttl_ms)
return 1
"#,
);

/// Token bucket over a shared scripted store.
pub struct SharedTokenBucket<S: ScriptedStore = RedisStore> {
    store: Arc<S>,
    params: TokenBucketParams,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl<S: ScriptedStore> SharedTokenBucket<S> {
    pub fn new(
        store: Arc<S>,
        params: TokenBucketParams,
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
impl<S: ScriptedStore + 'static> RateLimiterBackend for SharedTokenBucket<S> {
    async fn allow(&self, key: &str) -> Result<Decision, StoreError> {
        let args = [
            self.params.bucket_size as f64,
            self.params.refill_rate,
            self.clock.now(),
            self.ttl.as_secs_f64(),
        ];
        let result = self
            .store
            .atomic_update(key, &TOKEN_BUCKET_SCRIPT, &args)
            .await?;

        let decision = Decision::from_allowed(result == 1);
        trace!(key = %key, %decision, "Shared token bucket checked");
        Ok(decision)
    }

    fn algorithm(&self) -> &'static str {
        "token-bucket"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::StateStore;

    fn bucket(
        bucket_size: u64,
        refill_rate: f64,
    ) -> (LocalTokenBucket, ManualClock, Arc<MemoryStore>) {
        let clock = ManualClock::new(0.0);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let limiter = LocalTokenBucket::new(
            Arc::clone(&store),
            TokenBucketParams {
                bucket_size,
                refill_rate,
            },
            Arc::new(clock.clone()),
            Duration::from_secs(3600),
        );
        (limiter, clock, store)
    }

    async fn tokens(store: &MemoryStore, key: &str) -> u64 {
        match store.get(key).await.unwrap() {
            Some(BucketState::TokenBucket(state)) => state.tokens,
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refill_scenario() {
        let (limiter, clock, store) = bucket(3, 1.0);

        assert!(limiter.allow("k").await.unwrap().is_allowed());
        assert_eq!(tokens(&store, "k").await, 2);
        assert!(limiter.allow("k").await.unwrap().is_allowed());
        assert_eq!(tokens(&store, "k").await, 1);
        assert!(limiter.allow("k").await.unwrap().is_allowed());
        assert_eq!(tokens(&store, "k").await, 0);
        assert!(!limiter.allow("k").await.unwrap().is_allowed());

        clock.set(2.0);
        assert!(limiter.allow("k").await.unwrap().is_allowed());
        assert_eq!(tokens(&store, "k").await, 1);
    }

    #[tokio::test]
    async fn test_zero_elapsed_consumes_one_token_per_call() {
        let (limiter, _clock, _store) = bucket(5, 0.5);

        for _ in 0..5 {
            assert!(limiter.allow("k").await.unwrap().is_allowed());
        }
        for _ in 0..3 {
            assert!(!limiter.allow("k").await.unwrap().is_allowed());
        }
    }

    #[tokio::test]
    async fn test_tokens_never_exceed_bucket_size() {
        let (limiter, clock, store) = bucket(4, 10.0);

        limiter.allow("k").await.unwrap();
        for _ in 0..10 {
            clock.advance(100.0);
            limiter.allow("k").await.unwrap();
            assert!(tokens(&store, "k").await < 4);
        }
    }

    #[tokio::test]
    async fn test_denial_keeps_refill_progress() {
        let (limiter, clock, _store) = bucket(1, 1.0);

        assert!(limiter.allow("k").await.unwrap().is_allowed());
        clock.advance(0.6);
        assert!(!limiter.allow("k").await.unwrap().is_allowed());
        clock.advance(0.6);
        // 1.2s since the last refill, so one token is back.
        assert!(limiter.allow("k").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_idle_bucket_expires_to_full() {
        let (limiter, clock, store) = bucket(2, 0.0001);

        limiter.allow("k").await.unwrap();
        limiter.allow("k").await.unwrap();
        assert!(!limiter.allow("k").await.unwrap().is_allowed());

        clock.advance(3600.0);
        assert!(limiter.allow("k").await.unwrap().is_allowed());
        assert_eq!(tokens(&store, "k").await, 1);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let (limiter, _clock, _store) = bucket(1, 1.0);

        assert!(limiter.allow("a").await.unwrap().is_allowed());
        assert!(!limiter.allow("a").await.unwrap().is_allowed());
        assert!(limiter.allow("b").await.unwrap().is_allowed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_take_each_token_once() {
        let (limiter, _clock, _store) = bucket(8, 1.0);
        let limiter = Arc::new(limiter);

        let tasks: Vec<_> = (0..40)
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
        assert_eq!(allowed, 8);
    }
}
