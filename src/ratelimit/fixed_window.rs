//! Fixed window counter.
//!
//! Every key owns a counter that resets `window` seconds after the first
//! request of the window. The first `threshold` requests in a window are
//! allowed; later ones are denied but still counted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::backend::{Decision, RateLimiterBackend};
use super::state::{BucketState, FixedWindowState};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::{AtomicScript, LocalStore, MemoryStore, RedisStore, ScriptedStore};

/// Parameters of a fixed window counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindowParams {
    /// Maximum requests allowed per window.
    pub threshold: u64,
    /// Window length in seconds.
    pub window: u64,
}

impl FixedWindowParams {
    fn window_secs(&self) -> f64 {
        self.window as f64
    }
}

/// Apply one request to the counter.
fn step(
    state: Option<FixedWindowState>,
    now: f64,
    params: &FixedWindowParams,
) -> (Decision, FixedWindowState) {
    match state {
        Some(current) if now < current.window_start + params.window_secs() => {
            let count = current.count.saturating_add(1);
            let next = FixedWindowState {
                count,
                window_start: current.window_start,
            };
            (Decision::from_allowed(count <= params.threshold), next)
        }
        _ => (
            Decision::Allow,
            FixedWindowState {
                count: 1,
                window_start: now,
            },
        ),
    }
}

/// In-process fixed window counter.
pub struct LocalFixedWindow<S: LocalStore = MemoryStore> {
    store: Arc<S>,
    params: FixedWindowParams,
    clock: Arc<dyn Clock>,
}

impl<S: LocalStore> LocalFixedWindow<S> {
    pub fn new(store: Arc<S>, params: FixedWindowParams, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            params,
            clock,
        }
    }
}

#[async_trait]
impl<S: LocalStore + 'static> RateLimiterBackend for LocalFixedWindow<S> {
    async fn allow(&self, key: &str) -> Result<Decision, StoreError> {
        let _guard = self.store.acquire(key).await;
        let now = self.clock.now();

        let current = match self.store.get(key).await? {
            Some(BucketState::FixedWindow(state)) => Some(state),
            Some(_) => return Err(foreign_state(key)),
            None => {
                debug!(key = %key, window = self.params.window, "Opening new window");
                None
            }
        };

        let (decision, next) = step(current, now, &self.params);
        let remaining = (next.window_start + self.params.window_secs() - now).max(0.0);
        let ttl = Duration::try_from_secs_f64(remaining)
            .unwrap_or_else(|_| Duration::from_secs(self.params.window));
        self.store.set(key, BucketState::FixedWindow(next), ttl).await?;

        trace!(key = %key, count = next.count, %decision, "Fixed window checked");
        Ok(decision)
    }

    fn algorithm(&self) -> &'static str {
        "fixed-window"
    }
}

/// KEYS[1] = bucket key
/// ARGV[1] = now (seconds), ARGV[2] = window (seconds), ARGV[3] = threshold
pub(crate) const FIXED_WINDOW_SCRIPT: AtomicScript = AtomicScript::new(
    "fixed_window",
    r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])

local data = redis.call("HMGET", KEYS[1], "count", "window_start")
local count = tonumber(data[1])
local window_start = tonumber(data[2])

if (not count or not window_start) and redis.call("EXISTS", KEYS[1]) == 1 then
    return redis.error_reply("state belongs to another algorithm")
end

if not count or not window_start or now >= window_start + window then
    redis.call("HSET", KEYS[1], "count", 1, "window_start", ARGV[1])
    redis.call("PEXPIRE", KEYS[1], math.ceil(window * 1000))
    return 1
end

count = redis.call("HINCRBY", KEYS[1], "count", 1)
if count > tonumber(ARGV[3]) then
    return 0
end
return 1
"#,
);

/// Fixed window counter over a shared scripted store.
pub struct SharedFixedWindow<S: ScriptedStore = RedisStore> {
    store: Arc<S>,
    params: FixedWindowParams,
    clock: Arc<dyn Clock>,
}

impl<S: ScriptedStore> SharedFixedWindow<S> {
    pub fn new(store: Arc<S>, params: FixedWindowParams, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            params,
            clock,
        }
    }
}

#[async_trait]
impl<S: ScriptedStore + 'static> RateLimiterBackend for SharedFixedWindow<S> {
    async fn allow(&self, key: &str) -> Result<Decision, StoreError> {
        let args = [
            self.clock.now(),
            self.params.window_secs(),
            self.params.threshold as f64,
        ];
        let result = self
            .store
            .atomic_update(key, &FIXED_WINDOW_SCRIPT, &args)
            .await?;

        let decision = Decision::from_allowed(result == 1);
        trace!(key = %key, %decision, "Shared fixed window checked");
        Ok(decision)
    }

    fn algorithm(&self) -> &'static str {
        "fixed-window"
    }
}

pub(crate) fn foreign_state(key: &str) -> StoreError {
    StoreError::CorruptState {
        key: key.to_string(),
        reason: "state belongs to another algorithm".to_string(),
    }
}
