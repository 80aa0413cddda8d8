//! Redis-backed shared state store.
//!
//! Bucket state is kept in a Redis hash per limiter key, with the hash fields
//! listed in [`BucketState::to_fields`]. Algorithm backends update the hash
//! through Lua scripts, which Redis runs without interleaving any other
//! command, so workers on different machines see one linear history per key.
//!
//! Scripts are sent with `EVALSHA` and loaded on first use.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, info};

use super::{AtomicScript, ScriptedStore, StateStore};
use crate::error::StoreError;
use crate::ratelimit::BucketState;

/// Configuration for Redis storage.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix prepended to every limiter key (default: "floodgate:")
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "floodgate:".to_string(),
        }
    }
}

/// Shared store backed by a Redis server.
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    scripts: DashMap<&'static str, Script>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis with default configuration.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!(key_prefix = %config.key_prefix, "Connected to Redis store");

        Ok(Self {
            connection,
            config,
            scripts: DashMap::new(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn script(&self, script: &AtomicScript) -> Script {
        self.scripts
            .entry(script.name())
            .or_insert_with(|| Script::new(script.source()))
            .value()
            .clone()
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<BucketState>, StoreError> {
        let mut conn = self.connection.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }
        BucketState::from_fields(key, &fields).map(Some)
    }

    async fn set(&self, key: &str, state: BucketState, ttl: Duration) -> Result<(), StoreError> {
        let full_key = self.key(key);
        let mut hset = redis::cmd("HSET");
        hset.arg(&full_key);
        for (field, value) in state.to_fields() {
            hset.arg(field).arg(value);
        }

        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("DEL")
            .arg(&full_key)
            .ignore()
            .add_command(hset)
            .ignore()
            .cmd("PEXPIRE")
            .arg(&full_key)
            .arg(ttl_ms)
            .ignore();

        let mut conn = self.connection.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: () = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ScriptedStore for RedisStore {
    async fn atomic_update(
        &self,
        key: &str,
        script: &AtomicScript,
        args: &[f64],
    ) -> Result<i64, StoreError> {
        let compiled = self.script(script);
        let mut invocation = compiled.key(self.key(key));
        for arg in args {
            invocation.arg(*arg);
        }

        let mut conn = self.connection.clone();
        let result: i64 = invocation.invoke_async(&mut conn).await?;
        debug!(key = %key, script = script.name(), result, "Atomic update");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_store_config_default() {
        let config = RedisStoreConfig::default();
        assert_eq!(config.key_prefix, "floodgate:");
    }
}
