//! Per-key state persisted by the algorithm backends.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Fixed window counter state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FixedWindowState {
    pub count: u64,
    pub window_start: f64,
}

/// Token bucket state. `tokens` stays within `[0, bucket_size]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketState {
    pub tokens: u64,
    pub last_refill: f64,
}

/// Leaky bucket state. `level` is the accumulated water, never negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeakyBucketState {
    pub level: f64,
    pub last_drain: f64,
}

/// State stored under a limiter key, tagged by the algorithm that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BucketState {
    FixedWindow(FixedWindowState),
    TokenBucket(TokenBucketState),
    LeakyBucket(LeakyBucketState),
}

impl BucketState {
    /// Hash fields used to persist this state in a shared store.
    ///
    /// The field names match the ones read and written by the atomic scripts,
    /// so state written either way can be read back either way.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        match self {
            BucketState::FixedWindow(s) => vec![
                ("count", s.count.to_string()),
                ("window_start", s.window_start.to_string()),
            ],
            BucketState::TokenBucket(s) => vec![
                ("tokens", s.tokens.to_string()),
                ("last_refill", s.last_refill.to_string()),
            ],
            BucketState::LeakyBucket(s) => vec![
                ("level", s.level.to_string()),
                ("last_drain", s.last_drain.to_string()),
            ],
        }
    }

    /// Rebuild a state from hash fields. The algorithm is recognised by which
    /// fields are present.
    pub fn from_fields(key: &str, fields: &HashMap<String, String>) -> Result<Self, StoreError> {
        let field = |name: &str| -> Result<f64, StoreError> {
            let raw = fields
                .get(name)
                .ok_or_else(|| corrupt(key, format!("missing field '{name}'")))?;
            raw.parse::<f64>()
                .map_err(|e| corrupt(key, format!("field '{name}': {e}")))
        };

        if fields.contains_key("count") {
            Ok(BucketState::FixedWindow(FixedWindowState {
                count: field("count")?.max(0.0) as u64,
                window_start: field("window_start")?,
            }))
        } else if fields.contains_key("tokens") {
            Ok(BucketState::TokenBucket(TokenBucketState {
                tokens: field("tokens")?.max(0.0) as u64,
                last_refill: field("last_refill")?,
            }))
        } else if fields.contains_key("level") {
            Ok(BucketState::LeakyBucket(LeakyBucketState {
                level: field("level")?.max(0.0),
                last_drain: field("last_drain")?,
            }))
        } else {
            Err(corrupt(key, "unrecognised bucket state".to_string()))
        }
    }
}

fn corrupt(key: &str, reason: String) -> StoreError {
    StoreError::CorruptState {
        key: key.to_string(),
        reason,
    }
}
