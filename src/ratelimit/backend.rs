//! Backend trait shared by every rate limiting algorithm.

use std::fmt;

use async_trait::async_trait;

use crate::error::StoreError;

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    /// The request is within its limit.
    Allow,
    /// The request exceeds its limit.
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub(crate) fn from_allowed(allowed: bool) -> Self {
        if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allow => f.write_str("allow"),
            Decision::Deny => f.write_str("deny"),
        }
    }
}

/// Trait for rate limiter implementations.
///
/// Each algorithm implements this once against an in-process store and once
/// against a shared store, so the dispatch gate can drive either. For a given
/// key the full read-evaluate-write sequence is atomic; different keys never
/// contend with each other.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Record one request against `key` and decide whether it may proceed.
    ///
    /// An `Err` means the store could not be consulted; it is never a denial.
    async fn allow(&self, key: &str) -> Result<Decision, StoreError>;

    /// Short algorithm name for logs.
    fn algorithm(&self) -> &'static str;
}
