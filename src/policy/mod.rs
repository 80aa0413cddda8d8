//! Policies: a named binding of an algorithm, its parameters and a key builder.

mod registry;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::{BoxError, ConfigError};
use crate::key::KeyBuilder;
use crate::ratelimit::{
    FixedWindowParams, LeakyBucketParams, LocalFixedWindow, LocalLeakyBucket, LocalTokenBucket,
    RateLimiterBackend, SharedFixedWindow, SharedLeakyBucket, SharedTokenBucket,
    TokenBucketParams,
};
use crate::request::RequestContext;
use crate::store::StoreHandle;

pub use registry::{PolicyRegistry, RegisteredPolicy};

/// Chooses the policy name to apply to a request in composite mode.
pub type PolicyResolver = Arc<dyn Fn(&RequestContext) -> Result<String, BoxError> + Send + Sync>;

/// The algorithm a policy runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmKind {
    FixedWindow,
    TokenBucket,
    LeakyBucket,
    /// Per-request choice among other policies.
    Composite,
}

impl AlgorithmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlgorithmKind::FixedWindow => "fixed-window",
            AlgorithmKind::TokenBucket => "token-bucket",
            AlgorithmKind::LeakyBucket => "leaky-bucket",
            AlgorithmKind::Composite => "composite",
        }
    }

    /// Parameters that must be present for this algorithm.
    pub fn required_params(&self) -> &'static [&'static str] {
        match self {
            AlgorithmKind::FixedWindow => &["window", "threshold"],
            AlgorithmKind::TokenBucket => &["bucket_size", "refill_rate"],
            AlgorithmKind::LeakyBucket => &["capacity", "leak_rate"],
            AlgorithmKind::Composite => &[],
        }
    }
}

impl FromStr for AlgorithmKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed-window" | "simple" => Ok(AlgorithmKind::FixedWindow),
            "token-bucket" => Ok(AlgorithmKind::TokenBucket),
            "leaky-bucket" => Ok(AlgorithmKind::LeakyBucket),
            "composite" => Ok(AlgorithmKind::Composite),
            other => Err(ConfigError::InvalidAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated, typed parameters of a concrete algorithm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AlgorithmParams {
    FixedWindow(FixedWindowParams),
    TokenBucket(TokenBucketParams),
    LeakyBucket(LeakyBucketParams),
}

impl AlgorithmParams {
    /// Validate a raw parameter mapping for `kind`.
    ///
    /// All required parameters must be present; extra ones are ignored.
    pub fn from_values(
        kind: AlgorithmKind,
        values: &BTreeMap<String, f64>,
    ) -> Result<Self, ConfigError> {
        let missing: Vec<String> = kind
            .required_params()
            .iter()
            .filter(|name| !values.contains_key(**name))
            .map(|name| name.to_string())
            .collect();

        if !missing.is_empty() {
            return Err(ConfigError::MissingParameters {
                algorithm: kind.to_string(),
                provided: values.keys().cloned().collect(),
                missing,
            });
        }

        let value = |name: &str| values[name];

        match kind {
            AlgorithmKind::FixedWindow => Ok(AlgorithmParams::FixedWindow(FixedWindowParams {
                window: positive_integer("window", value("window"))?,
                threshold: positive_integer("threshold", value("threshold"))?,
            })),
            AlgorithmKind::TokenBucket => Ok(AlgorithmParams::TokenBucket(TokenBucketParams {
                bucket_size: positive_integer("bucket_size", value("bucket_size"))?,
                refill_rate: positive_rate("refill_rate", value("refill_rate"))?,
            })),
            AlgorithmKind::LeakyBucket => Ok(AlgorithmParams::LeakyBucket(LeakyBucketParams {
                capacity: positive_integer("capacity", value("capacity"))?,
                leak_rate: positive_rate("leak_rate", value("leak_rate"))?,
            })),
            AlgorithmKind::Composite => Err(ConfigError::InvalidAlgorithm(
                "composite has no parameters of its own".to_string(),
            )),
        }
    }

    pub fn kind(&self) -> AlgorithmKind {
        match self {
            AlgorithmParams::FixedWindow(_) => AlgorithmKind::FixedWindow,
            AlgorithmParams::TokenBucket(_) => AlgorithmKind::TokenBucket,
            AlgorithmParams::LeakyBucket(_) => AlgorithmKind::LeakyBucket,
        }
    }

    /// Instantiate the backend for these parameters over `store`.
    ///
    /// `ttl` is the idle lifetime of bucket state; fixed windows expire with
    /// their window instead.
    pub fn backend(
        &self,
        store: &StoreHandle,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Arc<dyn RateLimiterBackend> {
        match (*self, store) {
            (AlgorithmParams::FixedWindow(p), StoreHandle::Local(s)) => {
                Arc::new(LocalFixedWindow::new(Arc::clone(s), p, clock))
            }
            (AlgorithmParams::FixedWindow(p), StoreHandle::Shared(s)) => {
                Arc::new(SharedFixedWindow::new(Arc::clone(s), p, clock))
            }
            (AlgorithmParams::TokenBucket(p), StoreHandle::Local(s)) => {
                Arc::new(LocalTokenBucket::new(Arc::clone(s), p, clock, ttl))
            }
            (AlgorithmParams::TokenBucket(p), StoreHandle::Shared(s)) => {
                Arc::new(SharedTokenBucket::new(Arc::clone(s), p, clock, ttl))
            }
            (AlgorithmParams::LeakyBucket(p), StoreHandle::Local(s)) => {
                Arc::new(LocalLeakyBucket::new(Arc::clone(s), p, clock, ttl))
            }
            (AlgorithmParams::LeakyBucket(p), StoreHandle::Shared(s)) => {
                Arc::new(SharedLeakyBucket::new(Arc::clone(s), p, clock, ttl))
            }
        }
    }
}

/// Largest accepted integer parameter. Windows and TTLs this long still fit
/// in a `Duration` and in a Redis millisecond expiry.
pub const MAX_INTEGER_PARAM: u64 = u32::MAX as u64;

fn positive_integer(name: &str, value: f64) -> Result<u64, ConfigError> {
    if !value.is_finite() || value < 1.0 || value.fract() != 0.0 {
        return Err(ConfigError::InvalidParameter {
            name: name.to_string(),
            reason: format!("expected a positive integer, got {}", value),
        });
    }
    if value > MAX_INTEGER_PARAM as f64 {
        return Err(ConfigError::InvalidParameter {
            name: name.to_string(),
            reason: format!("must be at most {}, got {}", MAX_INTEGER_PARAM, value),
        });
    }
    Ok(value as u64)
}

fn positive_rate(name: &str, value: f64) -> Result<f64, ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidParameter {
            name: name.to_string(),
            reason: format!("expected a positive number, got {}", value),
        });
    }
    Ok(value)
}

/// Check a policy name: non-empty, no surrounding whitespace, no `:`.
pub fn validate_policy_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name.trim() != name || name.contains(':') {
        return Err(ConfigError::InvalidPolicyName(name.to_string()));
    }
    Ok(())
}

/// A named algorithm configuration with its key builder. Immutable once built.
#[derive(Debug, Clone)]
pub struct Policy {
    name: String,
    params: AlgorithmParams,
    key_builder: Arc<dyn KeyBuilder>,
}

impl Policy {
    pub fn new(
        name: impl Into<String>,
        params: AlgorithmParams,
        key_builder: Arc<dyn KeyBuilder>,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        validate_policy_name(&name)?;
        Ok(Self {
            name,
            params,
            key_builder,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &AlgorithmParams {
        &self.params
    }

    pub fn algorithm(&self) -> AlgorithmKind {
        self.params.kind()
    }

    pub fn key_builder(&self) -> &Arc<dyn KeyBuilder> {
        &self.key_builder
    }
}
