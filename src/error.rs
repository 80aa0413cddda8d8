//! Error types for Floodgate.
//!
//! Errors fall into three groups that never mix:
//! - [`ConfigError`]: raised once while building a gate, aborts startup.
//! - [`GateError`]: raised per request when a policy cannot be resolved,
//!   a key cannot be built or the store cannot be reached.
//! - [`StoreError`]: failures of the state store itself.
//!
//! A rate limit denial is not an error; see [`crate::ratelimit::Decision`].

use http::StatusCode;
use thiserror::Error;

/// Boxed error returned by user-supplied callbacks (policy resolvers, key extractors).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Invalid or incomplete configuration, detected before any request is served.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("No algorithm configured")]
    MissingAlgorithm,

    #[error("Invalid algorithm: {0}")]
    InvalidAlgorithm(String),

    #[error(
        "Algorithm: {algorithm}\nProvided parameters: {}\nMissing parameters: {}",
        .provided.join(", "),
        .missing.join(", ")
    )]
    MissingParameters {
        algorithm: String,
        provided: Vec<String>,
        missing: Vec<String>,
    },

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Key builder must be provided")]
    MissingKeyBuilder,

    #[error("Invalid key builder: {0}")]
    InvalidKeyBuilder(String),

    #[error("Cache backend must be provided")]
    MissingBackend,

    #[error("Invalid cache backend: {0}")]
    InvalidBackend(String),

    #[error("Unknown cache alias: {0}")]
    UnknownCacheAlias(String),

    #[error("Invalid policy name: {0:?}")]
    InvalidPolicyName(String),

    #[error("Duplicate policy: {0}")]
    DuplicatePolicy(String),

    #[error("Composite mode requires at least one policy")]
    MissingPolicies,

    #[error("Policy '{0}' has no algorithm")]
    MissingPolicyAlgorithm(String),

    #[error("Composite mode requires a policy resolver")]
    MissingResolver,

    #[error("Failed to load configuration: {0}")]
    Load(String),
}

/// Errors raised by a state store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Corrupt state under key '{key}': {reason}")]
    CorruptState { key: String, reason: String },
}

/// Per-request failures of the dispatch gate.
///
/// These are surfaced to the host as 5xx responses and are never folded into
/// a denial.
#[derive(Error, Debug)]
pub enum GateError {
    #[error("Policy resolver failed: {source}")]
    ResolverFailed {
        #[source]
        source: BoxError,
    },

    #[error("Policy resolver returned unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("Key builder for policy '{policy}' failed: {source}")]
    KeyBuilderFailed {
        policy: String,
        #[source]
        source: BoxError,
    },

    #[error("Store failure for policy '{policy}': {source}")]
    Store {
        policy: String,
        #[source]
        source: StoreError,
    },
}

impl GateError {
    /// HTTP status the host should answer with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GateError::Store { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Gate error: {0}")]
    Gate(#[from] GateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
