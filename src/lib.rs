//! Floodgate - Request Rate Limiting
//!
//! This crate decides, per request, whether a caller may proceed. Requests are
//! mapped to a named policy, the policy's key builder derives a limiter key,
//! and one of three algorithms (fixed window, token bucket, leaky bucket)
//! updates that key's state in an in-process or Redis-backed store.

pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod key;
pub mod policy;
pub mod ratelimit;
pub mod request;
pub mod store;

pub use config::Settings;
pub use error::{ConfigError, FloodgateError, GateError, Result, StoreError};
pub use gate::{DispatchGate, GateBuilder, Outcome, Rejection};
pub use ratelimit::{Decision, RateLimiterBackend};
pub use request::RequestContext;
