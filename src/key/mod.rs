//! Limiter key derivation.
//!
//! A [`KeyBuilder`] turns the attributes of a request into a subject string.
//! The gate then scopes the subject to the policy being applied, producing a
//! [`LimiterKey`], so two policies never share bucket state.

mod recipes;
mod schema;

use std::fmt;

use crate::error::BoxError;
use crate::request::RequestContext;

pub use recipes::{GlobalKeyBuilder, IpKeyBuilder, IpPathKeyBuilder, MethodKeyBuilder};
pub use schema::{Extractor, SchemaKeyBuilder};

/// Derives a deterministic subject string from a request.
///
/// Implementations must be pure: the same request attributes always yield the
/// same string, and building a key has no side effects.
pub trait KeyBuilder: Send + Sync + fmt::Debug {
    fn build(&self, request: &RequestContext) -> Result<String, BoxError>;
}

/// A key that uniquely identifies a rate limited subject under one policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimiterKey {
    /// The policy this key belongs to
    pub policy: String,
    /// The subject produced by the policy's key builder
    pub subject: String,
}

impl LimiterKey {
    pub fn new(policy: &str, subject: impl Into<String>) -> Self {
        Self {
            policy: policy.to_string(),
            subject: subject.into(),
        }
    }

    /// The store key: `{policy}:{subject}`.
    ///
    /// Policy names cannot contain `:`, so keys of different policies never
    /// collide.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.policy, self.subject)
    }
}

impl fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limiter_key_to_string() {
        let key = LimiterKey::new("login", "ip:10.0.0.1");
        assert_eq!(key.to_string_key(), "login:ip:10.0.0.1");
        assert_eq!(key.to_string(), "login:ip:10.0.0.1");
    }

    #[test]
    fn test_same_subject_different_policies_differ() {
        let a = LimiterKey::new("strict", "global");
        let b = LimiterKey::new("relaxed", "global");

        assert_ne!(a, b);
        assert_ne!(a.to_string_key(), b.to_string_key());
    }

    #[test]
    fn test_limiter_key_equality() {
        assert_eq!(LimiterKey::new("p", "s"), LimiterKey::new("p", "s"));
    }
}
