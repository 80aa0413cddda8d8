//! Registry of named policies and their backends.
//!
//! All checks happen at registration, so a registry that was built
//! successfully can serve every request without re-validating.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::{validate_policy_name, Policy};
use crate::error::ConfigError;
use crate::ratelimit::RateLimiterBackend;

/// A policy together with the backend that enforces it.
#[derive(Clone)]
pub struct RegisteredPolicy {
    pub policy: Policy,
    pub backend: Arc<dyn RateLimiterBackend>,
}

impl std::fmt::Debug for RegisteredPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredPolicy")
            .field("policy", &self.policy)
            .field("backend", &self.backend.algorithm())
            .finish()
    }
}

/// Maps policy names to registered policies.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, RegisteredPolicy>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a policy. Names must be valid and unique.
    pub fn register(
        &mut self,
        policy: Policy,
        backend: Arc<dyn RateLimiterBackend>,
    ) -> Result<(), ConfigError> {
        validate_policy_name(policy.name())?;
        if self.policies.contains_key(policy.name()) {
            return Err(ConfigError::DuplicatePolicy(policy.name().to_string()));
        }

        info!(
            policy = %policy.name(),
            algorithm = %policy.algorithm(),
            key_builder = ?policy.key_builder(),
            "Registered rate limit policy"
        );
        self.policies
            .insert(policy.name().to_string(), RegisteredPolicy { policy, backend });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredPolicy> {
        self.policies.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::key::IpKeyBuilder;
    use crate::policy::AlgorithmParams;
    use crate::ratelimit::FixedWindowParams;
    use crate::store::{MemoryStore, StoreHandle};
    use std::time::Duration;

    fn entry(name: &str) -> (Policy, Arc<dyn RateLimiterBackend>) {
        let params = AlgorithmParams::FixedWindow(FixedWindowParams {
            threshold: 5,
            window: 60,
        });
        let policy = Policy::new(name, params, Arc::new(IpKeyBuilder)).unwrap();
        let backend = params.backend(
            &StoreHandle::Local(Arc::new(MemoryStore::new())),
            Arc::new(SystemClock::new()),
            Duration::from_secs(60),
        );
        (policy, backend)
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = PolicyRegistry::new();
        let (policy, backend) = entry("api");
        registry.register(policy, backend).unwrap();

        assert!(registry.contains("api"));
        assert_eq!(registry.get("api").unwrap().backend.algorithm(), "fixed-window");
        assert!(registry.get("other").is_none());
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut registry = PolicyRegistry::new();
        let (policy, backend) = entry("api");
        registry.register(policy, backend).unwrap();

        let (policy, backend) = entry("api");
        assert_eq!(
            registry.register(policy, backend),
            Err(ConfigError::DuplicatePolicy("api".to_string()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_names_are_sorted() {
        let mut registry = PolicyRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            let (policy, backend) = entry(name);
            registry.register(policy, backend).unwrap();
        }
        assert_eq!(registry.names(), vec!["alpha", "mid", "zeta"]);
    }
}
