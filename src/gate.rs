//! Per-request dispatch: resolve a policy, build its key, consult its backend.
//!
//! A request moves through [`GateStage`]s in order. A deny is a normal
//! [`Outcome`]; a failure at any stage is a [`GateError`] so hosts can tell
//! "rate limited" apart from "misconfigured".

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use http::StatusCode;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{PlanMode, Settings, StoreSelection};
use crate::error::{BoxError, ConfigError, FloodgateError, GateError};
use crate::key::{Extractor, KeyBuilder, LimiterKey};
use crate::policy::{Policy, PolicyRegistry, PolicyResolver, RegisteredPolicy};
use crate::ratelimit::{Decision, RateLimiterBackend};
use crate::request::RequestContext;
use crate::store::{MemoryStore, RedisStore, RedisStoreConfig, StoreHandle};

/// Progress of one request through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStage {
    Start,
    Resolved,
    Keyed,
    Decided,
}

impl fmt::Display for GateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GateStage::Start => "start",
            GateStage::Resolved => "resolved",
            GateStage::Keyed => "keyed",
            GateStage::Decided => "decided",
        })
    }
}

/// Body of a rejection response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectionBody {
    pub detail: &'static str,
}

/// What the host sends back for a denied request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub policy: String,
    pub key: LimiterKey,
}

impl Rejection {
    pub const DETAIL: &'static str = "rate limit exceeded";

    pub fn status(&self) -> StatusCode {
        StatusCode::TOO_MANY_REQUESTS
    }

    pub fn body(&self) -> RejectionBody {
        RejectionBody {
            detail: Self::DETAIL,
        }
    }

    /// The body serialized as JSON: `{"detail":"rate limit exceeded"}`.
    pub fn body_json(&self) -> String {
        serde_json::json!({ "detail": Self::DETAIL }).to_string()
    }
}

/// Terminal output of the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Pass the request on to the next handler.
    Forward,
    /// Answer with [`Rejection::status`] and [`Rejection::body_json`].
    Reject(Rejection),
}

impl Outcome {
    pub fn is_forward(&self) -> bool {
        matches!(self, Outcome::Forward)
    }
}

/// Full record of a decided request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub policy: String,
    pub key: LimiterKey,
    pub decision: Decision,
}

impl Evaluation {
    pub fn into_outcome(self) -> Outcome {
        match self.decision {
            Decision::Allow => Outcome::Forward,
            Decision::Deny => Outcome::Reject(Rejection {
                policy: self.policy,
                key: self.key,
            }),
        }
    }
}

enum Dispatch {
    Single(String),
    Composite(PolicyResolver),
}

/// Applies rate limit policies to requests.
///
/// Cheap to share behind an `Arc`; `check` may be called concurrently.
pub struct DispatchGate {
    registry: PolicyRegistry,
    dispatch: Dispatch,
}

impl fmt::Debug for DispatchGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match &self.dispatch {
            Dispatch::Single(_) => "single",
            Dispatch::Composite(_) => "composite",
        };
        f.debug_struct("DispatchGate")
            .field("mode", &mode)
            .field("policies", &self.registry.names())
            .finish()
    }
}

impl DispatchGate {
    /// A gate that applies one policy to every request.
    pub fn single(
        policy: Policy,
        backend: Arc<dyn RateLimiterBackend>,
    ) -> Result<Self, ConfigError> {
        let name = policy.name().to_string();
        let mut registry = PolicyRegistry::new();
        registry.register(policy, backend)?;
        Ok(Self {
            registry,
            dispatch: Dispatch::Single(name),
        })
    }

    /// A gate that asks `resolver` which registered policy to apply.
    pub fn composite(
        registry: PolicyRegistry,
        resolver: PolicyResolver,
    ) -> Result<Self, ConfigError> {
        if registry.is_empty() {
            return Err(ConfigError::MissingPolicies);
        }
        Ok(Self {
            registry,
            dispatch: Dispatch::Composite(resolver),
        })
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// Check a request against its policy.
    pub async fn check(&self, request: &RequestContext) -> Result<Outcome, GateError> {
        self.evaluate(request).await.map(Evaluation::into_outcome)
    }

    /// Like [`check`](Self::check), but returns the policy, key and decision.
    pub async fn evaluate(&self, request: &RequestContext) -> Result<Evaluation, GateError> {
        trace!(stage = %GateStage::Start, path = %request.path(), "Dispatching request");

        let registered = self.resolve(request).inspect_err(|e| {
            warn!(error = %e, path = %request.path(), "Policy resolution failed");
        })?;
        let policy = registered.policy.name();
        trace!(stage = %GateStage::Resolved, policy = %policy);

        let subject = registered
            .policy
            .key_builder()
            .build(request)
            .map_err(|source| GateError::KeyBuilderFailed {
                policy: policy.to_string(),
                source,
            })
            .inspect_err(|e| warn!(error = %e, "Key building failed"))?;
        let key = LimiterKey::new(policy, subject);
        trace!(stage = %GateStage::Keyed, policy = %policy, key = %key);

        let decision = registered
            .backend
            .allow(&key.to_string_key())
            .await
            .map_err(|source| GateError::Store {
                policy: policy.to_string(),
                source,
            })
            .inspect_err(|e| warn!(error = %e, key = %key, "Backend check failed"))?;

        trace!(
            stage = %GateStage::Decided,
            policy = %policy,
            key = %key,
            decision = %decision,
            "Request decided"
        );
        if decision == Decision::Deny {
            debug!(policy = %policy, key = %key, "Rate limit exceeded");
        }

        Ok(Evaluation {
            policy: policy.to_string(),
            key,
            decision,
        })
    }

    fn resolve(&self, request: &RequestContext) -> Result<&RegisteredPolicy, GateError> {
        let name = match &self.dispatch {
            Dispatch::Single(name) => name.clone(),
            Dispatch::Composite(resolver) => {
                resolver(request).map_err(|source| GateError::ResolverFailed { source })?
            }
        };
        self.registry.get(&name).ok_or(GateError::UnknownPolicy(name))
    }
}

/// Builds a [`DispatchGate`] from [`Settings`] plus the pieces that cannot
/// be written in a file.
///
/// Key builders are chosen per policy in this order: one registered with
/// [`policy_key_builder`](Self::policy_key_builder), the policy's or the
/// top-level `key_builder` setting, then [`key_builder`](Self::key_builder).
pub struct GateBuilder {
    settings: Settings,
    resolver: Option<PolicyResolver>,
    extractors: HashMap<String, Extractor>,
    default_key_builder: Option<Arc<dyn KeyBuilder>>,
    key_builders: HashMap<String, Arc<dyn KeyBuilder>>,
    clock: Arc<dyn Clock>,
    local_store: Option<Arc<MemoryStore>>,
}

/// A policy whose configuration has been fully checked, awaiting its store.
#[derive(Debug, Clone)]
pub struct PreparedPolicy {
    pub policy: Policy,
    pub store: StoreSelection,
    pub ttl: std::time::Duration,
}

impl GateBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            resolver: None,
            extractors: HashMap::new(),
            default_key_builder: None,
            key_builders: HashMap::new(),
            clock: Arc::new(SystemClock::new()),
            local_store: None,
        }
    }

    /// Resolver used in composite mode.
    pub fn policy_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&RequestContext) -> Result<String, BoxError> + Send + Sync + 'static,
    {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Register a named extractor for `schema` key builders.
    pub fn extractor<F>(mut self, name: impl Into<String>, extractor: F) -> Self
    where
        F: Fn(&RequestContext) -> Result<String, BoxError> + Send + Sync + 'static,
    {
        self.extractors.insert(name.into(), Arc::new(extractor));
        self
    }

    /// Fallback key builder for policies that configure none.
    pub fn key_builder(mut self, key_builder: Arc<dyn KeyBuilder>) -> Self {
        self.default_key_builder = Some(key_builder);
        self
    }

    /// Key builder for one policy, overriding its settings.
    pub fn policy_key_builder(
        mut self,
        policy: impl Into<String>,
        key_builder: Arc<dyn KeyBuilder>,
    ) -> Self {
        self.key_builders.insert(policy.into(), key_builder);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use an existing in-process store instead of creating one.
    pub fn local_store(mut self, store: Arc<MemoryStore>) -> Self {
        self.local_store = Some(store);
        self
    }

    /// Run every configuration check that needs no I/O.
    pub fn prepare(&self) -> Result<(PlanMode, Vec<PreparedPolicy>), ConfigError> {
        let plan = self.settings.validate()?;
        if plan.mode == PlanMode::Composite && self.resolver.is_none() {
            return Err(ConfigError::MissingResolver);
        }

        let mut unmatched: Vec<&String> = self
            .key_builders
            .keys()
            .filter(|name| !plan.policies.iter().any(|spec| &spec.name == *name))
            .collect();
        unmatched.sort();
        if let Some(name) = unmatched.first() {
            return Err(ConfigError::InvalidKeyBuilder(format!(
                "key builder registered for unknown policy '{}'",
                name
            )));
        }

        let mut prepared = Vec::with_capacity(plan.policies.len());
        for spec in plan.policies {
            let key_builder = match self.key_builders.get(&spec.name) {
                Some(builder) => Arc::clone(builder),
                None => match &spec.key_builder {
                    Some(settings) => settings.build(&self.extractors)?,
                    None => self
                        .default_key_builder
                        .clone()
                        .ok_or(ConfigError::MissingKeyBuilder)?,
                },
            };

            prepared.push(PreparedPolicy {
                policy: Policy::new(spec.name, spec.params, key_builder)?,
                store: spec.store,
                ttl: spec.ttl,
            });
        }

        Ok((plan.mode, prepared))
    }

    /// Validate, connect the configured stores and assemble the gate.
    ///
    /// Policies on the local tier share one in-process store; each shared
    /// cache alias gets one connection.
    pub async fn build(self) -> Result<DispatchGate, FloodgateError> {
        let (mode, prepared) = self.prepare()?;

        let local = self
            .local_store
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryStore::with_clock(Arc::clone(&self.clock))));
        let mut shared: HashMap<String, Arc<RedisStore>> = HashMap::new();

        let mut registry = PolicyRegistry::new();
        for entry in prepared {
            let store = match &entry.store {
                StoreSelection::Local => StoreHandle::Local(Arc::clone(&local)),
                StoreSelection::Shared { alias, cache } => {
                    let redis = match shared.get(alias) {
                        Some(store) => Arc::clone(store),
                        None => {
                            let mut config = RedisStoreConfig::default();
                            if let Some(prefix) = &cache.key_prefix {
                                config.key_prefix = prefix.clone();
                            }
                            let connected =
                                RedisStore::connect_with_config(&cache.url, config).await?;
                            let store = Arc::new(connected);
                            shared.insert(alias.clone(), Arc::clone(&store));
                            store
                        }
                    };
                    StoreHandle::Shared(redis)
                }
            };

            let backend = entry
                .policy
                .params()
                .backend(&store, Arc::clone(&self.clock), entry.ttl);
            info!(
                policy = %entry.policy.name(),
                backend = store.kind(),
                ttl_secs = entry.ttl.as_secs(),
                "Configured policy backend"
            );
            registry.register(entry.policy, backend)?;
        }

        let gate = match (mode, self.resolver) {
            (PlanMode::Composite, Some(resolver)) => DispatchGate::composite(registry, resolver)?,
            (PlanMode::Composite, None) => return Err(ConfigError::MissingResolver.into()),
            (PlanMode::Single, _) => {
                let name = registry
                    .names()
                    .first()
                    .map(|n| n.to_string())
                    .ok_or(ConfigError::MissingPolicies)?;
                DispatchGate {
                    registry,
                    dispatch: Dispatch::Single(name),
                }
            }
        };

        info!(policies = ?gate.registry.names(), "Dispatch gate ready");
        Ok(gate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::key::{GlobalKeyBuilder, IpKeyBuilder};
    use crate::policy::AlgorithmParams;
    use crate::ratelimit::FixedWindowParams;
    use http::Method;

    fn fixed_window_policy(name: &str, threshold: u64) -> (Policy, Arc<dyn RateLimiterBackend>) {
        let params = AlgorithmParams::FixedWindow(FixedWindowParams {
            threshold,
            window: 60,
        });
        let clock = Arc::new(ManualClock::new(0.0));
        let store = StoreHandle::Local(Arc::new(MemoryStore::with_clock(clock.clone())));
        let backend = params.backend(&store, clock, std::time::Duration::from_secs(60));
        (
            Policy::new(name, params, Arc::new(GlobalKeyBuilder)).unwrap(),
            backend,
        )
    }

    fn request() -> RequestContext {
        RequestContext::new(Method::GET, "/").with_remote_addr("10.0.0.1".parse().unwrap())
    }

    #[test]
    fn test_rejection_body() {
        let rejection = Rejection {
            policy: "p".to_string(),
            key: LimiterKey::new("p", "global"),
        };
        assert_eq!(rejection.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(rejection.body_json(), r#"{"detail":"rate limit exceeded"}"#);
        assert_eq!(
            serde_json::to_value(rejection.body()).unwrap(),
            serde_json::json!({ "detail": "rate limit exceeded" })
        );
    }

    #[tokio::test]
    async fn test_single_gate_rejects_over_threshold() {
        let (policy, backend) = fixed_window_policy("global", 2);
        let gate = DispatchGate::single(policy, backend).unwrap();

        assert_eq!(gate.check(&request()).await.unwrap(), Outcome::Forward);
        assert_eq!(gate.check(&request()).await.unwrap(), Outcome::Forward);

        match gate.check(&request()).await.unwrap() {
            Outcome::Reject(rejection) => {
                assert_eq!(rejection.policy, "global");
                assert_eq!(rejection.key.to_string_key(), "global:global");
            }
            Outcome::Forward => panic!("third request should be rejected"),
        }
    }

    #[tokio::test]
    async fn test_composite_unknown_policy_is_an_error() {
        let (policy, backend) = fixed_window_policy("known", 5);
        let mut registry = PolicyRegistry::new();
        registry.register(policy, backend).unwrap();

        let resolver: PolicyResolver = Arc::new(|req: &RequestContext| -> Result<String, BoxError> {
            Ok(req.header("x-policy").unwrap_or("missing").to_string())
        });
        let gate = DispatchGate::composite(registry, resolver).unwrap();

        let err = gate.check(&request()).await.unwrap_err();
        assert!(matches!(err, GateError::UnknownPolicy(ref name) if name == "missing"));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = gate.check(&request().with_header("x-policy", "known")).await;
        assert_eq!(ok.unwrap(), Outcome::Forward);
    }

    #[tokio::test]
    async fn test_resolver_failure_is_not_a_denial() {
        let (policy, backend) = fixed_window_policy("known", 5);
        let mut registry = PolicyRegistry::new();
        registry.register(policy, backend).unwrap();

        let resolver: PolicyResolver =
            Arc::new(|_req: &RequestContext| -> Result<String, BoxError> {
                Err("resolver exploded".into())
            });
        let gate = DispatchGate::composite(registry, resolver).unwrap();

        let err = gate.check(&request()).await.unwrap_err();
        assert!(matches!(err, GateError::ResolverFailed { .. }));
        assert!(err.to_string().contains("resolver exploded"));
    }

    #[test]
    fn test_composite_requires_policies() {
        let resolver: PolicyResolver =
            Arc::new(|_req: &RequestContext| -> Result<String, BoxError> { Ok("a".to_string()) });
        let err = DispatchGate::composite(PolicyRegistry::new(), resolver).unwrap_err();
        assert_eq!(err, ConfigError::MissingPolicies);
    }

    #[test]
    fn test_prepare_requires_key_builder() {
        let settings = Settings::from_yaml(
            "algorithm: fixed-window\nwindow: 1\nthreshold: 1\nbackend: { cache: local }\n",
        )
        .unwrap();

        let err = GateBuilder::new(settings.clone()).prepare().unwrap_err();
        assert_eq!(err, ConfigError::MissingKeyBuilder);

        let (mode, prepared) = GateBuilder::new(settings)
            .key_builder(Arc::new(IpKeyBuilder))
            .prepare()
            .unwrap();
        assert_eq!(mode, PlanMode::Single);
        assert_eq!(prepared[0].policy.name(), "default");
    }

    #[test]
    fn test_prepare_rejects_key_builder_for_unknown_policy() {
        let settings = Settings::from_yaml(
            r#"
algorithm: fixed-window
name: api
window: 1
threshold: 1
backend: { cache: local }
"#,
        )
        .unwrap();

        let err = GateBuilder::new(settings.clone())
            .key_builder(Arc::new(IpKeyBuilder))
            .policy_key_builder("apl", Arc::new(GlobalKeyBuilder))
            .prepare()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKeyBuilder(ref msg) if msg.contains("'apl'")));

        let (_, prepared) = GateBuilder::new(settings)
            .policy_key_builder("api", Arc::new(GlobalKeyBuilder))
            .prepare()
            .unwrap();
        assert_eq!(prepared[0].policy.name(), "api");
    }

    #[test]
    fn test_prepare_requires_resolver_in_composite_mode() {
        let settings = Settings::from_yaml(
            r#"
algorithm: composite
key_builder: { kind: global }
backend: { cache: local }
policies:
  a: { algorithm: fixed-window, window: 1, threshold: 1 }
"#,
        )
        .unwrap();

        assert_eq!(
            GateBuilder::new(settings).prepare().unwrap_err(),
            ConfigError::MissingResolver
        );
    }
}
