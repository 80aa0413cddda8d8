//! Configuration management for Floodgate.
//!
//! [`Settings`] mirrors the configuration file. [`Settings::validate`] turns
//! it into a [`PolicyPlan`] or fails with the first [`ConfigError`], before
//! any request is served.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::key::{
    Extractor, GlobalKeyBuilder, IpKeyBuilder, IpPathKeyBuilder, KeyBuilder, MethodKeyBuilder,
    SchemaKeyBuilder,
};
use crate::policy::{validate_policy_name, AlgorithmKind, AlgorithmParams, MAX_INTEGER_PARAM};

/// Environment variable prefix for overrides, e.g. `FLOODGATE__THRESHOLD=20`.
pub const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for the rate limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Algorithm name (`fixed-window`, `token-bucket`, `leaky-bucket`, `composite`)
    #[serde(default)]
    pub algorithm: Option<String>,

    /// Policy name used outside composite mode
    #[serde(default = "default_policy_name")]
    pub name: String,

    /// Algorithm parameters
    #[serde(flatten)]
    pub params: ParamSettings,

    /// Idle lifetime of bucket state, in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// How limiter keys are derived from requests
    #[serde(default)]
    pub key_builder: Option<KeyBuilderSettings>,

    /// Where bucket state lives
    #[serde(default)]
    pub backend: Option<BackendSettings>,

    /// Shared cache aliases
    #[serde(default)]
    pub caches: HashMap<String, CacheSettings>,

    /// Named policies for composite mode
    #[serde(default)]
    pub policies: Option<BTreeMap<String, PolicySettings>>,
}

fn default_policy_name() -> String {
    "default".to_string()
}

fn default_ttl_secs() -> u64 {
    3600
}

/// Numeric algorithm parameters. Only those required by the chosen
/// algorithm are read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refill_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leak_rate: Option<f64>,
}

impl ParamSettings {
    /// The provided parameters as a name -> value mapping.
    pub fn to_values(&self) -> BTreeMap<String, f64> {
        [
            ("window", self.window),
            ("threshold", self.threshold),
            ("bucket_size", self.bucket_size),
            ("refill_rate", self.refill_rate),
            ("capacity", self.capacity),
            ("leak_rate", self.leak_rate),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name.to_string(), v)))
        .collect()
    }
}

/// One entry of the `policies` mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySettings {
    #[serde(default)]
    pub algorithm: Option<String>,

    #[serde(flatten)]
    pub params: ParamSettings,

    /// Overrides the top-level key builder
    #[serde(default)]
    pub key_builder: Option<KeyBuilderSettings>,

    /// Overrides the top-level backend
    #[serde(default)]
    pub backend: Option<BackendSettings>,

    /// Overrides the top-level TTL
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// Declarative key builder selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum KeyBuilderSettings {
    IpPath,
    Ip,
    Method,
    Global,
    Schema(SchemaSettings),
}

/// Fragments of a schema key builder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaSettings {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub ip: bool,
    #[serde(default)]
    pub path: bool,
    #[serde(default)]
    pub method: bool,
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub params: Vec<String>,
    /// Name of an extractor registered on the gate builder
    #[serde(default)]
    pub extractor: Option<String>,
}

impl KeyBuilderSettings {
    /// Instantiate the key builder. Named extractors are looked up in
    /// `extractors`; an unknown name is a configuration error.
    pub fn build(
        &self,
        extractors: &HashMap<String, Extractor>,
    ) -> Result<Arc<dyn KeyBuilder>, ConfigError> {
        let builder: Arc<dyn KeyBuilder> = match self {
            KeyBuilderSettings::IpPath => Arc::new(IpPathKeyBuilder),
            KeyBuilderSettings::Ip => Arc::new(IpKeyBuilder),
            KeyBuilderSettings::Method => Arc::new(MethodKeyBuilder),
            KeyBuilderSettings::Global => Arc::new(GlobalKeyBuilder),
            KeyBuilderSettings::Schema(schema) => {
                let mut builder = SchemaKeyBuilder::new()
                    .ip(schema.ip)
                    .path(schema.path)
                    .method(schema.method)
                    .params(schema.params.iter().cloned());
                if let Some(prefix) = &schema.prefix {
                    builder = builder.prefix(prefix.clone());
                }
                if let Some(header) = &schema.header {
                    builder = builder.header(header.clone());
                }
                if let Some(name) = &schema.extractor {
                    let extractor = extractors.get(name).ok_or_else(|| {
                        ConfigError::InvalidKeyBuilder(format!("unknown extractor '{}'", name))
                    })?;
                    builder = builder.extractor(Arc::clone(extractor));
                }
                Arc::new(builder)
            }
        };
        Ok(builder)
    }
}

/// Backend selection: `cache` is `local` or `shared` (alias `redis`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendSettings {
    #[serde(default)]
    pub cache: Option<String>,
    #[serde(default)]
    pub cache_alias: Option<String>,
}

/// Connection details of a shared cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Redis connection URL
    pub url: String,
    /// Prefix for every key written to this cache
    #[serde(default)]
    pub key_prefix: Option<String>,
}

/// Validated store selection for a policy.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreSelection {
    Local,
    Shared {
        alias: String,
        cache: CacheSettings,
    },
}

/// Whether requests go to one policy or are routed by a resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    Single,
    Composite,
}

/// A validated policy, ready to be instantiated.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySpec {
    pub name: String,
    pub params: AlgorithmParams,
    /// `None` when the key builder is expected to be supplied programmatically
    pub key_builder: Option<KeyBuilderSettings>,
    pub store: StoreSelection,
    pub ttl: Duration,
}

/// The validated result of [`Settings::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyPlan {
    pub mode: PlanMode,
    pub policies: Vec<PolicySpec>,
}

impl Settings {
    /// Load settings from a YAML file, layered with `FLOODGATE__*` environment overrides.
    ///
    /// Keys from the file keep their case, so policy names and cache aliases
    /// match what `from_yaml` produces. Override keys arrive lowercased and are
    /// matched against file keys without regard to case.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limiter configuration");

        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
        let mut document: serde_yaml::Value = serde_yaml::from_str(&raw).map_err(load_error)?;

        let overrides: serde_yaml::Value = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(load_error)?;
        merge_overrides(&mut document, overrides);

        serde_yaml::from_value(document).map_err(load_error)
    }

    /// Parse settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(load_error)
    }

    /// Validate everything that can be checked without I/O.
    ///
    /// Key builders may be absent here; the gate builder fails if it cannot
    /// supply one programmatically.
    pub fn validate(&self) -> Result<PolicyPlan, ConfigError> {
        let algorithm = self
            .algorithm
            .as_deref()
            .ok_or(ConfigError::MissingAlgorithm)?;
        let kind: AlgorithmKind = algorithm.parse()?;

        if kind != AlgorithmKind::Composite {
            let spec = self.policy_spec(
                &self.name,
                kind,
                &self.params,
                self.key_builder.as_ref(),
                self.backend.as_ref(),
                self.ttl_secs,
            )?;
            return Ok(PolicyPlan {
                mode: PlanMode::Single,
                policies: vec![spec],
            });
        }

        let policies = self
            .policies
            .as_ref()
            .filter(|p| !p.is_empty())
            .ok_or(ConfigError::MissingPolicies)?;

        let mut specs = Vec::with_capacity(policies.len());
        for (name, policy) in policies {
            let algorithm = policy
                .algorithm
                .as_deref()
                .ok_or_else(|| ConfigError::MissingPolicyAlgorithm(name.clone()))?;
            let kind: AlgorithmKind = algorithm.parse()?;
            if kind == AlgorithmKind::Composite {
                return Err(ConfigError::InvalidAlgorithm(format!(
                    "policy '{}' cannot itself be composite",
                    name
                )));
            }

            specs.push(self.policy_spec(
                name,
                kind,
                &policy.params,
                policy.key_builder.as_ref().or(self.key_builder.as_ref()),
                policy.backend.as_ref().or(self.backend.as_ref()),
                policy.ttl_secs.unwrap_or(self.ttl_secs),
            )?);
        }

        Ok(PolicyPlan {
            mode: PlanMode::Composite,
            policies: specs,
        })
    }

    fn policy_spec(
        &self,
        name: &str,
        kind: AlgorithmKind,
        params: &ParamSettings,
        key_builder: Option<&KeyBuilderSettings>,
        backend: Option<&BackendSettings>,
        ttl_secs: u64,
    ) -> Result<PolicySpec, ConfigError> {
        validate_policy_name(name)?;
        let params = AlgorithmParams::from_values(kind, &params.to_values())?;
        let store = self.store_selection(backend.ok_or(ConfigError::MissingBackend)?)?;

        if ttl_secs == 0 || ttl_secs > MAX_INTEGER_PARAM {
            return Err(ConfigError::InvalidParameter {
                name: "ttl_secs".to_string(),
                reason: format!("must be between 1 and {}", MAX_INTEGER_PARAM),
            });
        }

        Ok(PolicySpec {
            name: name.to_string(),
            params,
            key_builder: key_builder.cloned(),
            store,
            ttl: Duration::from_secs(ttl_secs),
        })
    }

    fn store_selection(&self, backend: &BackendSettings) -> Result<StoreSelection, ConfigError> {
        let cache = backend
            .cache
            .as_deref()
            .ok_or_else(|| ConfigError::InvalidBackend("cache must be provided".to_string()))?;

        match cache {
            "local" => Ok(StoreSelection::Local),
            "shared" | "redis" => {
                let alias = backend
                    .cache_alias
                    .clone()
                    .unwrap_or_else(|| "default".to_string());
                let settings = self
                    .caches
                    .get(&alias)
                    .cloned()
                    .ok_or_else(|| ConfigError::UnknownCacheAlias(alias.clone()))?;
                Ok(StoreSelection::Shared {
                    alias,
                    cache: settings,
                })
            }
            other => Err(ConfigError::InvalidBackend(format!(
                "unknown cache '{}', expected 'local' or 'shared'",
                other
            ))),
        }
    }
}

fn load_error(e: impl std::fmt::Display) -> ConfigError {
    ConfigError::Load(e.to_string())
}

/// Overlay `overrides` onto `base`. Mappings merge recursively; anything else
/// replaces the base value.
fn merge_overrides(base: &mut serde_yaml::Value, overrides: serde_yaml::Value) {
    match (base, overrides) {
        (serde_yaml::Value::Mapping(base), serde_yaml::Value::Mapping(overrides)) => {
            for (key, value) in overrides {
                let existing = base.keys().find(|k| same_key(k, &key)).cloned();
                match existing {
                    Some(existing) => {
                        if let Some(slot) = base.get_mut(&existing) {
                            merge_overrides(slot, value);
                        }
                    }
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (serde_yaml::Value::Mapping(base), serde_yaml::Value::Null) if base.is_empty() => {}
        (base, overrides) => *base = overrides,
    }
}

fn same_key(a: &serde_yaml::Value, b: &serde_yaml::Value) -> bool {
    match (a.as_str(), b.as_str()) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => a == b,
    }
}
