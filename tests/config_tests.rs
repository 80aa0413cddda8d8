//! Configuration errors are raised before any request is served.

use std::io::Write;
use std::sync::Arc;

use floodgate::config::{KeyBuilderSettings, PlanMode, StoreSelection};
use floodgate::key::IpKeyBuilder;
use floodgate::{ConfigError, FloodgateError, GateBuilder, Settings};
use tokio_test::{assert_err, assert_ok};

fn settings(yaml: &str) -> Settings {
    assert_ok!(Settings::from_yaml(yaml))
}

#[test]
fn missing_algorithm() {
    let result = settings("backend: { cache: local }\n").validate();
    assert_eq!(assert_err!(result), ConfigError::MissingAlgorithm);
}

#[test]
fn unknown_algorithm() {
    let result = settings("algorithm: sliding-log\n").validate();
    assert_eq!(
        assert_err!(result),
        ConfigError::InvalidAlgorithm("sliding-log".to_string())
    );
}

#[test]
fn missing_parameter_names_both_sets() {
    let err = assert_err!(settings(
        "algorithm: token-bucket\nbucket_size: 3\nbackend: { cache: local }\n"
    )
    .validate());

    assert_eq!(
        err,
        ConfigError::MissingParameters {
            algorithm: "token-bucket".to_string(),
            provided: vec!["bucket_size".to_string()],
            missing: vec!["refill_rate".to_string()],
        }
    );
    let message = err.to_string();
    assert!(message.contains("Provided parameters: bucket_size"));
    assert!(message.contains("Missing parameters: refill_rate"));
}

#[test]
fn non_positive_parameters_are_rejected() {
    let err = assert_err!(settings(
        "algorithm: leaky-bucket\ncapacity: 0\nleak_rate: 1\nbackend: { cache: local }\n"
    )
    .validate());
    assert!(matches!(err, ConfigError::InvalidParameter { ref name, .. } if name == "capacity"));
}

#[test]
fn backend_selection() {
    let missing = settings("algorithm: simple\nwindow: 1\nthreshold: 1\n").validate();
    assert_eq!(assert_err!(missing), ConfigError::MissingBackend);

    let invalid = settings(
        "algorithm: simple\nwindow: 1\nthreshold: 1\nbackend: { cache: memcached }\n",
    )
    .validate();
    assert!(matches!(assert_err!(invalid), ConfigError::InvalidBackend(_)));

    let unknown_alias = settings(
        "algorithm: simple\nwindow: 1\nthreshold: 1\nbackend: { cache: shared, cache_alias: edge }\n",
    )
    .validate();
    assert_eq!(
        assert_err!(unknown_alias),
        ConfigError::UnknownCacheAlias("edge".to_string())
    );

    let plan = assert_ok!(settings(
        r#"
algorithm: simple
window: 1
threshold: 1
backend: { cache: redis }
caches:
  default: { url: "redis://127.0.0.1/", key_prefix: "app:" }
"#
    )
    .validate());
    match &plan.policies[0].store {
        StoreSelection::Shared { alias, cache } => {
            assert_eq!(alias, "default");
            assert_eq!(cache.key_prefix.as_deref(), Some("app:"));
        }
        StoreSelection::Local => panic!("expected the shared tier"),
    }
}

#[test]
fn composite_needs_policies() {
    let result = settings("algorithm: composite\nbackend: { cache: local }\n").validate();
    assert_eq!(assert_err!(result), ConfigError::MissingPolicies);

    let result = settings(
        "algorithm: composite\nbackend: { cache: local }\npolicies:\n  a: { window: 1, threshold: 1 }\n",
    )
    .validate();
    assert_eq!(
        assert_err!(result),
        ConfigError::MissingPolicyAlgorithm("a".to_string())
    );
}

#[test]
fn invalid_policy_names() {
    let result = settings(
        "algorithm: composite\nbackend: { cache: local }\npolicies:\n  \"a:b\": { algorithm: simple, window: 1, threshold: 1 }\n",
    )
    .validate();
    assert_eq!(
        assert_err!(result),
        ConfigError::InvalidPolicyName("a:b".to_string())
    );

    let result = settings(
        "algorithm: simple\nname: \"\"\nwindow: 1\nthreshold: 1\nbackend: { cache: local }\n",
    )
    .validate();
    assert_eq!(assert_err!(result), ConfigError::InvalidPolicyName(String::new()));
}

#[test]
fn zero_ttl_is_rejected() {
    let result = settings(
        "algorithm: token-bucket\nbucket_size: 1\nrefill_rate: 1\nttl_secs: 0\nbackend: { cache: local }\n",
    )
    .validate();
    assert!(matches!(
        assert_err!(result),
        ConfigError::InvalidParameter { ref name, .. } if name == "ttl_secs"
    ));
}

#[test]
fn oversized_parameters_are_rejected() {
    let result = settings(
        "algorithm: fixed-window\nwindow: 1.0e20\nthreshold: 1\nbackend: { cache: local }\n",
    )
    .validate();
    assert!(matches!(
        assert_err!(result),
        ConfigError::InvalidParameter { ref name, .. } if name == "window"
    ));

    let result = settings(
        "algorithm: simple\nwindow: 1\nthreshold: 1\nttl_secs: 99999999999\nbackend: { cache: local }\n",
    )
    .validate();
    assert!(matches!(
        assert_err!(result),
        ConfigError::InvalidParameter { ref name, .. } if name == "ttl_secs"
    ));
}

#[tokio::test]
async fn build_fails_before_serving() {
    let no_key_builder =
        settings("algorithm: simple\nwindow: 1\nthreshold: 1\nbackend: { cache: local }\n");
    let err = assert_err!(GateBuilder::new(no_key_builder).build().await);
    assert!(matches!(
        err,
        FloodgateError::Config(ConfigError::MissingKeyBuilder)
    ));

    let composite = settings(
        "algorithm: composite\nkey_builder: { kind: ip }\nbackend: { cache: local }\npolicies:\n  a: { algorithm: simple, window: 1, threshold: 1 }\n",
    );
    let err = assert_err!(GateBuilder::new(composite).build().await);
    assert!(matches!(err, FloodgateError::Config(ConfigError::MissingResolver)));

    let schema = settings(
        "algorithm: simple\nwindow: 1\nthreshold: 1\nkey_builder: { kind: schema, extractor: nope }\nbackend: { cache: local }\n",
    );
    let err = assert_err!(GateBuilder::new(schema).build().await);
    assert!(matches!(
        err,
        FloodgateError::Config(ConfigError::InvalidKeyBuilder(_))
    ));
}

#[tokio::test]
async fn programmatic_default_key_builder_satisfies_build() {
    let config =
        settings("algorithm: simple\nwindow: 1\nthreshold: 1\nbackend: { cache: local }\n");
    let gate = assert_ok!(
        GateBuilder::new(config)
            .key_builder(Arc::new(IpKeyBuilder))
            .build()
            .await
    );
    assert_eq!(gate.registry().names(), vec!["default"]);
}

#[test]
fn load_from_file() {
    let path = std::env::temp_dir().join(format!("floodgate-{}.yaml", uuid::Uuid::new_v4()));
    {
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "algorithm: composite\nttl_secs: 90\nbackend:\n  cache: local\npolicies:\n  login:\n    algorithm: fixed-window\n    window: 30\n    threshold: 5\n    key_builder:\n      kind: ip-path\n"
        )
        .unwrap();
    }

    let loaded = Settings::load(&path);
    std::fs::remove_file(&path).unwrap();

    let plan = assert_ok!(assert_ok!(loaded).validate());
    assert_eq!(plan.mode, PlanMode::Composite);
    assert_eq!(plan.policies[0].name, "login");
    assert_eq!(plan.policies[0].ttl.as_secs(), 90);
    assert_eq!(plan.policies[0].key_builder, Some(KeyBuilderSettings::IpPath));
}

#[test]
fn load_from_file_keeps_key_case() {
    let path = std::env::temp_dir().join(format!("floodgate-{}.yaml", uuid::Uuid::new_v4()));
    std::fs::write(
        &path,
        r#"
algorithm: composite
backend:
  cache: shared
  cache_alias: Primary
caches:
  Primary:
    url: "redis://127.0.0.1/"
policies:
  Login:
    algorithm: fixed-window
    window: 30
    threshold: 5
"#,
    )
    .unwrap();

    let loaded = Settings::load(&path);
    std::fs::remove_file(&path).unwrap();

    let settings = assert_ok!(loaded);
    let names: Vec<_> = settings.policies.as_ref().unwrap().keys().collect();
    assert_eq!(names, vec!["Login"]);
    let plan = assert_ok!(settings.validate());
    assert_eq!(plan.policies[0].name, "Login");
    match &plan.policies[0].store {
        StoreSelection::Shared { alias, .. } => assert_eq!(alias, "Primary"),
        StoreSelection::Local => panic!("expected the shared tier"),
    }
}

#[test]
fn load_missing_file_is_a_load_error() {
    let result = Settings::load("/nonexistent/floodgate.yaml");
    assert!(matches!(assert_err!(result), ConfigError::Load(_)));
}
