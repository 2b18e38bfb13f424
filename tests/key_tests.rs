use std::sync::Arc;

use serde_json::json;
use taskmill::testutil::noop_worker;
use taskmill::{AgentDefinition, MillConfig, Orchestrator, derive_key};

#[test]
fn test_key_determinism_up_to_key_order() {
    let a = json!({"limit": 1000, "mode": {"fast": true, "threads": 4}});
    let b = json!({"mode": {"threads": 4, "fast": true}, "limit": 1000});
    assert_eq!(derive_key("primes", &a), derive_key("primes", &b));
}

#[test]
fn test_dollar_keys_never_hashed() {
    let base = derive_key("primes", &json!({"limit": 1000}));
    let hinted = derive_key("primes", &json!({"limit": 1000, "$trace": "abc"}));
    assert_eq!(base, hinted);

    // hints alone leave the bare id
    assert_eq!(derive_key("primes", &json!({"$trace": "abc"})), "primes");
}

#[test]
fn test_empty_settings_yield_bare_id() {
    assert_eq!(derive_key("primes", &json!({})), "primes");
    assert_eq!(derive_key("primes", &serde_json::Value::Null), "primes");
}

#[test]
fn test_distinct_settings_yield_distinct_keys() {
    let one = derive_key("primes", &json!({"limit": 1000}));
    let two = derive_key("primes", &json!({"limit": 2000}));
    assert_ne!(one, two);
    assert!(one.starts_with("primes-"));
}

#[tokio::test]
async fn test_key_rewrite_hook_applies() {
    let orchestrator = Orchestrator::builder(MillConfig::default())
        .agent(AgentDefinition::new("noop", noop_worker()))
        .key_rewrite(Arc::new(|key| format!("v2:{key}")))
        .build()
        .await
        .unwrap();
    orchestrator.init().await.unwrap();

    assert_eq!(orchestrator.derive_key("noop", None), "v2:noop");
    let derived = orchestrator.derive_key("noop", Some(&json!({"n": 1})));
    assert!(derived.starts_with("v2:noop-"));

    orchestrator.destroy().await;
}
