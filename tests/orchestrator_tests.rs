use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use taskmill::testutil::{errors_worker, noop_worker, primes_worker};
use taskmill::{
    AgentDefinition, CacheBackend, MemoryCache, MillConfig, MillError, MillEvent, Orchestrator,
    SessionOverrides, SessionStatus, worker_fn,
};

fn quiet_config() -> MillConfig {
    MillConfig {
        auto_install: false,
        allow_immediate: false,
        ..Default::default()
    }
}

async fn build(defs: Vec<AgentDefinition>) -> Orchestrator {
    let mut builder = Orchestrator::builder(quiet_config());
    for def in defs {
        builder = builder.agent(def);
    }
    let orchestrator = builder.build().await.unwrap();
    orchestrator.init().await.unwrap();
    orchestrator
}

#[tokio::test]
async fn test_primes_inline_168() {
    let orchestrator = build(vec![AgentDefinition::new("primes", primes_worker())]).await;

    let value = orchestrator
        .run("primes", Some(json!({"limit": 1000})))
        .await
        .unwrap();
    let primes = value.as_array().unwrap();
    assert_eq!(primes.len(), 168);
    assert_eq!(primes[0], json!(2));
    assert_eq!(primes[167], json!(997));

    orchestrator.destroy().await;
}

#[tokio::test]
async fn test_primes_session_mode() {
    let orchestrator = build(vec![AgentDefinition::new("primes", primes_worker())]).await;

    let session = orchestrator
        .run_session("primes", Some(json!({"limit": 1000})))
        .await
        .unwrap();
    assert!(!session.cache_key.is_empty());
    assert_eq!(session.status(), SessionStatus::Pending);

    let value = session.wait().await.unwrap();
    assert_eq!(value.as_array().unwrap().len(), 168);
    assert_eq!(session.status(), SessionStatus::Complete);
    assert!(session.result().is_some());

    orchestrator.destroy().await;
}

#[tokio::test]
async fn test_coalescing_invokes_worker_once() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let worker = worker_fn(move |_, _| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(json!("shared"))
        }
    });
    let orchestrator = build(vec![AgentDefinition::new("slow", worker)]).await;

    let mut handles = Vec::new();
    for _ in 0..5 {
        let this = orchestrator.clone();
        handles.push(tokio::spawn(async move {
            this.run("slow", Some(json!({"x": 1}))).await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), json!("shared"));
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    orchestrator.destroy().await;
}

#[tokio::test]
async fn test_coalesced_error_reaches_every_waiter() {
    let worker = worker_fn(|_, _| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Err("shared failure".to_string())
    });
    let orchestrator = build(vec![AgentDefinition::new("bad", worker)]).await;

    let a = orchestrator.clone();
    let b = orchestrator.clone();
    let (ra, rb) = tokio::join!(a.run("bad", None), b.run("bad", None));
    assert_eq!(ra.unwrap_err().to_string(), "shared failure");
    assert_eq!(rb.unwrap_err().to_string(), "shared failure");

    orchestrator.destroy().await;
}

#[tokio::test]
async fn test_get_then_cache_then_invalidate() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let worker = worker_fn(move |_, _| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(7))
        }
    });
    let orchestrator = build(vec![AgentDefinition::new("seven", worker)]).await;
    let settings = json!({"v": 1});

    assert_eq!(
        orchestrator
            .get("seven", Some(settings.clone()))
            .await
            .unwrap(),
        json!(7)
    );
    assert_eq!(
        orchestrator
            .get("seven", Some(settings.clone()))
            .await
            .unwrap(),
        json!(7)
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    orchestrator
        .invalidate("seven", Some(settings.clone()))
        .await
        .unwrap();
    assert_eq!(
        orchestrator.get("seven", Some(settings)).await.unwrap(),
        json!(7)
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 2);

    orchestrator.destroy().await;
}

#[tokio::test]
async fn test_get_lazy_returns_absence() {
    let orchestrator = build(vec![AgentDefinition::new("noop", noop_worker())]).await;

    assert_eq!(orchestrator.get_lazy("noop", None).await.unwrap(), None);

    orchestrator.run("noop", None).await.unwrap();
    assert_eq!(
        orchestrator.get_lazy("noop", None).await.unwrap(),
        Some(Value::Null)
    );

    orchestrator.destroy().await;
}

#[tokio::test]
async fn test_expiry_after_one_second() {
    let def = AgentDefinition::new("fleeting", worker_fn(|_, _| async { Ok(json!("gone soon")) }))
        .with_expires("1s");
    let orchestrator = build(vec![def]).await;

    orchestrator.run("fleeting", None).await.unwrap();
    assert!(orchestrator.get_lazy("fleeting", None).await.unwrap().is_some());
    assert!(orchestrator.get_size("fleeting", None).await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(orchestrator.get_lazy("fleeting", None).await.unwrap(), None);
    assert_eq!(orchestrator.get_size("fleeting", None).await.unwrap(), None);

    orchestrator.destroy().await;
}

#[tokio::test]
async fn test_session_lifecycle_statuses() {
    let slow = AgentDefinition::new("slow", worker_fn(|_, _| async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(json!([1, 2, 3]))
    }));
    let orchestrator = build(vec![slow]).await;

    let session = orchestrator.run_session("slow", None).await.unwrap();
    assert_eq!(session.status(), SessionStatus::Pending);

    // in-flight: getSession reports pending
    let view = orchestrator.get_session(&session.cache_key).await.unwrap();
    assert_eq!(view.status, SessionStatus::Pending);

    session.wait().await.unwrap();
    let view = orchestrator.get_session(&session.cache_key).await.unwrap();
    assert_eq!(view.status, SessionStatus::Complete);
    assert_eq!(view.result, Some(json!([1, 2, 3])));

    orchestrator.destroy().await;
}

#[tokio::test]
async fn test_session_error_status() {
    let orchestrator = build(vec![AgentDefinition::new("boom", errors_worker())]).await;

    let session = orchestrator
        .run_session("boom", Some(json!({"throw": true})))
        .await
        .unwrap();
    let outcome = session.wait().await;
    assert_eq!(outcome.unwrap_err(), "agent failed on request");
    assert_eq!(session.status(), SessionStatus::Error);
    assert!(session.error().is_some());

    orchestrator.destroy().await;
}

#[tokio::test]
async fn test_get_session_infers_from_cache() {
    let orchestrator = build(vec![AgentDefinition::new("noop", noop_worker())]).await;

    // unknown key: caller asserted a session existed, absence is an error
    let view = orchestrator.get_session("nothing-here").await.unwrap();
    assert_eq!(view.status, SessionStatus::Error);

    // a stored error envelope reads as error
    let cache = Arc::new(MemoryCache::default());
    let orchestrator2 = Orchestrator::builder(quiet_config())
        .cache(cache.clone())
        .agent(AgentDefinition::new("noop", noop_worker()))
        .build()
        .await
        .unwrap();
    orchestrator2.init().await.unwrap();
    cache
        .set("failed-run", json!({"error": "it broke"}), None)
        .await
        .unwrap();
    let view = orchestrator2.get_session("failed-run").await.unwrap();
    assert_eq!(view.status, SessionStatus::Error);
    assert_eq!(view.error.as_deref(), Some("it broke"));

    // any present non-error value reads as complete, objects included
    cache
        .set("good-run", json!({"error": "x", "data": 1}), None)
        .await
        .unwrap();
    let view = orchestrator2.get_session("good-run").await.unwrap();
    assert_eq!(view.status, SessionStatus::Complete);

    cache.set("scalar-run", json!(42), None).await.unwrap();
    let view = orchestrator2.get_session("scalar-run").await.unwrap();
    assert_eq!(view.status, SessionStatus::Complete);
    assert_eq!(view.result, Some(json!(42)));

    orchestrator.destroy().await;
    orchestrator2.destroy().await;
}

#[tokio::test]
async fn test_method_compatibility_fails_before_worker() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let worker = worker_fn(move |_, _| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(1))
        }
    });
    let def = AgentDefinition::new("super-only", worker).with_methods(["supervised"]);
    let orchestrator = Orchestrator::builder(quiet_config())
        .supervisor(Arc::new(taskmill::testutil::FakeSupervisor::new()))
        .agent(def)
        .build()
        .await
        .unwrap();
    orchestrator.init().await.unwrap();

    // "inline" is a registered runner, but not among this agent's methods
    let overrides = SessionOverrides {
        runner: Some("inline".into()),
        ..Default::default()
    };
    let err = orchestrator
        .run_with("super-only", None, overrides)
        .await
        .unwrap_err();
    assert!(matches!(err, MillError::MethodNotAllowed { .. }));
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    orchestrator.destroy().await;
}

#[tokio::test]
async fn test_unknown_agent_and_runner_rejected() {
    let orchestrator = build(vec![AgentDefinition::new("noop", noop_worker())]).await;

    let err = orchestrator.run("ghost", None).await.unwrap_err();
    assert!(matches!(err, MillError::AgentNotFound(_)));

    let overrides = SessionOverrides {
        runner: Some("warp".into()),
        ..Default::default()
    };
    let err = orchestrator
        .run_with("noop", None, overrides)
        .await
        .unwrap_err();
    assert!(matches!(err, MillError::UnknownRunner(_)));

    orchestrator.destroy().await;
}

#[tokio::test]
async fn test_no_return_agent_resolves_null_without_write() {
    let def = AgentDefinition::new("fire", worker_fn(|_, _| async { Ok(json!("ignored")) }))
        .without_return();
    let orchestrator = build(vec![def]).await;

    let value = orchestrator.run("fire", None).await.unwrap();
    assert_eq!(value, Value::Null);
    assert_eq!(orchestrator.get_lazy("fire", None).await.unwrap(), None);

    orchestrator.destroy().await;
}

#[tokio::test]
async fn test_list_reports_agents_and_cache_meta() {
    let timed = AgentDefinition::new("timed", noop_worker()).with_timing("*/5 * * * * *");
    let plain = AgentDefinition::new("plain", worker_fn(|_, _| async { Ok(json!("v")) }))
        .with_expires("1h");
    let orchestrator = build(vec![timed, plain]).await;

    orchestrator.run("plain", None).await.unwrap();

    let entries = orchestrator.list().await.unwrap();
    assert_eq!(entries.len(), 2);

    let plain = entries.iter().find(|e| e.id == "plain").unwrap();
    assert_eq!(plain.cache_key, "plain");
    assert_eq!(plain.expires.as_deref(), Some("1h"));
    let meta = plain.meta.as_ref().unwrap();
    assert!(meta.size > 0);
    assert!(meta.expires_at.is_some());

    let timed = entries.iter().find(|e| e.id == "timed").unwrap();
    assert_eq!(timed.timing_text.as_deref(), Some("every 5 seconds"));
    assert!(timed.meta.is_none());

    orchestrator.destroy().await;
}

#[tokio::test]
async fn test_refresh_warns_on_duplicates_and_has() {
    let orchestrator = Orchestrator::builder(quiet_config())
        .agent(AgentDefinition::new("dup", noop_worker()))
        .agent(AgentDefinition::new("dup", noop_worker()))
        .agent(AgentDefinition::new("solo", noop_worker()))
        .build()
        .await
        .unwrap();

    let mut events = orchestrator.subscribe();
    let ids = orchestrator.refresh().await.unwrap();
    assert_eq!(ids, vec!["dup".to_string(), "solo".to_string()]);

    assert!(orchestrator.has("dup"));
    assert!(orchestrator.has("solo"));
    assert!(!orchestrator.has("ghost"));

    let mut saw_warn = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, MillEvent::RefreshWarn { .. }) {
            saw_warn = true;
        }
    }
    assert!(saw_warn, "expected a refresh warning for the duplicate id");

    orchestrator.destroy().await;
}

#[tokio::test]
async fn test_init_emits_lifecycle_events() {
    let orchestrator = Orchestrator::builder(quiet_config())
        .agent(AgentDefinition::new("noop", noop_worker()))
        .build()
        .await
        .unwrap();
    let mut events = orchestrator.subscribe();

    orchestrator.init().await.unwrap();
    orchestrator.destroy().await;
    orchestrator.destroy().await; // idempotent

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind());
    }
    let position = |k: &str| {
        kinds
            .iter()
            .position(|x| *x == k)
            .unwrap_or_else(|| panic!("missing event '{k}' in {kinds:?}"))
    };
    assert!(position("init") < position("ready"));
    assert!(position("ready") < position("destroy"));
    assert!(position("destroy") < position("destroyed"));
    assert_eq!(kinds.iter().filter(|k| **k == "destroyed").count(), 1);
}

#[tokio::test]
async fn test_destroyed_orchestrator_rejects_new_work() {
    let orchestrator = build(vec![AgentDefinition::new("noop", noop_worker())]).await;
    orchestrator.destroy().await;

    let err = orchestrator.run("noop", None).await.unwrap_err();
    assert!(matches!(err, MillError::Destroyed));
    let err = orchestrator.get("noop", None).await.unwrap_err();
    assert!(matches!(err, MillError::Destroyed));
}

#[tokio::test]
async fn test_immediate_agent_runs_at_init() {
    let config = MillConfig {
        auto_install: false,
        allow_immediate: true,
        ..Default::default()
    };
    let def = AgentDefinition::new("eager", worker_fn(|_, _| async { Ok(json!("warm")) }))
        .with_immediate();
    let orchestrator = Orchestrator::builder(config)
        .agent(def)
        .build()
        .await
        .unwrap();
    orchestrator.init().await.unwrap();

    let mut warmed = false;
    for _ in 0..50 {
        if orchestrator.get_lazy("eager", None).await.unwrap().is_some() {
            warmed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(warmed, "immediate agent never populated the cache");

    orchestrator.destroy().await;
}

#[tokio::test]
async fn test_invalidate_during_flight_keeps_run() {
    let worker = worker_fn(|_, _| async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(json!("fresh"))
    });
    let orchestrator = build(vec![AgentDefinition::new("slow", worker)]).await;

    let session = orchestrator.run_session("slow", None).await.unwrap();
    orchestrator.invalidate("slow", None).await.unwrap();

    // the run's eventual write repopulates the cache
    session.wait().await.unwrap();
    assert_eq!(
        orchestrator.get_lazy("slow", None).await.unwrap(),
        Some(json!("fresh"))
    );

    orchestrator.destroy().await;
}
