use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use taskmill::{AgentDefinition, MillConfig, MillEvent, Orchestrator, worker_fn};

#[tokio::test]
async fn test_timed_agent_fills_cache_within_two_windows() {
    let config = MillConfig {
        auto_install: true,
        allow_immediate: false,
        ..Default::default()
    };
    let def = AgentDefinition::new("timed", worker_fn(|_, _| async { Ok(json!([1, 2, 3])) }))
        .with_timing("*/2 * * * * *");
    let orchestrator = Orchestrator::builder(config)
        .agent(def)
        .build()
        .await
        .unwrap();

    let mut events = orchestrator.subscribe();
    orchestrator.init().await.unwrap();

    // nothing cached right after init
    assert_eq!(orchestrator.get_size("timed", None).await.unwrap(), None);

    // two scheduling windows
    let mut size = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        size = orchestrator.get_size("timed", None).await.unwrap();
        if size.is_some() {
            break;
        }
    }
    assert!(size.is_some_and(|s| s > 0), "timed agent never ran");

    let mut saw_scheduled = false;
    let mut saw_tick = false;
    while let Ok(event) = events.try_recv() {
        match event {
            MillEvent::Scheduled { agent_id } if agent_id == "timed" => saw_scheduled = true,
            MillEvent::Tick { agent_id } if agent_id == "timed" => saw_tick = true,
            _ => {}
        }
    }
    assert!(saw_scheduled);
    assert!(saw_tick);

    orchestrator.destroy().await;
}

#[tokio::test]
async fn test_failing_tick_does_not_stop_the_task() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let worker = worker_fn(move |_, _| {
        let counter = counter.clone();
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err("first firing fails".to_string())
            } else {
                Ok(json!(n))
            }
        }
    });
    let config = MillConfig {
        auto_install: true,
        allow_immediate: false,
        ..Default::default()
    };
    let def = AgentDefinition::new("flaky", worker).with_timing("* * * * * *");
    let orchestrator = Orchestrator::builder(config)
        .agent(def)
        .build()
        .await
        .unwrap();
    orchestrator.init().await.unwrap();

    for _ in 0..60 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if attempts.load(Ordering::SeqCst) >= 2 {
            break;
        }
    }
    assert!(
        attempts.load(Ordering::SeqCst) >= 2,
        "scheduler stopped after a failed firing"
    );

    orchestrator.destroy().await;
}

#[tokio::test]
async fn test_destroy_pauses_scheduler() {
    let firings = Arc::new(AtomicUsize::new(0));
    let counter = firings.clone();
    let worker = worker_fn(move |_, _| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!("tick"))
        }
    });
    let config = MillConfig {
        auto_install: true,
        allow_immediate: false,
        ..Default::default()
    };
    let def = AgentDefinition::new("steady", worker).with_timing("* * * * * *");
    let orchestrator = Orchestrator::builder(config)
        .agent(def)
        .build()
        .await
        .unwrap();
    orchestrator.init().await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    orchestrator.destroy().await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let frozen = firings.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(firings.load(Ordering::SeqCst), frozen);
}

#[tokio::test]
async fn test_auto_install_disabled_installs_nothing() {
    let config = MillConfig {
        auto_install: false,
        allow_immediate: false,
        ..Default::default()
    };
    let def = AgentDefinition::new("timed", worker_fn(|_, _| async { Ok(json!(1)) }))
        .with_timing("* * * * * *");
    let orchestrator = Orchestrator::builder(config)
        .agent(def)
        .build()
        .await
        .unwrap();
    orchestrator.init().await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(orchestrator.get_size("timed", None).await.unwrap(), None);

    orchestrator.destroy().await;
}
