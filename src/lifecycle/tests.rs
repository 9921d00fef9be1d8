// Tests for registration, ordering, failure handling, health and shutdown
use super::*;
use crate::config::LifecycleSettings;
use crate::error::ErrorCode;

use parking_lot::Mutex;
use serde_json::json;
use std::time::Duration;

type Journal = Arc<Mutex<Vec<String>>>;

/// Component that writes "<phase>:<name>" to a shared journal
fn recorded(name: &'static str, journal: &Journal) -> FunctionalLifecycle {
    let (init, start, stop) = (journal.clone(), journal.clone(), journal.clone());
    FunctionalLifecycle::new(name)
        .on_init(move |_ctx, _config| {
            let journal = init.clone();
            async move {
                journal.lock().push(format!("init:{}", name));
                Ok(())
            }
        })
        .on_start(move |_ctx| {
            let journal = start.clone();
            async move {
                journal.lock().push(format!("start:{}", name));
                Ok(())
            }
        })
        .on_stop(move |_ctx| {
            let journal = stop.clone();
            async move {
                journal.lock().push(format!("stop:{}", name));
                Ok(())
            }
        })
}

fn entries(journal: &Journal, phase: &str) -> Vec<String> {
    journal
        .lock()
        .iter()
        .filter_map(|entry| entry.strip_prefix(&format!("{}:", phase)).map(str::to_string))
        .collect()
}

#[tokio::test]
async fn test_dependency_order_start_and_stop() {
    let journal = Journal::default();
    let manager = LifecycleManager::default();
    let ctx = Context::background();

    manager
        .register_with_dependencies("app", Arc::new(recorded("app", &journal)), 3, ["cache", "db"])
        .unwrap();
    manager.register("db", Arc::new(recorded("db", &journal)), 1).unwrap();
    manager
        .register("cache", Arc::new(recorded("cache", &journal).depends_on(["db"])), 2)
        .unwrap();

    manager.init_all(&ctx).await.unwrap();
    manager.start_all(&ctx).await.unwrap();
    assert_eq!(entries(&journal, "init"), ["db", "cache", "app"]);
    assert_eq!(entries(&journal, "start"), ["db", "cache", "app"]);
    assert_eq!(manager.state_of("app").unwrap(), LifecycleState::Running);

    manager.stop_all(&ctx).await.unwrap();
    assert_eq!(entries(&journal, "stop"), ["app", "cache", "db"]);
    assert_eq!(manager.state_of("db").unwrap(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_dependencies_override_priority() {
    let manager = LifecycleManager::default();
    manager
        .register_with_dependencies("worker", Arc::new(FunctionalLifecycle::new("worker")), 0, ["store"])
        .unwrap();
    manager.register("store", Arc::new(FunctionalLifecycle::new("store")), 10).unwrap();
    manager.register("metrics", Arc::new(FunctionalLifecycle::new("metrics")), 5).unwrap();
    manager.register("audit", Arc::new(FunctionalLifecycle::new("audit")), 5).unwrap();
    // unregistered dependencies are ignored
    manager
        .register_with_dependencies("tracer", Arc::new(FunctionalLifecycle::new("tracer")), 1, ["collector"])
        .unwrap();

    assert_eq!(
        manager.start_order().unwrap(),
        ["tracer", "audit", "metrics", "store", "worker"]
    );
}

#[tokio::test]
async fn test_cycle_starts_nothing() {
    let journal = Journal::default();
    let manager = LifecycleManager::default();
    let ctx = Context::background();
    manager.register("solo", Arc::new(recorded("solo", &journal)), 0).unwrap();
    manager
        .register_with_dependencies("a", Arc::new(recorded("a", &journal)), 1, ["b"])
        .unwrap();
    manager
        .register_with_dependencies("b", Arc::new(recorded("b", &journal)), 2, ["a"])
        .unwrap();

    let err = manager.start_all(&ctx).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::DependencyCycle);
    assert_eq!(err.context_value("components"), Some(&json!(["a", "b"])));
    assert!(entries(&journal, "start").is_empty());
    assert_eq!(manager.state_of("solo").unwrap(), LifecycleState::Uninitialized);
}

#[tokio::test]
async fn test_registration_rules() {
    let manager = LifecycleManager::default();
    let ctx = Context::background();
    manager.register("db", Arc::new(FunctionalLifecycle::new("db")), 1).unwrap();

    let err = manager
        .register("db", Arc::new(FunctionalLifecycle::new("db")), 2)
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AlreadyExists);

    manager.init_all(&ctx).await.unwrap();
    manager.start_all(&ctx).await.unwrap();
    let err = manager.unregister("db").unwrap_err();
    assert_eq!(err.context_value("state"), Some(&json!("running")));

    manager.stop_all(&ctx).await.unwrap();
    manager.unregister("db").unwrap();
    assert!(manager.names().is_empty());
    assert_eq!(manager.unregister("db").unwrap_err().code, ErrorCode::NotFound);
    assert_eq!(manager.state_of("db").unwrap_err().code, ErrorCode::NotFound);
}

#[tokio::test]
async fn test_config_reaches_init() {
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let component = FunctionalLifecycle::new("store").on_init(move |_ctx, config| {
        let sink = sink.clone();
        async move {
            *sink.lock() = config;
            Ok(())
        }
    });

    let manager = LifecycleManager::default();
    manager
        .register_with_config("store", Arc::new(component), 0, json!({ "pool": 4 }))
        .unwrap();
    manager.init_all(&Context::background()).await.unwrap();
    assert_eq!(*seen.lock(), Some(json!({ "pool": 4 })));
}

fn failing_start(name: &'static str) -> FunctionalLifecycle {
    FunctionalLifecycle::new(name).on_start(|_ctx| async {
        Err(AgentError::new(ErrorCode::AgentExecution, "port in use"))
    })
}

#[tokio::test]
async fn test_start_failure_aborts_by_default() {
    let journal = Journal::default();
    let manager = LifecycleManager::default();
    let ctx = Context::background();
    manager.register("listener", Arc::new(failing_start("listener")), 1).unwrap();
    manager.register("worker", Arc::new(recorded("worker", &journal)), 2).unwrap();

    manager.init_all(&ctx).await.unwrap();
    let err = manager.start_all(&ctx).await.unwrap_err();
    assert_eq!(err.operation.as_deref(), Some("start"));
    assert_eq!(err.context_value("name"), Some(&json!("listener")));
    assert_eq!(manager.state_of("listener").unwrap(), LifecycleState::Failed);
    assert_eq!(manager.state_of("worker").unwrap(), LifecycleState::Initialized);
    assert!(entries(&journal, "start").is_empty());
}

#[tokio::test]
async fn test_continue_on_error_starts_the_rest() {
    let journal = Journal::default();
    let settings = LifecycleSettings {
        continue_on_error: true,
        ..LifecycleSettings::default()
    };
    let manager = LifecycleManager::new(settings);
    let ctx = Context::background();
    manager.register("listener", Arc::new(failing_start("listener")), 1).unwrap();
    manager.register("worker", Arc::new(recorded("worker", &journal)), 2).unwrap();

    manager.init_all(&ctx).await.unwrap();
    manager.start_all(&ctx).await.unwrap();
    assert_eq!(manager.state_of("listener").unwrap(), LifecycleState::Failed);
    assert_eq!(manager.state_of("worker").unwrap(), LifecycleState::Running);
}

#[tokio::test]
async fn test_panicking_init_is_contained() {
    let manager = LifecycleManager::default();
    let component = FunctionalLifecycle::new("cursed").on_init(|_ctx, config: Option<Value>| async move {
        if config.is_none() {
            panic!("store settings are required");
        }
        Ok(())
    });
    manager.register("cursed", Arc::new(component), 0).unwrap();

    let err = manager.init_all(&Context::background()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::AgentConfig);
    assert!(err.is(ErrorCode::Internal));
    assert_eq!(manager.state_of("cursed").unwrap(), LifecycleState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_start_receives_step_deadline() {
    let settings = LifecycleSettings {
        start_timeout_ms: 100,
        ..LifecycleSettings::default()
    };
    let manager = LifecycleManager::new(settings);
    let component = FunctionalLifecycle::new("slow").on_start(|ctx: Context| async move {
        tokio::select! {
            reason = ctx.done() => Err(AgentError::from(reason)),
            _ = tokio::time::sleep(Duration::from_secs(60)) => Ok(()),
        }
    });
    manager.register("slow", Arc::new(component), 0).unwrap();

    let ctx = Context::background();
    manager.init_all(&ctx).await.unwrap();
    let err = manager.start_all(&ctx).await.unwrap_err();
    assert!(err.is(ErrorCode::ContextTimeout));
}

#[tokio::test]
async fn test_health_check_all() {
    let manager = LifecycleManager::default();
    manager.register("fine", Arc::new(FunctionalLifecycle::new("fine")), 0).unwrap();
    manager
        .register(
            "slow_disk",
            Arc::new(FunctionalLifecycle::new("slow_disk").on_health(|_ctx| async {
                HealthStatus::degraded("disk latency high").with_detail("p99_ms", 840)
            })),
            1,
        )
        .unwrap();
    manager
        .register(
            "broken",
            Arc::new(FunctionalLifecycle::new("broken").on_health(|_ctx| async {
                let replicas: Vec<u32> = Vec::new();
                HealthStatus::healthy().with_detail("primary", replicas[0])
            })),
            2,
        )
        .unwrap();

    let report = manager.health_check_all(&Context::background()).await;
    assert_eq!(report.len(), 3);
    assert!(report["fine"].is_healthy());
    assert_eq!(report["fine"].component_name, "fine");
    assert_eq!(report["slow_disk"].state, HealthState::Degraded);
    assert_eq!(report["slow_disk"].details["p99_ms"], json!(840));

    let broken = &report["broken"];
    assert_eq!(broken.state, HealthState::Unhealthy);
    assert!(broken.message.contains("panicked"));
    assert!(broken.details.contains_key("stack_trace"));
    assert_eq!(broken.component_name, "broken");
}

#[tokio::test]
async fn test_health_check_all_stops_at_context_deadline() {
    let manager = LifecycleManager::default();
    manager.register("fine", Arc::new(FunctionalLifecycle::new("fine")), 0).unwrap();
    manager
        .register(
            "hung",
            Arc::new(FunctionalLifecycle::new("hung").on_health(|_ctx| async {
                std::future::pending::<()>().await;
                HealthStatus::healthy()
            })),
            1,
        )
        .unwrap();

    let ctx = Context::background().with_timeout(Duration::from_millis(50));
    let report = tokio::time::timeout(Duration::from_secs(2), manager.health_check_all(&ctx))
        .await
        .expect("health_check_all must return once the context ends");

    assert_eq!(report.len(), 2);
    assert!(report["fine"].is_healthy());
    let hung = &report["hung"];
    assert_eq!(hung.state, HealthState::Unhealthy);
    assert!(hung.message.contains("canceled"));
    assert_eq!(hung.component_name, "hung");
}

#[tokio::test]
async fn test_shutdown_signalling() {
    let manager = Arc::new(LifecycleManager::default());
    let signal = manager.shutdown_signal();
    assert!(!signal.is_cancelled());

    manager.signal_shutdown();
    manager.signal_shutdown();
    assert!(signal.is_cancelled());

    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.wait_for_shutdown(&Context::background()).await })
    };
    manager.stop_all(&Context::background()).await.unwrap();
    waiter.await.unwrap().unwrap();

    // already done: returns at once
    manager.wait_for_shutdown(&Context::background()).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_shutdown_honours_context() {
    let manager = LifecycleManager::default();
    let ctx = Context::background().with_timeout(Duration::from_millis(20));
    let err = manager.wait_for_shutdown(&ctx).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ContextTimeout);
}

#[test]
fn test_state_display_matches_serde() {
    for state in [LifecycleState::Uninitialized, LifecycleState::Running, LifecycleState::Failed] {
        assert_eq!(serde_json::to_value(state).unwrap(), json!(state.to_string()));
    }
}

#[test]
fn test_global_manager_is_shared() {
    assert!(std::ptr::eq(LifecycleManager::global(), LifecycleManager::global()));
}
