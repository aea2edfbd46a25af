//! End-to-end lifecycle tests: a collaborator service registering checks,
//! guarding calls and consulting flags through the orchestrator facade.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use verigate_core::config::PlatformConfig;
use verigate_core::errors::GuardError;
use verigate_core::health::{FnProbe, HealthCheck, HealthProbe, HealthStatus, ProbeError};
use verigate_core::orchestrator::{ManualTrigger, Orchestrator};
use verigate_core::{BreakerState, SystemState};

fn local_config(db_port: u16) -> PlatformConfig {
    let mut config = PlatformConfig::default();
    config.database.host = "127.0.0.1".to_string();
    config.database.port = db_port;
    config.cache.host = "127.0.0.1".to_string();
    config.cache.port = db_port;
    config.monitoring.interval = Duration::from_millis(50);
    config.retry.base_delay = Duration::from_millis(1);
    config.retry.max_delay = Duration::from_millis(4);
    config
}

struct AlwaysReady;

#[async_trait]
impl HealthProbe for AlwaysReady {
    async fn check(&self) -> Result<HealthCheck, ProbeError> {
        Ok(HealthCheck::new(
            "gate-engine-ready",
            HealthStatus::Healthy,
            "all gate modules loaded",
        ))
    }
}

#[tokio::test]
async fn full_lifecycle_with_reachable_backends() {
    // A local listener stands in for both backing services.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let orchestrator = Orchestrator::from_config(local_config(port));
    orchestrator
        .health()
        .register_check("gate-engine-ready", Arc::new(AlwaysReady));

    let state = orchestrator.startup().await.unwrap();
    // Connectivity is healthy; resource pressure on the host may degrade.
    assert!(matches!(
        state,
        SystemState::Running | SystemState::Degraded
    ));

    let full = orchestrator.get_full_status().await;
    let names: Vec<&str> = full.health.checks.iter().map(|c| c.name.as_str()).collect();
    for expected in ["database", "cache", "cpu", "memory", "disk", "gate-engine-ready"] {
        assert!(names.contains(&expected), "missing check {expected}");
    }
    let db_check = full
        .health
        .checks
        .iter()
        .find(|c| c.name == "database")
        .unwrap();
    assert_eq!(db_check.status, HealthStatus::Healthy);

    orchestrator.shutdown().await.unwrap();
    assert_eq!(orchestrator.state(), SystemState::Stopped);
}

#[tokio::test]
async fn guarded_calls_surface_in_status() {
    let orchestrator = Orchestrator::from_config(PlatformConfig::default());
    orchestrator.startup().await.unwrap();
    let errors = orchestrator.errors();

    // Five failures open the default breaker.
    for _ in 0..5 {
        let result: Result<(), _> = errors
            .with_circuit_breaker("pattern-store", || async {
                Err::<(), _>("connection refused".to_string())
            })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(
        errors.breaker_state("pattern-store"),
        Some(BreakerState::Open)
    );
    let blocked: Result<(), _> = errors
        .with_circuit_breaker("pattern-store", || async { Ok::<(), String>(()) })
        .await;
    assert!(matches!(blocked, Err(GuardError::CircuitOpen { .. })));

    // Failures are externally visible through the facade, never silent.
    let status = orchestrator.get_status();
    assert_eq!(status.errors.breakers["pattern-store"].state, BreakerState::Open);
    assert!(status.errors.by_kind["service_call_failed"] >= 5);
    assert!(status.telemetry.counters["errors.recorded"] >= 5.0);

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn flags_consulted_through_facade_handle() {
    let orchestrator = Orchestrator::from_config(PlatformConfig::default());
    orchestrator.startup().await.unwrap();
    let flags = orchestrator.flags();

    // Default catalogue is present after startup.
    assert!(flags.is_enabled("enable_caching", None, None, false));
    assert!(!flags.is_enabled("tax_evasion_gates", None, Some("pilot-firms"), true));

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn monitoring_loop_keeps_history_while_running() {
    let orchestrator = Orchestrator::from_config({
        let mut config = PlatformConfig::default();
        config.monitoring.interval = Duration::from_millis(20);
        config
    });
    orchestrator
        .health()
        .register_check(
            "fast",
            Arc::new(FnProbe(|| {
                Ok(HealthCheck::new("fast", HealthStatus::Healthy, ""))
            })),
        );
    orchestrator.startup().await.unwrap();

    // Passes take a while: the CPU probe samples twice per pass.
    tokio::time::sleep(Duration::from_millis(800)).await;
    let history_len = orchestrator.health().history().len();
    assert!(history_len >= 2, "loop should have produced passes");

    orchestrator.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(orchestrator.health().history().len(), history_len);
}

#[tokio::test]
async fn trigger_driven_shutdown_releases_waiters() {
    let orchestrator = Arc::new(Orchestrator::from_config(PlatformConfig::default()));
    orchestrator.startup().await.unwrap();

    let trigger = Arc::new(ManualTrigger::new());
    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        let trigger = Arc::clone(&trigger);
        tokio::spawn(async move { orchestrator.run_until_triggered(trigger.as_ref()).await })
    };
    let waiter = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.wait_until_stopped().await })
    };

    trigger.trigger();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(orchestrator.state(), SystemState::Stopped);
}
