//! Lifecycle orchestration and the external facade.
//!
//! The orchestrator composes telemetry, feature flags, health monitoring
//! and error handling, owns the system lifecycle state machine, and is the
//! single place platform failures become externally visible. Subsystems are
//! injected at construction; a process-wide instance, if wanted, is built
//! once at the entry point and passed down.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Notify};

use crate::config::PlatformConfig;
use crate::errors::{ErrorHandler, ErrorStats};
use crate::flags::{FeatureFlags, FlagStats, MemoryFlagStore};
use crate::health::{
    HealthCheck, HealthMonitor, HealthStatus, RecoveryError, RecoveryHandler, ResourceKind,
    ResourceProbe, SystemHealth, TcpProbe,
};
use crate::telemetry::{Telemetry, TelemetrySummary};

/// System lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    /// Not started.
    Stopped,
    /// Startup sequence in progress.
    Starting,
    /// Started with a healthy first pass.
    Running,
    /// Started, but health passes are finding problems.
    Degraded,
    /// Shutdown sequence in progress.
    Stopping,
    /// Unrecoverable startup failure.
    Error,
}

/// Orchestration errors.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Operation not valid in the current lifecycle state.
    #[error("invalid lifecycle transition: {operation} while {state:?}")]
    InvalidState {
        /// Requested operation.
        operation: &'static str,
        /// State at the time of the request.
        state: SystemState,
    },

    /// Configuration validation failed in a production environment.
    #[error("configuration invalid in production: {0}")]
    ConfigValidation(String),

    /// First health pass came back unhealthy in a production environment.
    #[error("startup aborted: system unhealthy ({0})")]
    UnhealthyStartup(String),
}

/// Source of the shutdown request: an OS signal handler, a service-manager
/// callback, or a test harness.
#[async_trait]
pub trait ShutdownTrigger: Send + Sync {
    /// Resolve when shutdown has been requested.
    async fn wait(&self);
}

/// [`Notify`]-backed trigger for embedding and tests.
#[derive(Debug, Default)]
pub struct ManualTrigger {
    notify: Notify,
}

impl ManualTrigger {
    /// Create an untriggered instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. A trigger fired before anyone waits is remembered
    /// and released to the next waiter.
    pub fn trigger(&self) {
        self.notify.notify_one();
    }
}

#[async_trait]
impl ShutdownTrigger for ManualTrigger {
    async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Custom work to run during the shutdown sequence.
#[async_trait]
pub trait ShutdownHook: Send + Sync {
    /// Hook label for logs.
    fn name(&self) -> &str;

    /// Run the hook. Failures are logged and do not abort shutdown.
    async fn run(&self);
}

/// Read-only composite status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Lifecycle state.
    pub state: SystemState,
    /// Seconds since startup completed, zero when stopped.
    pub uptime_secs: u64,
    /// Whether the periodic health loop is running.
    pub health_monitoring: bool,
    /// Telemetry roll-up.
    pub telemetry: TelemetrySummary,
    /// Error-handling snapshot.
    pub errors: ErrorStats,
    /// Feature-flag roll-up.
    pub flags: FlagStats,
    /// Most recent health snapshot, if any pass has run.
    pub last_health: Option<SystemHealth>,
}

/// [`SystemStatus`] plus a freshly executed health pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullSystemStatus {
    /// Composite status.
    #[serde(flatten)]
    pub status: SystemStatus,
    /// Result of the fresh pass.
    pub health: SystemHealth,
}

/// Result of an on-demand diagnostics run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    /// Lifecycle state.
    pub state: SystemState,
    /// Fresh health pass.
    pub health: SystemHealth,
    /// Current configuration problems.
    pub config_issues: Vec<String>,
    /// Error-handling snapshot.
    pub errors: ErrorStats,
}

/// Recovery handler that resets the failing service's circuit breaker so
/// guarded calls get a fresh chance once connectivity returns.
struct BreakerResetRecovery {
    errors: Arc<ErrorHandler>,
    service: String,
}

#[async_trait]
impl RecoveryHandler for BreakerResetRecovery {
    async fn recover(&self, failing: &HealthCheck) -> Result<(), RecoveryError> {
        tracing::info!(
            check = %failing.name,
            service = %self.service,
            "resetting circuit breaker after repeated check failures"
        );
        self.errors.reset_breaker(&self.service);
        Ok(())
    }
}

/// Lifecycle orchestrator and facade.
pub struct Orchestrator {
    config: Mutex<PlatformConfig>,
    telemetry: Arc<Telemetry>,
    flags: Arc<FeatureFlags>,
    health: Arc<HealthMonitor>,
    errors: Arc<ErrorHandler>,
    state: Mutex<SystemState>,
    started_at: Mutex<Option<Instant>>,
    hooks: Mutex<Vec<Arc<dyn ShutdownHook>>>,
    stopped_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Orchestrator {
    /// Compose an orchestrator from explicitly constructed subsystems.
    #[must_use]
    pub fn new(
        config: PlatformConfig,
        telemetry: Arc<Telemetry>,
        flags: Arc<FeatureFlags>,
        health: Arc<HealthMonitor>,
        errors: Arc<ErrorHandler>,
    ) -> Self {
        let (stopped_tx, _) = watch::channel(false);
        Self {
            config: Mutex::new(config),
            telemetry,
            flags,
            health,
            errors,
            state: Mutex::new(SystemState::Stopped),
            started_at: Mutex::new(None),
            hooks: Mutex::new(Vec::new()),
            stopped_tx,
        }
    }

    /// Build the full default stack over an in-memory flag store.
    #[must_use]
    pub fn from_config(config: PlatformConfig) -> Self {
        let telemetry = Arc::new(Telemetry::new());
        let flags = Arc::new(FeatureFlags::new(Arc::new(MemoryFlagStore::new())));
        let health = Arc::new(HealthMonitor::new(Some(Arc::clone(&telemetry))));
        let errors = Arc::new(ErrorHandler::new(
            config.circuit_breaker.clone(),
            &config.retry,
            Some(Arc::clone(&telemetry)),
        ));
        Self::new(config, telemetry, flags, health, errors)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SystemState {
        *lock(&self.state)
    }

    /// Telemetry handle for collaborators.
    #[must_use]
    pub fn telemetry(&self) -> Arc<Telemetry> {
        Arc::clone(&self.telemetry)
    }

    /// Feature-flag handle for collaborators.
    #[must_use]
    pub fn flags(&self) -> Arc<FeatureFlags> {
        Arc::clone(&self.flags)
    }

    /// Health-monitor handle for collaborators registering checks.
    #[must_use]
    pub fn health(&self) -> Arc<HealthMonitor> {
        Arc::clone(&self.health)
    }

    /// Error-handler handle for collaborators.
    #[must_use]
    pub fn errors(&self) -> Arc<ErrorHandler> {
        Arc::clone(&self.errors)
    }

    /// Register a custom shutdown hook. Hooks run in reverse registration
    /// order during [`shutdown`](Self::shutdown).
    pub fn register_shutdown_hook(&self, hook: Arc<dyn ShutdownHook>) {
        lock(&self.hooks).push(hook);
    }

    /// Run the startup sequence.
    ///
    /// Validates configuration (fatal only in production), registers the
    /// default checks, recovery handlers and flags, starts the monitoring
    /// loop, runs one immediate health pass and settles the lifecycle state.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::InvalidState`] unless currently stopped;
    /// [`OrchestratorError::ConfigValidation`] or
    /// [`OrchestratorError::UnhealthyStartup`] in a production environment.
    pub async fn startup(&self) -> Result<SystemState, OrchestratorError> {
        {
            let mut state = lock(&self.state);
            if *state != SystemState::Stopped {
                return Err(OrchestratorError::InvalidState {
                    operation: "startup",
                    state: *state,
                });
            }
            *state = SystemState::Starting;
        }
        tracing::info!("platform startup initiated");

        let (config, issues) = {
            let config = lock(&self.config);
            (config.clone(), config.validate())
        };
        if !issues.is_empty() {
            if config.production {
                *lock(&self.state) = SystemState::Error;
                return Err(OrchestratorError::ConfigValidation(issues.join("; ")));
            }
            // Warning-only outside production; state settles on health.
            for issue in &issues {
                tracing::warn!(issue = %issue, "configuration problem");
            }
        }

        self.flags.register_defaults();
        self.register_default_checks(&config);

        self.health.start_monitoring(config.monitoring.interval);
        let first_pass = self.health.check_health().await;

        let next = match first_pass.status {
            HealthStatus::Healthy => SystemState::Running,
            HealthStatus::Unhealthy if config.production => {
                *lock(&self.state) = SystemState::Error;
                self.health.stop_monitoring().await;
                let failing: Vec<&str> = first_pass
                    .checks
                    .iter()
                    .filter(|c| c.status == HealthStatus::Unhealthy)
                    .map(|c| c.name.as_str())
                    .collect();
                return Err(OrchestratorError::UnhealthyStartup(failing.join(", ")));
            },
            // Degraded, unknown, and non-production unhealthy all start
            // degraded; the monitor keeps re-evaluating.
            _ => SystemState::Degraded,
        };

        *lock(&self.started_at) = Some(Instant::now());
        *lock(&self.state) = next;
        let _ = self.stopped_tx.send(false);
        self.telemetry
            .increment("orchestrator.startups", 1.0, BTreeMap::new());
        tracing::info!(state = ?next, "platform startup complete");
        Ok(next)
    }

    /// Register the out-of-the-box checks and recovery handlers.
    ///
    /// Connectivity checks are only registered for configured endpoints
    /// (a zero port means the service is not deployed alongside).
    fn register_default_checks(&self, config: &PlatformConfig) {
        for (name, endpoint) in [("database", &config.database), ("cache", &config.cache)] {
            if endpoint.port == 0 {
                continue;
            }
            self.health
                .register_check(name, Arc::new(TcpProbe::new(name, endpoint.address())));
            self.health.register_recovery(
                name,
                Arc::new(BreakerResetRecovery {
                    errors: Arc::clone(&self.errors),
                    service: name.to_string(),
                }),
            );
        }

        let monitoring = &config.monitoring;
        self.health.register_check(
            "cpu",
            Arc::new(ResourceProbe::new(
                ResourceKind::Cpu,
                monitoring.cpu_warning_pct,
                monitoring.cpu_critical_pct,
            )),
        );
        self.health.register_check(
            "memory",
            Arc::new(ResourceProbe::new(
                ResourceKind::Memory,
                monitoring.memory_warning_pct,
                monitoring.memory_critical_pct,
            )),
        );
        self.health.register_check(
            "disk",
            Arc::new(ResourceProbe::new(
                ResourceKind::Disk,
                monitoring.disk_warning_pct,
                monitoring.disk_critical_pct,
            )),
        );
    }

    /// Run the shutdown sequence: custom hooks in reverse registration
    /// order, stop the monitoring loop, flush final telemetry, release
    /// waiters.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::InvalidState`] unless currently running or
    /// degraded.
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        {
            let mut state = lock(&self.state);
            if !matches!(*state, SystemState::Running | SystemState::Degraded) {
                return Err(OrchestratorError::InvalidState {
                    operation: "shutdown",
                    state: *state,
                });
            }
            *state = SystemState::Stopping;
        }
        tracing::info!("platform shutdown initiated");

        let hooks: Vec<Arc<dyn ShutdownHook>> =
            lock(&self.hooks).iter().rev().cloned().collect();
        for hook in hooks {
            tracing::debug!(hook = hook.name(), "running shutdown hook");
            hook.run().await;
        }

        self.health.stop_monitoring().await;

        // Final telemetry flush: leave a closing record in the export.
        self.telemetry
            .increment("orchestrator.shutdowns", 1.0, BTreeMap::new());
        self.telemetry.gauge(
            "orchestrator.final_uptime_secs",
            self.uptime().as_secs_f64(),
            BTreeMap::new(),
        );
        let summary = self.telemetry.get_summary();
        tracing::info!(
            counters = summary.counters.len(),
            completed_spans = summary.completed_spans,
            "final telemetry summary flushed"
        );

        *lock(&self.started_at) = None;
        *lock(&self.state) = SystemState::Stopped;
        let _ = self.stopped_tx.send(true);
        tracing::info!("platform shutdown complete");
        Ok(())
    }

    /// Block until a shutdown has completed. Returns immediately if the
    /// system is already stopped.
    pub async fn wait_until_stopped(&self) {
        let mut rx = self.stopped_tx.subscribe();
        if *rx.borrow() || self.state() == SystemState::Stopped {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    /// Wait for `trigger`, then run the shutdown sequence.
    ///
    /// # Errors
    ///
    /// Propagates [`shutdown`](Self::shutdown) errors.
    pub async fn run_until_triggered(
        &self,
        trigger: &dyn ShutdownTrigger,
    ) -> Result<(), OrchestratorError> {
        trigger.wait().await;
        tracing::info!("shutdown trigger fired");
        self.shutdown().await
    }

    fn uptime(&self) -> Duration {
        lock(&self.started_at).map_or(Duration::ZERO, |at| at.elapsed())
    }

    /// Read-only composite status without running new checks.
    #[must_use]
    pub fn get_status(&self) -> SystemStatus {
        SystemStatus {
            state: self.state(),
            uptime_secs: self.uptime().as_secs(),
            health_monitoring: self.health.is_monitoring(),
            telemetry: self.telemetry.get_summary(),
            errors: self.errors.get_error_stats(),
            flags: self.flags.get_stats(),
            last_health: self.health.last_health(),
        }
    }

    /// Composite status plus a fresh health pass.
    pub async fn get_full_status(&self) -> FullSystemStatus {
        let health = self.health.check_health().await;
        FullSystemStatus {
            status: self.get_status(),
            health,
        }
    }

    /// On-demand diagnostics: fresh health pass, config validation, error
    /// snapshot.
    pub async fn run_diagnostics(&self) -> DiagnosticsReport {
        let health = self.health.check_health().await;
        let config_issues = lock(&self.config).validate();
        DiagnosticsReport {
            state: self.state(),
            health,
            config_issues,
            errors: self.errors.get_error_stats(),
        }
    }

    /// Replace the configuration.
    ///
    /// Breaker and monitor tunables apply to newly created breakers and the
    /// next monitoring start; endpoints re-register their default checks.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::ConfigValidation`] when the replacement fails
    /// validation in a production environment.
    pub fn reload_config(&self, new_config: PlatformConfig) -> Result<(), OrchestratorError> {
        let issues = new_config.validate();
        if !issues.is_empty() {
            if new_config.production {
                return Err(OrchestratorError::ConfigValidation(issues.join("; ")));
            }
            for issue in &issues {
                tracing::warn!(issue = %issue, "configuration problem in reloaded config");
            }
        }
        self.register_default_checks(&new_config);
        *lock(&self.config) = new_config;
        tracing::info!("configuration reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn test_config() -> PlatformConfig {
        // Zero endpoint ports: connectivity probes are skipped, the config
        // warnings keep startup non-fatal outside production.
        PlatformConfig::default()
    }

    #[tokio::test]
    async fn test_startup_from_stopped_only() {
        let orchestrator = Orchestrator::from_config(test_config());
        assert_eq!(orchestrator.state(), SystemState::Stopped);

        let state = orchestrator.startup().await.unwrap();
        assert!(matches!(
            state,
            SystemState::Running | SystemState::Degraded
        ));

        let err = orchestrator.startup().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState { .. }));

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_config_validation_fatal_in_production() {
        let mut config = test_config();
        config.production = true;
        // Unset ports fail validation; production makes that fatal.
        let orchestrator = Orchestrator::from_config(config);

        let err = orchestrator.startup().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ConfigValidation(_)));
        assert_eq!(orchestrator.state(), SystemState::Error);
    }

    #[tokio::test]
    async fn test_config_warnings_nonfatal_outside_production() {
        // Default config has unset ports; outside production that is only
        // a warning and startup still completes.
        let orchestrator = Orchestrator::from_config(test_config());
        let state = orchestrator.startup().await.unwrap();
        assert!(matches!(
            state,
            SystemState::Running | SystemState::Degraded
        ));
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_requires_started() {
        let orchestrator = Orchestrator::from_config(test_config());
        let err = orchestrator.shutdown().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState { .. }));
    }

    struct OrderedHook {
        label: u32,
        order: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl ShutdownHook for OrderedHook {
        fn name(&self) -> &str {
            "ordered"
        }

        async fn run(&self) {
            lock(&self.order).push(self.label);
        }
    }

    #[tokio::test]
    async fn test_shutdown_hooks_reverse_order() {
        let orchestrator = Orchestrator::from_config(test_config());
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in [1, 2, 3] {
            orchestrator.register_shutdown_hook(Arc::new(OrderedHook {
                label,
                order: Arc::clone(&order),
            }));
        }

        orchestrator.startup().await.unwrap();
        orchestrator.shutdown().await.unwrap();
        assert_eq!(*lock(&order), vec![3, 2, 1]);
        assert_eq!(orchestrator.state(), SystemState::Stopped);
        assert!(!orchestrator.health().is_monitoring());
    }

    #[tokio::test]
    async fn test_manual_trigger_unblocks_waiter() {
        let orchestrator = Arc::new(Orchestrator::from_config(test_config()));
        orchestrator.startup().await.unwrap();

        let trigger = Arc::new(ManualTrigger::new());
        let waiter = {
            let orchestrator = Arc::clone(&orchestrator);
            let trigger = Arc::clone(&trigger);
            tokio::spawn(async move {
                orchestrator
                    .run_until_triggered(trigger.as_ref())
                    .await
                    .unwrap();
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should be released")
            .unwrap();
        assert_eq!(orchestrator.state(), SystemState::Stopped);

        // wait_until_stopped returns immediately once stopped.
        tokio::time::timeout(Duration::from_millis(100), orchestrator.wait_until_stopped())
            .await
            .expect("already stopped");
    }

    #[tokio::test]
    async fn test_status_surfaces_subsystems() {
        let orchestrator = Orchestrator::from_config(test_config());
        orchestrator.startup().await.unwrap();

        let status = orchestrator.get_status();
        assert!(status.health_monitoring);
        assert!(status.flags.total >= 6);
        assert!(status.telemetry.counters.contains_key("orchestrator.startups"));
        assert!(status.last_health.is_some());

        let full = orchestrator.get_full_status().await;
        assert!(!full.health.checks.is_empty());

        orchestrator.shutdown().await.unwrap();
        let status = orchestrator.get_status();
        assert_eq!(status.state, SystemState::Stopped);
        assert!(!status.health_monitoring);
    }

    #[tokio::test]
    async fn test_diagnostics_reports_config_issues() {
        let orchestrator = Orchestrator::from_config(test_config());
        orchestrator.startup().await.unwrap();

        let report = orchestrator.run_diagnostics().await;
        assert!(report
            .config_issues
            .iter()
            .any(|issue| issue.contains("database.port")));
        assert!(!report.health.checks.is_empty());

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_config_validates() {
        let orchestrator = Orchestrator::from_config(test_config());

        let mut bad = test_config();
        bad.production = true;
        assert!(matches!(
            orchestrator.reload_config(bad),
            Err(OrchestratorError::ConfigValidation(_))
        ));

        let mut good = test_config();
        good.database.port = 5432;
        good.cache.port = 6379;
        orchestrator.reload_config(good).unwrap();
    }

    struct CountingHook {
        runs: AtomicU32,
    }

    #[async_trait]
    impl ShutdownHook for CountingHook {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_restart_cycle() {
        let orchestrator = Orchestrator::from_config(test_config());
        let hook = Arc::new(CountingHook {
            runs: AtomicU32::new(0),
        });
        orchestrator.register_shutdown_hook(Arc::clone(&hook) as Arc<dyn ShutdownHook>);

        orchestrator.startup().await.unwrap();
        orchestrator.shutdown().await.unwrap();
        orchestrator.startup().await.unwrap();
        orchestrator.shutdown().await.unwrap();
        assert_eq!(hook.runs.load(Ordering::SeqCst), 2);
    }
}
