//! Health monitoring with self-healing.
//!
//! A registry of named probes runs on a fixed interval. Each pass produces
//! one immutable [`SystemHealth`] snapshot aggregated worst-of-all and
//! appended to a bounded history. Probe failures are converted to
//! [`HealthStatus::Unknown`] results, never propagated. Three consecutive
//! failing results for one check invoke its registered recovery handler
//! once and reset the failure counter regardless of the recovery outcome.

mod probes;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::telemetry::Telemetry;

pub use self::probes::{ResourceProbe, ResourceKind, TcpProbe};

/// Snapshots retained in the health history.
const MAX_HISTORY: usize = 100;

/// Consecutive failing results before recovery is invoked.
const RECOVERY_FAILURE_THRESHOLD: u32 = 3;

/// Health status of one check or of the whole system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Operating normally.
    Healthy,
    /// Operating with reduced capacity.
    Degraded,
    /// Not operating.
    Unhealthy,
    /// Status could not be determined.
    Unknown,
}

impl HealthStatus {
    /// Severity rank for worst-of-all aggregation.
    #[must_use]
    pub const fn severity(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Unknown => 1,
            Self::Degraded => 2,
            Self::Unhealthy => 3,
        }
    }

    /// The more severe of two statuses.
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

/// Immutable result of one probe execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Check name.
    pub name: String,
    /// Probe verdict.
    pub status: HealthStatus,
    /// Human-readable message.
    pub message: String,
    /// When the probe ran.
    pub timestamp: DateTime<Utc>,
    /// How long the probe took.
    pub response_time: Duration,
    /// Free-form metadata.
    pub metadata: BTreeMap<String, String>,
}

impl HealthCheck {
    /// Build a result with the given status and message.
    #[must_use]
    pub fn new(name: impl Into<String>, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            timestamp: Utc::now(),
            response_time: Duration::ZERO,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Aggregate of one monitoring pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    /// Worst-of-all status across the pass.
    pub status: HealthStatus,
    /// Individual results in registration order.
    pub checks: Vec<HealthCheck>,
    /// Process uptime at snapshot time.
    pub uptime: Duration,
    /// When the pass completed.
    pub timestamp: DateTime<Utc>,
}

/// A probe could not produce a verdict.
///
/// Converted by the monitor into an [`HealthStatus::Unknown`] result; never
/// surfaced to callers of `check_health`.
#[derive(Debug, Error)]
#[error("probe failed: {0}")]
pub struct ProbeError(pub String);

impl From<std::io::Error> for ProbeError {
    fn from(err: std::io::Error) -> Self {
        Self(err.to_string())
    }
}

/// A zero-argument health probe.
///
/// Probes own their timeouts; the monitor does not impose one.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Execute the probe and produce a verdict.
    async fn check(&self) -> Result<HealthCheck, ProbeError>;
}

/// Adapter registering a plain closure as a probe.
pub struct FnProbe<F>(pub F);

#[async_trait]
impl<F> HealthProbe for FnProbe<F>
where
    F: Fn() -> Result<HealthCheck, ProbeError> + Send + Sync,
{
    async fn check(&self) -> Result<HealthCheck, ProbeError> {
        (self.0)()
    }
}

/// Recovery failed.
#[derive(Debug, Error)]
#[error("recovery failed: {0}")]
pub struct RecoveryError(pub String);

/// Self-healing action attached to a check.
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    /// Attempt to bring the failing check back to health.
    async fn recover(&self, failing: &HealthCheck) -> Result<(), RecoveryError>;
}

#[derive(Default)]
struct Registry {
    // Registration order is execution order.
    checks: Vec<(String, Arc<dyn HealthProbe>)>,
    recovery: HashMap<String, Arc<dyn RecoveryHandler>>,
}

#[derive(Default)]
struct Tracking {
    history: VecDeque<SystemHealth>,
    consecutive_failures: HashMap<String, u32>,
}

/// Periodic health monitor.
///
/// Shared as `Arc<HealthMonitor>`; the monitoring loop runs as one tokio
/// task and the facade may run extra passes concurrently.
pub struct HealthMonitor {
    registry: Mutex<Registry>,
    tracking: Mutex<Tracking>,
    telemetry: Option<Arc<Telemetry>>,
    started_at: Instant,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    loop_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("monitoring", &self.is_monitoring())
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Create a monitor. With a telemetry handle, each pass emits metrics.
    #[must_use]
    pub fn new(telemetry: Option<Arc<Telemetry>>) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            tracking: Mutex::new(Tracking::default()),
            telemetry,
            started_at: Instant::now(),
            stop_tx: Mutex::new(None),
            loop_handle: Mutex::new(None),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tracking(&self) -> std::sync::MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a named probe. Re-registering a name replaces the probe and
    /// keeps its position.
    pub fn register_check(&self, name: impl Into<String>, probe: Arc<dyn HealthProbe>) {
        let name = name.into();
        let mut registry = self.registry();
        if let Some(slot) = registry.checks.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = probe;
        } else {
            registry.checks.push((name, probe));
        }
    }

    /// Attach a self-healing handler to a check name.
    pub fn register_recovery(&self, name: impl Into<String>, handler: Arc<dyn RecoveryHandler>) {
        self.registry().recovery.insert(name.into(), handler);
    }

    /// Execute every registered probe once and aggregate the results.
    ///
    /// Probe errors become `Unknown` results. The snapshot is appended to
    /// the bounded history.
    pub async fn check_health(&self) -> SystemHealth {
        let pass_start = Instant::now();
        let checks: Vec<(String, Arc<dyn HealthProbe>)> = self.registry().checks.clone();

        let mut results = Vec::with_capacity(checks.len());
        for (name, probe) in checks {
            let probe_start = Instant::now();
            let mut check = match probe.check().await {
                Ok(check) => check,
                Err(err) => {
                    tracing::warn!(check = %name, error = %err, "health probe failed");
                    HealthCheck::new(name.clone(), HealthStatus::Unknown, err.to_string())
                },
            };
            // The registered name is authoritative; failure tracking and
            // recovery dispatch key on it.
            check.name = name;
            check.response_time = probe_start.elapsed();
            results.push(check);
        }

        let status = results
            .iter()
            .fold(
                if results.is_empty() {
                    HealthStatus::Unknown
                } else {
                    HealthStatus::Healthy
                },
                |acc, check| acc.worst(check.status),
            );

        let snapshot = SystemHealth {
            status,
            checks: results,
            uptime: self.started_at.elapsed(),
            timestamp: Utc::now(),
        };

        self.track_failures(&snapshot).await;

        {
            let mut tracking = self.tracking();
            tracking.history.push_back(snapshot.clone());
            while tracking.history.len() > MAX_HISTORY {
                tracking.history.pop_front();
            }
        }

        self.emit_pass_metrics(&snapshot, pass_start.elapsed());
        snapshot
    }

    /// Update per-check failure streaks and fire recovery at the threshold.
    async fn track_failures(&self, snapshot: &SystemHealth) {
        for check in &snapshot.checks {
            let due_recovery = {
                let mut tracking = self.tracking();
                match check.status {
                    HealthStatus::Healthy => {
                        tracking.consecutive_failures.insert(check.name.clone(), 0);
                        false
                    },
                    HealthStatus::Degraded | HealthStatus::Unhealthy => {
                        let streak = tracking
                            .consecutive_failures
                            .entry(check.name.clone())
                            .or_insert(0);
                        *streak += 1;
                        if *streak >= RECOVERY_FAILURE_THRESHOLD {
                            // Reset before recovery runs; its outcome does
                            // not restart the streak.
                            *streak = 0;
                            true
                        } else {
                            false
                        }
                    },
                    // Unknown holds the streak: the probe produced no
                    // verdict either way.
                    HealthStatus::Unknown => false,
                }
            };

            if !due_recovery {
                continue;
            }
            let handler = self.registry().recovery.get(&check.name).cloned();
            let Some(handler) = handler else {
                tracing::warn!(
                    check = %check.name,
                    "check failing repeatedly with no recovery handler registered"
                );
                continue;
            };
            tracing::info!(check = %check.name, "invoking recovery handler");
            match handler.recover(check).await {
                Ok(()) => {
                    tracing::info!(check = %check.name, "recovery handler succeeded");
                },
                Err(err) => {
                    tracing::error!(check = %check.name, error = %err, "recovery handler failed");
                },
            }
        }
    }

    fn emit_pass_metrics(&self, snapshot: &SystemHealth, pass_duration: Duration) {
        let Some(telemetry) = &self.telemetry else {
            return;
        };
        telemetry.histogram(
            "health.pass.duration",
            pass_duration.as_secs_f64(),
            BTreeMap::new(),
        );
        telemetry.gauge(
            "health.overall.severity",
            f64::from(snapshot.status.severity()),
            BTreeMap::new(),
        );
        for check in &snapshot.checks {
            let mut tags = BTreeMap::new();
            tags.insert("check".to_string(), check.name.clone());
            tags.insert(
                "status".to_string(),
                format!("{:?}", check.status).to_lowercase(),
            );
            telemetry.increment("health.check.results", 1.0, tags);
        }
    }

    /// Launch the periodic monitoring loop.
    ///
    /// A second call while the loop runs is a no-op. The loop logs pass
    /// outcomes; one bad pass never terminates monitoring.
    pub fn start_monitoring(self: &Arc<Self>, interval: Duration) {
        let mut stop_slot = self.stop_tx.lock().unwrap_or_else(PoisonError::into_inner);
        if stop_slot.is_some() {
            tracing::debug!("monitoring loop already running");
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *stop_slot = Some(stop_tx);
        drop(stop_slot);

        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tracing::info!(interval = ?interval, "health monitoring started");
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    },
                    () = tokio::time::sleep(interval) => {
                        let snapshot = monitor.check_health().await;
                        tracing::debug!(status = ?snapshot.status, "health pass complete");
                    },
                }
            }
            tracing::info!("health monitoring stopped");
        });
        *self
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Stop the monitoring loop, cancelling its pending sleep, and wait for
    /// it to finish. Idempotent.
    pub async fn stop_monitoring(&self) {
        let stop_tx = self
            .stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(true);
        }
        let handle = self
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Whether the periodic loop is running.
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// The most recent snapshot, if any pass has run.
    #[must_use]
    pub fn last_health(&self) -> Option<SystemHealth> {
        self.tracking().history.back().cloned()
    }

    /// Full bounded history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<SystemHealth> {
        self.tracking().history.iter().cloned().collect()
    }
}
