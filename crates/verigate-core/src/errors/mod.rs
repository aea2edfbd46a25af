//! Uniform error recording, circuit-breaker protected execution, retry and
//! rate-based alerting.
//!
//! Guarded operations return explicit results; the handler pattern-matches
//! on a stable [`ErrorKind`] to dispatch registered recovery by strategy.
//! Every recorded failure lands in a bounded event ring, feeds per-kind
//! windowed counters, and above a rate threshold fans out to registered
//! alert handlers with a per-kind cooldown.

mod breaker;
mod retry;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{BreakerConfig, RetryConfig};
use crate::telemetry::Telemetry;

pub use self::breaker::{BreakerState, CircuitBreaker};
pub use self::retry::{retry, RetryExhausted, RetryPolicy};

/// Events retained in the error ring.
const MAX_EVENTS: usize = 1_000;

/// Trailing window for error-rate alerting.
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Minimum spacing between alerts for one error kind.
const ALERT_COOLDOWN: Duration = Duration::from_secs(300);

/// Windowed error count that triggers an alert for critical severity.
const CRITICAL_ALERT_THRESHOLD: usize = 5;

/// Windowed error count that triggers an alert for other severities.
const DEFAULT_ALERT_THRESHOLD: usize = 10;

/// Error severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Routine, self-correcting.
    Low,
    /// Worth tracking.
    Medium,
    /// Degrades service.
    High,
    /// Requires intervention.
    Critical,
}

impl ErrorSeverity {
    /// Lowercase label for tags and stats keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Stable identifier for one class of error.
///
/// Recovery handlers are registered against kinds, not matched against
/// free-form message strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorKind(String);

impl ErrorKind {
    /// Create a kind from a stable identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ErrorKind {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ErrorKind {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// How a registered handler recovers from an error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Re-invoke the handler with exponential backoff.
    Retry,
    /// Call the per-service fallback instead.
    Fallback,
    /// Leave it to the circuit breaker; handler runs once.
    CircuitBreak,
    /// Deliberate no-op.
    Ignore,
    /// Surface through the handler once.
    Alert,
}

/// One recorded error, immutable once it enters the ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Error kind.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Severity.
    pub severity: ErrorSeverity,
    /// When the error was recorded.
    pub timestamp: DateTime<Utc>,
    /// Caller-supplied context. A `service` entry routes `Fallback`
    /// recovery.
    pub context: BTreeMap<String, String>,
    /// Captured backtrace for high/critical severities.
    pub backtrace: Option<String>,
    /// Whether recovery was dispatched.
    pub recovery_attempted: bool,
    /// Whether dispatched recovery succeeded.
    pub recovery_successful: bool,
    /// Strategy used for the dispatch.
    pub recovery_strategy: Option<RecoveryStrategy>,
}

/// A recovery or fallback attempt failed.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct RecoveryFailure(pub String);

/// Recovery logic registered for an error kind.
#[async_trait]
pub trait RecoveryAction: Send + Sync {
    /// Attempt recovery for one recorded event.
    async fn attempt(&self, event: &ErrorEvent) -> Result<(), RecoveryFailure>;
}

/// Fallback logic registered per service name.
#[async_trait]
pub trait FallbackAction: Send + Sync {
    /// Run the degraded substitute for the failing service.
    async fn run(&self, event: &ErrorEvent) -> Result<(), RecoveryFailure>;
}

/// Alert raised when one error kind exceeds its rate threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorAlert {
    /// Error kind over threshold.
    pub kind: ErrorKind,
    /// Severity of the triggering event.
    pub severity: ErrorSeverity,
    /// Events of this kind in the trailing window.
    pub count_last_minute: usize,
    /// Message of the triggering event.
    pub message: String,
    /// When the alert was raised.
    pub timestamp: DateTime<Utc>,
}

/// Sink for rate alerts.
#[async_trait]
pub trait AlertHandler: Send + Sync {
    /// Deliver one alert. Failures are logged, never propagated.
    async fn notify(&self, alert: &ErrorAlert) -> Result<(), RecoveryFailure>;
}

/// Failure surfaced by circuit-breaker guarded execution.
#[derive(Debug, Error)]
pub enum GuardError {
    /// The breaker is open and no fallback is configured.
    #[error("service {service} unavailable: circuit breaker open")]
    CircuitOpen {
        /// Guarded service name.
        service: String,
    },

    /// The operation failed and no fallback is configured.
    #[error("service {service} call failed: {message}")]
    OperationFailed {
        /// Guarded service name.
        service: String,
        /// Rendered operation error.
        message: String,
    },
}

/// Breaker snapshot for stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: BreakerState,
    /// Current failure count.
    pub failures: u32,
}

/// Read-only error-handling snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorStats {
    /// Total errors recorded since start.
    pub total: u64,
    /// Cumulative counts by kind.
    pub by_kind: BTreeMap<String, u64>,
    /// Cumulative counts by severity.
    pub by_severity: BTreeMap<String, u64>,
    /// Per-service breaker snapshots.
    pub breakers: BTreeMap<String, BreakerSnapshot>,
    /// Recovery dispatches since start.
    pub recovery_attempts: u64,
    /// Successful recovery dispatches since start.
    pub recovery_successes: u64,
    /// `recovery_successes / recovery_attempts`, zero when never attempted.
    pub recovery_success_rate: f64,
    /// Most recent events, oldest first.
    pub recent: Vec<ErrorEvent>,
}

#[derive(Default)]
struct Counters {
    total: u64,
    by_kind: HashMap<ErrorKind, u64>,
    by_severity: HashMap<ErrorSeverity, u64>,
    recovery_attempts: u64,
    recovery_successes: u64,
}

struct Registries {
    recovery: HashMap<ErrorKind, (Arc<dyn RecoveryAction>, RecoveryStrategy)>,
    fallbacks: HashMap<String, Arc<dyn FallbackAction>>,
    alert_handlers: Vec<Arc<dyn AlertHandler>>,
}

/// Error handler owning circuit breakers, recovery dispatch and alerting.
///
/// Shared as `Arc<ErrorHandler>`; all operations take `&self`.
pub struct ErrorHandler {
    breaker_config: BreakerConfig,
    retry_policy: RetryPolicy,
    telemetry: Option<Arc<Telemetry>>,
    events: Mutex<VecDeque<ErrorEvent>>,
    counters: Mutex<Counters>,
    rate_window: Mutex<HashMap<ErrorKind, VecDeque<Instant>>>,
    last_alert: Mutex<HashMap<ErrorKind, Instant>>,
    registries: Mutex<Registries>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl std::fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("breaker_config", &self.breaker_config)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ErrorHandler {
    /// Create a handler with the given breaker and retry tunables. With a
    /// telemetry handle, recorded errors and breaker rejections emit
    /// counters.
    #[must_use]
    pub fn new(
        breaker_config: BreakerConfig,
        retry_config: &RetryConfig,
        telemetry: Option<Arc<Telemetry>>,
    ) -> Self {
        Self {
            breaker_config,
            retry_policy: RetryPolicy::from(retry_config),
            telemetry,
            events: Mutex::new(VecDeque::new()),
            counters: Mutex::new(Counters::default()),
            rate_window: Mutex::new(HashMap::new()),
            last_alert: Mutex::new(HashMap::new()),
            registries: Mutex::new(Registries {
                recovery: HashMap::new(),
                fallbacks: HashMap::new(),
                alert_handlers: Vec::new(),
            }),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Register recovery for an error kind with its dispatch strategy.
    pub fn register_recovery(
        &self,
        kind: impl Into<ErrorKind>,
        handler: Arc<dyn RecoveryAction>,
        strategy: RecoveryStrategy,
    ) {
        lock(&self.registries)
            .recovery
            .insert(kind.into(), (handler, strategy));
    }

    /// Register a fallback for a service name.
    pub fn register_fallback(&self, service: impl Into<String>, handler: Arc<dyn FallbackAction>) {
        lock(&self.registries)
            .fallbacks
            .insert(service.into(), handler);
    }

    /// Register an alert sink.
    pub fn register_alert(&self, handler: Arc<dyn AlertHandler>) {
        lock(&self.registries).alert_handlers.push(handler);
    }

    /// Record one error and, if requested and registered, dispatch recovery.
    ///
    /// Returns the recorded event including recovery bookkeeping. Recording
    /// itself never fails.
    pub async fn handle_error(
        &self,
        kind: impl Into<ErrorKind>,
        message: impl Into<String>,
        context: BTreeMap<String, String>,
        severity: ErrorSeverity,
        attempt_recovery: bool,
    ) -> ErrorEvent {
        let kind = kind.into();
        let mut event = ErrorEvent {
            kind: kind.clone(),
            message: message.into(),
            severity,
            timestamp: Utc::now(),
            context,
            backtrace: matches!(severity, ErrorSeverity::High | ErrorSeverity::Critical)
                .then(|| std::backtrace::Backtrace::force_capture().to_string()),
            recovery_attempted: false,
            recovery_successful: false,
            recovery_strategy: None,
        };

        tracing::error!(
            kind = %event.kind,
            severity = severity.as_str(),
            "{}",
            event.message
        );

        let window_count = {
            let mut counters = lock(&self.counters);
            counters.total += 1;
            *counters.by_kind.entry(kind.clone()).or_insert(0) += 1;
            *counters.by_severity.entry(severity).or_insert(0) += 1;
            drop(counters);

            let mut window = lock(&self.rate_window);
            let stamps = window.entry(kind.clone()).or_default();
            let now = Instant::now();
            stamps.push_back(now);
            while stamps
                .front()
                .is_some_and(|&at| now.duration_since(at) > RATE_WINDOW)
            {
                stamps.pop_front();
            }
            stamps.len()
        };

        if let Some(telemetry) = &self.telemetry {
            let mut tags = BTreeMap::new();
            tags.insert("kind".to_string(), kind.to_string());
            tags.insert("severity".to_string(), severity.as_str().to_string());
            telemetry.increment("errors.recorded", 1.0, tags);
        }

        self.maybe_alert(&event, window_count).await;

        if attempt_recovery {
            let registered = lock(&self.registries).recovery.get(&kind).cloned();
            if let Some((handler, strategy)) = registered {
                event.recovery_attempted = true;
                event.recovery_strategy = Some(strategy);
                event.recovery_successful = self.dispatch_recovery(&event, &handler, strategy).await;

                let mut counters = lock(&self.counters);
                counters.recovery_attempts += 1;
                if event.recovery_successful {
                    counters.recovery_successes += 1;
                }
            }
        }

        let mut events = lock(&self.events);
        events.push_back(event.clone());
        while events.len() > MAX_EVENTS {
            events.pop_front();
        }
        drop(events);

        event
    }

    /// Dispatch one recovery attempt by strategy, returning success.
    async fn dispatch_recovery(
        &self,
        event: &ErrorEvent,
        handler: &Arc<dyn RecoveryAction>,
        strategy: RecoveryStrategy,
    ) -> bool {
        let outcome = match strategy {
            RecoveryStrategy::Ignore => Ok(()),
            RecoveryStrategy::Retry => retry(self.retry_policy, |_attempt| handler.attempt(event))
                .await
                .map_err(|err| RecoveryFailure(err.to_string())),
            RecoveryStrategy::Fallback => {
                let service = event.context.get("service").cloned();
                let fallback = service
                    .as_deref()
                    .and_then(|s| lock(&self.registries).fallbacks.get(s).cloned());
                match fallback {
                    Some(fallback) => fallback.run(event).await,
                    None => Err(RecoveryFailure(format!(
                        "no fallback registered for service {}",
                        service.as_deref().unwrap_or("<unset>")
                    ))),
                }
            },
            RecoveryStrategy::CircuitBreak | RecoveryStrategy::Alert => {
                handler.attempt(event).await
            },
        };

        match outcome {
            Ok(()) => {
                tracing::info!(kind = %event.kind, strategy = ?strategy, "recovery succeeded");
                true
            },
            Err(err) => {
                tracing::warn!(
                    kind = %event.kind,
                    strategy = ?strategy,
                    error = %err,
                    "recovery failed"
                );
                false
            },
        }
    }

    /// Fan out an alert when the windowed rate crosses the severity
    /// threshold, at most once per cooldown per kind.
    async fn maybe_alert(&self, event: &ErrorEvent, window_count: usize) {
        let threshold = if event.severity == ErrorSeverity::Critical {
            CRITICAL_ALERT_THRESHOLD
        } else {
            DEFAULT_ALERT_THRESHOLD
        };
        if window_count < threshold {
            return;
        }

        {
            let mut last_alert = lock(&self.last_alert);
            let now = Instant::now();
            if last_alert
                .get(&event.kind)
                .is_some_and(|&at| now.duration_since(at) < ALERT_COOLDOWN)
            {
                return;
            }
            last_alert.insert(event.kind.clone(), now);
        }

        let alert = ErrorAlert {
            kind: event.kind.clone(),
            severity: event.severity,
            count_last_minute: window_count,
            message: event.message.clone(),
            timestamp: Utc::now(),
        };
        tracing::warn!(
            kind = %alert.kind,
            count = alert.count_last_minute,
            "error rate threshold crossed, dispatching alert"
        );

        let handlers = lock(&self.registries).alert_handlers.clone();
        for handler in handlers {
            if let Err(err) = handler.notify(&alert).await {
                tracing::warn!(error = %err, "alert handler failed");
            }
        }
    }

    /// Run `operation` behind the service's circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::CircuitOpen`] while the breaker blocks calls
    /// and [`GuardError::OperationFailed`] when the operation fails.
    pub async fn with_circuit_breaker<T, E, Fut>(
        &self,
        service: &str,
        operation: impl FnOnce() -> Fut,
    ) -> Result<T, GuardError>
    where
        E: std::fmt::Display,
        Fut: Future<Output = Result<T, E>>,
    {
        self.guard(service, operation, None::<fn() -> std::future::Ready<T>>)
            .await
    }

    /// Run `operation` behind the service's circuit breaker, substituting
    /// `fallback` when the breaker blocks the call or the operation fails.
    ///
    /// # Errors
    ///
    /// Infallible in practice: every failure path runs the fallback.
    pub async fn with_circuit_breaker_or<T, E, Fut, FB, FutF>(
        &self,
        service: &str,
        operation: impl FnOnce() -> Fut,
        fallback: FB,
    ) -> Result<T, GuardError>
    where
        E: std::fmt::Display,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> FutF,
        FutF: Future<Output = T>,
    {
        self.guard(service, operation, Some(fallback)).await
    }

    async fn guard<T, E, Fut, FB, FutF>(
        &self,
        service: &str,
        operation: impl FnOnce() -> Fut,
        fallback: Option<FB>,
    ) -> Result<T, GuardError>
    where
        E: std::fmt::Display,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> FutF,
        FutF: Future<Output = T>,
    {
        let admitted = {
            let mut breakers = lock(&self.breakers);
            let breaker = breakers
                .entry(service.to_string())
                .or_insert_with(|| CircuitBreaker::new(service, &self.breaker_config));
            breaker.can_attempt()
        };

        if !admitted {
            if let Some(telemetry) = &self.telemetry {
                let mut tags = BTreeMap::new();
                tags.insert("service".to_string(), service.to_string());
                telemetry.increment("breaker.rejected", 1.0, tags);
            }
            return match fallback {
                Some(fallback) => Ok(fallback().await),
                None => Err(GuardError::CircuitOpen {
                    service: service.to_string(),
                }),
            };
        }

        match operation().await {
            Ok(value) => {
                if let Some(breaker) = lock(&self.breakers).get_mut(service) {
                    breaker.record_success();
                }
                Ok(value)
            },
            Err(err) => {
                if let Some(breaker) = lock(&self.breakers).get_mut(service) {
                    breaker.record_failure();
                }
                let mut context = BTreeMap::new();
                context.insert("service".to_string(), service.to_string());
                self.handle_error(
                    ErrorKind::new("service_call_failed"),
                    format!("{service} call failed: {err}"),
                    context,
                    ErrorSeverity::Medium,
                    false,
                )
                .await;

                match fallback {
                    Some(fallback) => Ok(fallback().await),
                    None => Err(GuardError::OperationFailed {
                        service: service.to_string(),
                        message: err.to_string(),
                    }),
                }
            },
        }
    }

    /// Current state of one service's breaker, if it exists yet.
    #[must_use]
    pub fn breaker_state(&self, service: &str) -> Option<BreakerState> {
        lock(&self.breakers).get(service).map(CircuitBreaker::state)
    }

    /// Manually reset one service's breaker.
    pub fn reset_breaker(&self, service: &str) {
        if let Some(breaker) = lock(&self.breakers).get_mut(service) {
            breaker.reset();
        }
    }

    /// Read-only snapshot of error-handling state.
    #[must_use]
    pub fn get_error_stats(&self) -> ErrorStats {
        let counters = lock(&self.counters);
        let by_kind = counters
            .by_kind
            .iter()
            .map(|(kind, count)| (kind.to_string(), *count))
            .collect();
        let by_severity = counters
            .by_severity
            .iter()
            .map(|(severity, count)| (severity.as_str().to_string(), *count))
            .collect();
        let rate = if counters.recovery_attempts == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                counters.recovery_successes as f64 / counters.recovery_attempts as f64
            }
        };
        let stats = ErrorStats {
            total: counters.total,
            by_kind,
            by_severity,
            breakers: lock(&self.breakers)
                .iter()
                .map(|(service, breaker)| {
                    (
                        service.clone(),
                        BreakerSnapshot {
                            state: breaker.state(),
                            failures: breaker.failures(),
                        },
                    )
                })
                .collect(),
            recovery_attempts: counters.recovery_attempts,
            recovery_successes: counters.recovery_successes,
            recovery_success_rate: rate,
            recent: lock(&self.events).iter().rev().take(10).rev().cloned().collect(),
        };
        drop(counters);
        stats
    }
}
