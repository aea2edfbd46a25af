//! verigate-core - resilience and observability control plane.
//!
//! The compliance scanner's gate-executing services depend on this crate
//! for liveness, safe degradation and operational visibility. It provides:
//!
//! - [`orchestrator`]: the lifecycle state machine and external facade;
//! - [`health`]: scheduled health checks with self-healing recovery;
//! - [`errors`]: circuit breakers, retry with backoff, rate alerting;
//! - [`flags`]: feature-flag definitions and rollout evaluation;
//! - [`telemetry`]: in-process metrics and tracing spans;
//! - [`config`]: TOML platform configuration.
//!
//! Subsystems are constructed explicitly and injected into the
//! [`orchestrator::Orchestrator`]; there are no process-wide singletons.
//! Collaborators register health probes, recovery handlers, fallbacks and
//! alert sinks through the narrow interfaces each module exposes, and never
//! reach into another component's state directly.

pub mod config;
pub mod errors;
pub mod flags;
pub mod health;
pub mod orchestrator;
pub mod telemetry;

pub use config::{ConfigError, PlatformConfig};
pub use errors::{
    BreakerState, CircuitBreaker, ErrorEvent, ErrorHandler, ErrorKind, ErrorSeverity, GuardError,
    RecoveryStrategy,
};
pub use flags::{FeatureFlag, FeatureFlags, FlagStore, MemoryFlagStore, RolloutStrategy};
pub use health::{HealthCheck, HealthMonitor, HealthStatus, SystemHealth};
pub use orchestrator::{Orchestrator, OrchestratorError, ShutdownTrigger, SystemState};
pub use telemetry::{MetricKind, Span, SpanStatus, Telemetry};
