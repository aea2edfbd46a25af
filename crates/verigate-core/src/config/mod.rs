//! Platform configuration parsing and validation.
//!
//! The control plane is configured from a TOML file (or environment, via the
//! CLI layer): backing-service endpoints, the production flag, and the
//! numeric tunables for circuit breakers, retry and health monitoring.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level platform configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlatformConfig {
    /// Whether this process runs in a production environment.
    ///
    /// Controls fatality of validation failures and of an unhealthy first
    /// health pass during startup.
    #[serde(default)]
    pub production: bool,

    /// Database connection parameters.
    #[serde(default)]
    pub database: EndpointConfig,

    /// Cache connection parameters.
    #[serde(default)]
    pub cache: EndpointConfig,

    /// Circuit-breaker tunables.
    #[serde(default)]
    pub circuit_breaker: BreakerConfig,

    /// Retry tunables.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Health-monitoring tunables.
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Connection parameters for one backing service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Host name or address.
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port.
    #[serde(default)]
    pub port: u16,
}

fn default_host() -> String {
    "localhost".to_string()
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
        }
    }
}

impl EndpointConfig {
    /// `host:port` address string for connecting.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Circuit-breaker tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Cool-down before an open breaker admits a trial call.
    #[serde(default = "default_breaker_timeout")]
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_breaker_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            timeout: default_breaker_timeout(),
        }
    }
}

/// Retry tunables for recovery dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts including the first call.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound on any single backoff delay.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}

const fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

/// Health-monitoring tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Interval between monitoring passes.
    #[serde(default = "default_monitor_interval")]
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// CPU usage percentage that degrades the CPU check.
    #[serde(default = "default_cpu_warning")]
    pub cpu_warning_pct: f32,

    /// CPU usage percentage that fails the CPU check.
    #[serde(default = "default_cpu_critical")]
    pub cpu_critical_pct: f32,

    /// Memory usage percentage that degrades the memory check.
    #[serde(default = "default_memory_warning")]
    pub memory_warning_pct: f32,

    /// Memory usage percentage that fails the memory check.
    #[serde(default = "default_memory_critical")]
    pub memory_critical_pct: f32,

    /// Disk usage percentage that degrades the disk check.
    #[serde(default = "default_disk_warning")]
    pub disk_warning_pct: f32,

    /// Disk usage percentage that fails the disk check.
    #[serde(default = "default_disk_critical")]
    pub disk_critical_pct: f32,
}

const fn default_monitor_interval() -> Duration {
    Duration::from_secs(30)
}

const fn default_cpu_warning() -> f32 {
    70.0
}

const fn default_cpu_critical() -> f32 {
    90.0
}

const fn default_memory_warning() -> f32 {
    70.0
}

const fn default_memory_critical() -> f32 {
    90.0
}

const fn default_disk_warning() -> f32 {
    80.0
}

const fn default_disk_critical() -> f32 {
    90.0
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            interval: default_monitor_interval(),
            cpu_warning_pct: default_cpu_warning(),
            cpu_critical_pct: default_cpu_critical(),
            memory_warning_pct: default_memory_warning(),
            memory_critical_pct: default_memory_critical(),
            disk_warning_pct: default_disk_warning(),
            disk_critical_pct: default_disk_critical(),
        }
    }
}

impl PlatformConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate the configuration, returning every problem found.
    ///
    /// Fatality is the caller's decision: the orchestrator treats a
    /// non-empty list as fatal only in a production environment.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.database.port == 0 {
            issues.push("database.port is not set".to_string());
        }
        if self.cache.port == 0 {
            issues.push("cache.port is not set".to_string());
        }
        if self.circuit_breaker.failure_threshold == 0 {
            issues.push("circuit_breaker.failure_threshold must be at least 1".to_string());
        }
        if self.retry.max_attempts == 0 {
            issues.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.base_delay > self.retry.max_delay {
            issues.push("retry.base_delay exceeds retry.max_delay".to_string());
        }
        if self.monitoring.interval < Duration::from_secs(1) {
            issues.push("monitoring.interval must be at least 1s".to_string());
        }
        for (name, warn, crit) in [
            (
                "cpu",
                self.monitoring.cpu_warning_pct,
                self.monitoring.cpu_critical_pct,
            ),
            (
                "memory",
                self.monitoring.memory_warning_pct,
                self.monitoring.memory_critical_pct,
            ),
            (
                "disk",
                self.monitoring.disk_warning_pct,
                self.monitoring.disk_critical_pct,
            ),
        ] {
            if !(0.0..=100.0).contains(&warn) || !(0.0..=100.0).contains(&crit) {
                issues.push(format!("monitoring.{name} thresholds must be within 0..=100"));
            } else if warn >= crit {
                issues.push(format!(
                    "monitoring.{name} warning threshold must be below the critical threshold"
                ));
            }
        }

        issues
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Failed to serialize to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation failed in a production environment.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

pub(crate) mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
