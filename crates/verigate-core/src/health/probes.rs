//! Default probes: backing-service connectivity and local resource pressure.

use std::time::Duration;

use async_trait::async_trait;
use sysinfo::{Disks, System};

use super::{HealthCheck, HealthProbe, HealthStatus, ProbeError};

/// TCP connectivity probe for a backing service (database, cache).
///
/// Carries its own connect timeout; the monitor imposes none.
pub struct TcpProbe {
    name: String,
    address: String,
    timeout: Duration,
}

impl TcpProbe {
    /// Probe `address` under the given check name with a 5s timeout.
    #[must_use]
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Override the connect timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn check(&self) -> Result<HealthCheck, ProbeError> {
        let connect = tokio::net::TcpStream::connect(&self.address);
        let check = match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_stream)) => HealthCheck::new(
                &self.name,
                HealthStatus::Healthy,
                format!("connected to {}", self.address),
            ),
            Ok(Err(err)) => HealthCheck::new(
                &self.name,
                HealthStatus::Unhealthy,
                format!("connection to {} failed: {err}", self.address),
            ),
            Err(_elapsed) => HealthCheck::new(
                &self.name,
                HealthStatus::Unhealthy,
                format!(
                    "connection to {} timed out after {:?}",
                    self.address, self.timeout
                ),
            ),
        };
        Ok(check.with_metadata("address", &self.address))
    }
}

/// Which local resource a [`ResourceProbe`] samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Global CPU usage.
    Cpu,
    /// Physical memory usage.
    Memory,
    /// Worst-filled mounted disk.
    Disk,
}

impl ResourceKind {
    const fn label(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Disk => "disk",
        }
    }
}

/// Threshold-banded local resource pressure probe.
///
/// Usage below the warning threshold is healthy, between warning and
/// critical is degraded, at or above critical is unhealthy.
pub struct ResourceProbe {
    kind: ResourceKind,
    warning_pct: f32,
    critical_pct: f32,
}

impl ResourceProbe {
    /// Probe `kind` with the given warning/critical percentage bands.
    #[must_use]
    pub const fn new(kind: ResourceKind, warning_pct: f32, critical_pct: f32) -> Self {
        Self {
            kind,
            warning_pct,
            critical_pct,
        }
    }

    async fn sample(&self) -> Result<f32, ProbeError> {
        match self.kind {
            ResourceKind::Cpu => {
                let mut system = System::new();
                system.refresh_cpu_usage();
                // Two samples are needed for a meaningful usage figure.
                tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
                system.refresh_cpu_usage();
                Ok(system.global_cpu_info().cpu_usage())
            },
            ResourceKind::Memory => {
                let mut system = System::new();
                system.refresh_memory();
                let total = system.total_memory();
                if total == 0 {
                    return Err(ProbeError("total memory reported as zero".to_string()));
                }
                #[allow(clippy::cast_precision_loss)]
                Ok((system.used_memory() as f32 / total as f32) * 100.0)
            },
            ResourceKind::Disk => {
                let disks = Disks::new_with_refreshed_list();
                let mut worst: Option<f32> = None;
                for disk in disks.list() {
                    let total = disk.total_space();
                    if total == 0 {
                        continue;
                    }
                    let used = total - disk.available_space();
                    #[allow(clippy::cast_precision_loss)]
                    let pct = (used as f32 / total as f32) * 100.0;
                    worst = Some(worst.map_or(pct, |w| w.max(pct)));
                }
                worst.ok_or_else(|| ProbeError("no disks visible".to_string()))
            },
        }
    }
}

#[async_trait]
impl HealthProbe for ResourceProbe {
    async fn check(&self) -> Result<HealthCheck, ProbeError> {
        let usage = self.sample().await?;
        let label = self.kind.label();
        let status = if usage >= self.critical_pct {
            HealthStatus::Unhealthy
        } else if usage >= self.warning_pct {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        Ok(
            HealthCheck::new(label, status, format!("{label} usage {usage:.1}%"))
                .with_metadata("usage_pct", format!("{usage:.1}"))
                .with_metadata("warning_pct", format!("{:.1}", self.warning_pct))
                .with_metadata("critical_pct", format!("{:.1}", self.critical_pct)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_probe_reports_unreachable() {
        // Reserved TEST-NET-1 address; connect fails or times out quickly.
        let probe = TcpProbe::new("database", "192.0.2.1:5432")
            .with_timeout(Duration::from_millis(200));
        let check = probe.check().await.unwrap();
        assert_eq!(check.status, HealthStatus::Unhealthy);
        assert_eq!(check.name, "database");
        assert_eq!(check.metadata["address"], "192.0.2.1:5432");
    }

    #[tokio::test]
    async fn test_tcp_probe_connects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let probe = TcpProbe::new("cache", &address);
        let check = probe.check().await.unwrap();
        assert_eq!(check.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_memory_probe_bands() {
        // Real usage is always below an impossible warning band.
        let relaxed = ResourceProbe::new(ResourceKind::Memory, 100.0, 101.0);
        let check = relaxed.check().await.unwrap();
        assert_eq!(check.status, HealthStatus::Healthy);
        assert!(check.metadata.contains_key("usage_pct"));

        // And always at or above a zero critical band.
        let strict = ResourceProbe::new(ResourceKind::Memory, 0.0, 0.0);
        let check = strict.check().await.unwrap();
        assert_eq!(check.status, HealthStatus::Unhealthy);
    }
}
