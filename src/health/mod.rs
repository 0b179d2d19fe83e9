//! Service health reports.
//!
//! # Data Flow
//! ```text
//! ResilientHttpClient::health_check():
//!     GET {base_url}/health through the "{service}-health" breaker
//!     → ServiceHealth {status, response_time_ms, circuit_breakers}
//!
//! ServiceRegistry::health_check_all():
//!     Probe every client concurrently
//!     → RegistryHealth {overall_status, services}
//! ```
//!
//! # Design Decisions
//! - A probe never fails; the failure is the reported status
//! - Only a 200 counts as healthy, any other success is degraded
//! - The overall status is healthy only when every service is

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::resilience::circuit_breaker::CircuitBreakerSnapshot;
use crate::resilience::stats::epoch_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    /// The health breaker rejected the probe.
    CircuitOpen,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::CircuitOpen => "circuit_open",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of probing one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub service: String,
    pub base_url: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Snapshots of this service's breakers, keyed by breaker name.
    pub circuit_breakers: BTreeMap<String, CircuitBreakerSnapshot>,
    /// Epoch milliseconds.
    pub checked_at: u64,
}

/// Aggregate over every client in a service registry.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryHealth {
    pub overall_status: HealthStatus,
    pub services: BTreeMap<String, ServiceHealth>,
    pub total_services: usize,
    pub checked_at: u64,
}

impl RegistryHealth {
    pub fn from_reports(reports: impl IntoIterator<Item = ServiceHealth>) -> Self {
        let services: BTreeMap<String, ServiceHealth> = reports
            .into_iter()
            .map(|report| (report.service.clone(), report))
            .collect();

        let overall_status = if services.values().all(|s| s.status.is_healthy()) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        Self {
            overall_status,
            total_services: services.len(),
            services,
            checked_at: epoch_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(service: &str, status: HealthStatus) -> ServiceHealth {
        ServiceHealth {
            service: service.to_string(),
            base_url: format!("http://{}:8000", service),
            status,
            response_time_ms: None,
            error: None,
            circuit_breakers: BTreeMap::new(),
            checked_at: 0,
        }
    }

    #[test]
    fn test_overall_status_requires_every_service_healthy() {
        let all_good = RegistryHealth::from_reports(vec![
            report("mcp-server", HealthStatus::Healthy),
            report("airtable-gateway", HealthStatus::Healthy),
        ]);
        assert_eq!(all_good.overall_status, HealthStatus::Healthy);
        assert_eq!(all_good.total_services, 2);

        let one_open = RegistryHealth::from_reports(vec![
            report("mcp-server", HealthStatus::Healthy),
            report("llm-orchestrator", HealthStatus::CircuitOpen),
        ]);
        assert_eq!(one_open.overall_status, HealthStatus::Degraded);
    }

    #[test]
    fn test_empty_registry_is_healthy() {
        let health = RegistryHealth::from_reports(Vec::new());
        assert_eq!(health.overall_status, HealthStatus::Healthy);
        assert_eq!(health.total_services, 0);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_value(report("svc", HealthStatus::CircuitOpen)).unwrap();
        assert_eq!(json["status"], "circuit_open");
        assert!(json.get("response_time_ms").is_none());
    }
}
