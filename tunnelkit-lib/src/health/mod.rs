//! Upstream health reporting.
//!
//! Both external services expose a cheap probe (the panel's server status
//! endpoint, the payment provider's `getMe`); clients turn the probe into a
//! [`HealthCheckResult`] instead of an error so callers can log and carry on.

use serde::{Deserialize, Serialize};

/// Health status of an upstream service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Service is fully operational.
    Healthy,
    /// Service answers but reports a problem.
    Degraded,
    /// Service is currently unreachable or refusing requests.
    Unavailable,
    /// Health status is unknown (not yet checked).
    Unknown,
}

impl HealthStatus {
    /// Check if the service is usable.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// Check if the service is healthy.
    pub fn is_healthy(&self) -> bool {
        *self == Self::Healthy
    }
}

/// Health check result with details.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// The service checked ("panel", "cryptopay").
    pub service: String,
    /// Current status.
    pub status: HealthStatus,
    /// Unix timestamp of the check.
    pub checked_at: i64,
    /// Latency in milliseconds (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Error message if unhealthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Raw status payload returned by the service.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl HealthCheckResult {
    /// Create a healthy result.
    pub fn healthy(service: impl Into<String>) -> Self {
        Self::with_status(service, HealthStatus::Healthy, None)
    }

    /// Create an unhealthy result.
    pub fn unhealthy(service: impl Into<String>, error: impl Into<String>) -> Self {
        Self::with_status(service, HealthStatus::Unavailable, Some(error.into()))
    }

    /// Create a degraded result.
    pub fn degraded(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::with_status(service, HealthStatus::Degraded, Some(reason.into()))
    }

    fn with_status(service: impl Into<String>, status: HealthStatus, error: Option<String>) -> Self {
        Self {
            service: service.into(),
            status,
            checked_at: chrono::Utc::now().timestamp(),
            latency_ms: None,
            error,
            details: serde_json::Value::Null,
        }
    }

    /// Set latency.
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    /// Set details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_usable() {
        assert!(HealthStatus::Healthy.is_usable());
        assert!(HealthStatus::Degraded.is_usable());
        assert!(!HealthStatus::Unavailable.is_usable());
        assert!(!HealthStatus::Unknown.is_usable());
    }

    #[test]
    fn test_result_builders() {
        let result = HealthCheckResult::unhealthy("panel", "connection refused").with_latency(12);
        assert_eq!(result.status, HealthStatus::Unavailable);
        assert_eq!(result.latency_ms, Some(12));
        assert_eq!(result.error.as_deref(), Some("connection refused"));

        let json = serde_json::to_value(HealthCheckResult::healthy("cryptopay")).unwrap();
        assert!(json.get("details").is_none());
    }
}
