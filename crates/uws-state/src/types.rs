//! Domain types for the health supervisor.
//!
//! `ServiceDescriptor` is the mutable record the registry owns;
//! `ServiceStatus` is the immutable view handed to the status store and
//! the API. All types serialize to JSON.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique, stable identifier for a monitored service.
pub type ServiceId = String;

// ── State ─────────────────────────────────────────────────────────

/// Health state of a monitored service as decided by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Unknown,
    Healthy,
    Unhealthy,
    Restarting,
    /// Terminal until an operator resets the service.
    FailedPermanently,
}

impl ServiceState {
    pub const ALL: [ServiceState; 5] = [
        ServiceState::Unknown,
        ServiceState::Healthy,
        ServiceState::Unhealthy,
        ServiceState::Restarting,
        ServiceState::FailedPermanently,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Unknown => "unknown",
            ServiceState::Healthy => "healthy",
            ServiceState::Unhealthy => "unhealthy",
            ServiceState::Restarting => "restarting",
            ServiceState::FailedPermanently => "failed_permanently",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Probe result ──────────────────────────────────────────────────

/// Why a probe did not count as a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeErrorKind {
    /// No complete response within the probe timeout.
    Timeout,
    /// Connection refused, DNS failure, or the exchange broke mid-flight.
    ConnectionFailed,
    /// Unexpected status code or an unparseable body.
    MalformedResponse,
    /// The service answered and declared itself unhealthy.
    ReportedUnhealthy,
}

impl ProbeErrorKind {
    pub const ALL: [ProbeErrorKind; 4] = [
        ProbeErrorKind::Timeout,
        ProbeErrorKind::ConnectionFailed,
        ProbeErrorKind::MalformedResponse,
        ProbeErrorKind::ReportedUnhealthy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeErrorKind::Timeout => "timeout",
            ProbeErrorKind::ConnectionFailed => "connection_failed",
            ProbeErrorKind::MalformedResponse => "malformed_response",
            ProbeErrorKind::ReportedUnhealthy => "reported_unhealthy",
        }
    }
}

/// A scalar value in a service's `checks` map. Never interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Null,
}

/// Body of a `200 OK` reply from a service's `/health` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthBody {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// ISO-8601 timestamp as reported by the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub checks: BTreeMap<String, CheckValue>,
}

/// Outcome of one probe against one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub service_id: ServiceId,
    /// Unix timestamp (milliseconds) when the probe completed.
    pub observed_at: u64,
    /// Absent when no response arrived.
    pub http_status: Option<u16>,
    pub latency_ms: u64,
    pub body: Option<HealthBody>,
    /// Diagnostic text: the `detail` of a 503 reply or the transport error.
    pub detail: Option<String>,
    /// Absent on success.
    pub error_kind: Option<ProbeErrorKind>,
}

impl HealthCheckResult {
    pub fn is_success(&self) -> bool {
        self.error_kind.is_none()
    }

    /// Metric label for this outcome.
    pub fn outcome(&self) -> &'static str {
        self.error_kind.map_or("success", |kind| kind.as_str())
    }
}

// ── Descriptor ────────────────────────────────────────────────────

/// Per-service thresholds and restart policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthPolicy {
    /// Consecutive failures before `Healthy → Unhealthy`.
    pub failure_threshold: u32,
    /// Consecutive successes to recover from `Unhealthy` or `Restarting`.
    pub success_threshold: u32,
    /// Consecutive successes for the first `Unknown → Healthy`.
    pub initial_success_threshold: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Restart attempts allowed before the circuit opens.
    pub max_restart_attempts: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            initial_success_threshold: 1,
            backoff_base_ms: 5_000,
            backoff_max_ms: 300_000,
            max_restart_attempts: 5,
        }
    }
}

/// Static configuration plus mutable health state of a monitored service.
///
/// Only the registry mutates a descriptor; everybody else reads clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: ServiceId,
    pub name: String,
    pub health_url: String,
    pub poll_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub policy: HealthPolicy,
    pub current_state: ServiceState,
    /// Counters since the last transition.
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Attempts within the current backoff window.
    pub restart_attempts: u32,
    pub last_restart_at: Option<u64>,
    /// No restart notification fires before this instant (unix ms).
    pub backoff_until: Option<u64>,
    pub last_result: Option<HealthCheckResult>,
    /// A lifecycle `restart` call is outstanding.
    pub restart_in_flight: bool,
    /// An `Unhealthy` entry happened during backoff and still owes a
    /// restart notification.
    pub restart_deferred: bool,
}

impl ServiceDescriptor {
    pub fn new(
        id: impl Into<ServiceId>,
        name: impl Into<String>,
        health_url: impl Into<String>,
        poll_interval_ms: u64,
        probe_timeout_ms: u64,
        policy: HealthPolicy,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            health_url: health_url.into(),
            poll_interval_ms,
            probe_timeout_ms,
            policy,
            current_state: ServiceState::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            restart_attempts: 0,
            last_restart_at: None,
            backoff_until: None,
            last_result: None,
            restart_in_flight: false,
            restart_deferred: false,
        }
    }

    /// The externally visible snapshot of this descriptor.
    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            service_id: self.id.clone(),
            name: self.name.clone(),
            state: self.current_state,
            last_result: self.last_result.clone(),
            restart_attempts: self.restart_attempts,
            last_restart_at: self.last_restart_at,
            backoff_until: self.backoff_until,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
        }
    }
}

// ── Status ────────────────────────────────────────────────────────

/// Read-only view of one service, as stored and served to dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service_id: ServiceId,
    pub name: String,
    pub state: ServiceState,
    pub last_result: Option<HealthCheckResult>,
    pub restart_attempts: u32,
    pub last_restart_at: Option<u64>,
    pub backoff_until: Option<u64>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

impl ServiceStatus {
    /// Key in the status table.
    pub fn table_key(&self) -> &str {
        &self.service_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_body_accepts_minimal_reply() {
        let body: HealthBody = serde_json::from_str(r#"{"status":"healthy"}"#).unwrap();
        assert_eq!(body.status, "healthy");
        assert!(body.checks.is_empty());
        assert!(body.service.is_none());
    }

    #[test]
    fn health_body_parses_scalar_checks() {
        let body: HealthBody = serde_json::from_str(
            r#"{"status":"healthy","service":"queue","timestamp":"2024-05-01T10:00:00Z",
                "checks":{"depth":12,"ratio":0.5,"db":"ok","writable":true,"last_error":null}}"#,
        )
        .unwrap();
        assert_eq!(body.checks["depth"], CheckValue::Integer(12));
        assert_eq!(body.checks["ratio"], CheckValue::Float(0.5));
        assert_eq!(body.checks["db"], CheckValue::Text("ok".to_string()));
        assert_eq!(body.checks["writable"], CheckValue::Bool(true));
        assert_eq!(body.checks["last_error"], CheckValue::Null);
    }

    #[test]
    fn health_body_rejects_nested_checks() {
        let parsed: Result<HealthBody, _> =
            serde_json::from_str(r#"{"status":"healthy","checks":{"disk":{"free":1}}}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn outcome_labels() {
        let mut result = HealthCheckResult {
            service_id: "db".to_string(),
            observed_at: 0,
            http_status: Some(200),
            latency_ms: 3,
            body: None,
            detail: None,
            error_kind: None,
        };
        assert!(result.is_success());
        assert_eq!(result.outcome(), "success");

        result.error_kind = Some(ProbeErrorKind::ReportedUnhealthy);
        assert!(!result.is_success());
        assert_eq!(result.outcome(), "reported_unhealthy");
    }

    #[test]
    fn new_descriptor_starts_unknown() {
        let desc = ServiceDescriptor::new(
            "db",
            "Relational DB",
            "http://localhost:8001/health",
            30_000,
            5_000,
            HealthPolicy::default(),
        );
        assert_eq!(desc.current_state, ServiceState::Unknown);
        let status = desc.status();
        assert_eq!(status.table_key(), "db");
        assert_eq!(status.restart_attempts, 0);
        assert!(status.last_result.is_none());
    }

    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json::to_string(&ServiceState::FailedPermanently).unwrap();
        assert_eq!(json, "\"failed_permanently\"");
        assert_eq!(ServiceState::Restarting.to_string(), "restarting");
    }
}
