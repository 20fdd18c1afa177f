//! Error types for the health supervisor.
//!
//! Probe failures are not errors: they travel as `ProbeErrorKind` inside
//! `HealthCheckResult`. Only administrative misuse, restart escalation and
//! store trouble surface here.

use thiserror::Error;

use uws_state::StateError;

/// Result type alias for registry and controller operations.
pub type HealthResult<T> = Result<T, HealthError>;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("service not registered: {0}")]
    UnknownService(String),

    #[error("service already registered: {0}")]
    AlreadyRegistered(String),

    #[error("service {0} is not failed permanently")]
    NotFailedPermanently(String),

    #[error("restart of {service_id} failed: {reason}")]
    RestartInvocationFailed { service_id: String, reason: String },

    #[error("restart budget exhausted for {service_id} after {attempts} attempts")]
    RestartBudgetExhausted { service_id: String, attempts: u32 },

    #[error(transparent)]
    State(#[from] StateError),
}
