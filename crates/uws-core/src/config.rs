//! uws.toml configuration parser.
//!
//! The orchestrator reads one TOML file describing the probe worker pool,
//! default health policy, and every monitored service. Per-service keys
//! override `[defaults]`; everything is resolved into plain `Duration`s and
//! counters before the control loop sees it.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: String, value: String },

    #[error("{field} must be greater than zero ({scope})")]
    Zero { scope: String, field: String },

    #[error("service id must not be empty")]
    EmptyId,

    #[error("duplicate service id: {0}")]
    DuplicateService(String),

    #[error("service {id}: invalid health_url {url:?}: {reason}")]
    InvalidHealthUrl {
        id: String,
        url: String,
        reason: String,
    },

    #[error("service {id}: backoff_base exceeds backoff_max")]
    BackoffRange { id: String },

    #[error("no services configured")]
    NoServices,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub defaults: ServiceDefaults,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// Upper bound on simultaneous outbound probes.
    pub max_concurrent_probes: usize,
    pub restart_timeout: String,
    pub shutdown_grace: String,
    /// How long a probe may wait for a worker slot before the cycle is
    /// skipped. Defaults to the service's poll interval.
    pub pool_wait_timeout: Option<String>,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_concurrent_probes: 8,
            restart_timeout: "60s".to_string(),
            shutdown_grace: "10s".to_string(),
            pool_wait_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceDefaults {
    pub poll_interval: String,
    pub probe_timeout: String,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub initial_success_threshold: u32,
    pub backoff_base: String,
    pub backoff_max: String,
    pub max_restart_attempts: u32,
}

impl Default for ServiceDefaults {
    fn default() -> Self {
        Self {
            poll_interval: "30s".to_string(),
            probe_timeout: "5s".to_string(),
            failure_threshold: 3,
            success_threshold: 2,
            initial_success_threshold: 1,
            backoff_base: "5s".to_string(),
            backoff_max: "5m".to_string(),
            max_restart_attempts: 5,
        }
    }
}

/// One `[[services]]` entry. Every policy key is optional and falls back
/// to `[defaults]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub id: String,
    pub name: Option<String>,
    pub health_url: String,
    pub poll_interval: Option<String>,
    pub probe_timeout: Option<String>,
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub initial_success_threshold: Option<u32>,
    pub backoff_base: Option<String>,
    pub backoff_max: Option<String>,
    pub max_restart_attempts: Option<u32>,
    /// argv of the restart command; `{id}` is replaced by the service id.
    pub restart_command: Option<Vec<String>>,
}

/// Fully resolved settings for a monitored service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
    pub id: String,
    pub name: String,
    pub health_url: String,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub initial_success_threshold: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_restart_attempts: u32,
    pub restart_command: Option<Vec<String>>,
}

/// Resolved `[orchestrator]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOrchestrator {
    pub max_concurrent_probes: usize,
    pub restart_timeout: Duration,
    pub shutdown_grace: Duration,
    pub pool_wait_timeout: Option<Duration>,
}

impl OrchestratorConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Resolve the `[orchestrator]` section.
    pub fn orchestrator(&self) -> Result<ResolvedOrchestrator, ConfigError> {
        let section = &self.orchestrator;
        if section.max_concurrent_probes == 0 {
            return Err(ConfigError::Zero {
                scope: "orchestrator".to_string(),
                field: "max_concurrent_probes".to_string(),
            });
        }
        let pool_wait_timeout = match &section.pool_wait_timeout {
            Some(value) => Some(required_duration("pool_wait_timeout", value)?),
            None => None,
        };
        Ok(ResolvedOrchestrator {
            max_concurrent_probes: section.max_concurrent_probes,
            restart_timeout: required_duration("restart_timeout", &section.restart_timeout)?,
            shutdown_grace: required_duration("shutdown_grace", &section.shutdown_grace)?,
            pool_wait_timeout,
        })
    }

    /// Resolve every service against `[defaults]`, validating as we go.
    pub fn services(&self) -> Result<Vec<ResolvedService>, ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::NoServices);
        }

        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(self.services.len());
        for svc in &self.services {
            if svc.id.trim().is_empty() {
                return Err(ConfigError::EmptyId);
            }
            if !seen.insert(svc.id.clone()) {
                return Err(ConfigError::DuplicateService(svc.id.clone()));
            }
            resolved.push(self.resolve_service(svc)?);
        }
        Ok(resolved)
    }

    fn resolve_service(&self, svc: &ServiceConfig) -> Result<ResolvedService, ConfigError> {
        let d = &self.defaults;
        let id = svc.id.clone();

        validate_health_url(&id, &svc.health_url)?;

        let duration = |field: &str,
                        value: &Option<String>,
                        default: &str|
         -> Result<Duration, ConfigError> {
            required_duration(&format!("{id}.{field}"), value.as_deref().unwrap_or(default))
        };

        let resolved = ResolvedService {
            id: id.clone(),
            name: svc.name.clone().unwrap_or_else(|| id.clone()),
            health_url: svc.health_url.clone(),
            poll_interval: duration("poll_interval", &svc.poll_interval, &d.poll_interval)?,
            probe_timeout: duration("probe_timeout", &svc.probe_timeout, &d.probe_timeout)?,
            failure_threshold: svc.failure_threshold.unwrap_or(d.failure_threshold),
            success_threshold: svc.success_threshold.unwrap_or(d.success_threshold),
            initial_success_threshold: svc
                .initial_success_threshold
                .unwrap_or(d.initial_success_threshold),
            backoff_base: duration("backoff_base", &svc.backoff_base, &d.backoff_base)?,
            backoff_max: duration("backoff_max", &svc.backoff_max, &d.backoff_max)?,
            max_restart_attempts: svc.max_restart_attempts.unwrap_or(d.max_restart_attempts),
            restart_command: svc.restart_command.clone(),
        };

        let zero = |field: &str| ConfigError::Zero {
            scope: format!("service {id}"),
            field: field.to_string(),
        };
        if resolved.poll_interval.is_zero() {
            return Err(zero("poll_interval"));
        }
        if resolved.probe_timeout.is_zero() {
            return Err(zero("probe_timeout"));
        }
        if resolved.failure_threshold == 0 {
            return Err(zero("failure_threshold"));
        }
        if resolved.success_threshold == 0 {
            return Err(zero("success_threshold"));
        }
        if resolved.initial_success_threshold == 0 {
            return Err(zero("initial_success_threshold"));
        }
        if resolved.backoff_base > resolved.backoff_max {
            return Err(ConfigError::BackoffRange { id });
        }

        Ok(resolved)
    }
}

fn validate_health_url(id: &str, url: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidHealthUrl {
        id: id.to_string(),
        url: url.to_string(),
        reason: reason.to_string(),
    };
    let uri: http::Uri = url.parse().map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => return Err(invalid(&format!("unsupported scheme {other}"))),
        None => return Err(invalid("missing scheme")),
    }
    if uri.host().is_none_or(str::is_empty) {
        return Err(invalid("missing host"));
    }
    Ok(())
}

fn required_duration(field: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// Parse a duration string like "500ms", "5s", "2m", "1h".
///
/// A bare integer is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        let m = mins.parse::<u64>().ok()?;
        m.checked_mul(60).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        let h = hours.parse::<u64>().ok()?;
        h.checked_mul(3600).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[orchestrator]
max_concurrent_probes = 4
shutdown_grace = "3s"

[defaults]
poll_interval = "10s"

[[services]]
id = "buckets"
name = "File storage"
health_url = "http://127.0.0.1:8000/health"
restart_command = ["docker", "restart", "uws-{id}"]

[[services]]
id = "queue"
health_url = "http://127.0.0.1:8003/health"
failure_threshold = 5
backoff_base = "500ms"
"#;

    #[test]
    fn parse_sample_and_resolve_defaults() {
        let config = OrchestratorConfig::from_toml_str(SAMPLE).unwrap();
        let services = config.services().unwrap();
        assert_eq!(services.len(), 2);

        let buckets = &services[0];
        assert_eq!(buckets.name, "File storage");
        assert_eq!(buckets.poll_interval, Duration::from_secs(10));
        assert_eq!(buckets.probe_timeout, Duration::from_secs(5));
        assert_eq!(buckets.failure_threshold, 3);
        assert_eq!(buckets.success_threshold, 2);
        assert_eq!(buckets.initial_success_threshold, 1);
        assert_eq!(buckets.backoff_max, Duration::from_secs(300));
        assert_eq!(buckets.max_restart_attempts, 5);
        assert_eq!(
            buckets.restart_command.as_deref(),
            Some(&["docker".to_string(), "restart".to_string(), "uws-{id}".to_string()][..])
        );
    }

    #[test]
    fn per_service_overrides_win() {
        let config = OrchestratorConfig::from_toml_str(SAMPLE).unwrap();
        let queue = &config.services().unwrap()[1];
        assert_eq!(queue.name, "queue");
        assert_eq!(queue.failure_threshold, 5);
        assert_eq!(queue.backoff_base, Duration::from_millis(500));
        assert!(queue.restart_command.is_none());
    }

    #[test]
    fn orchestrator_section_defaults() {
        let config = OrchestratorConfig::from_toml_str(SAMPLE).unwrap();
        let orch = config.orchestrator().unwrap();
        assert_eq!(orch.max_concurrent_probes, 4);
        assert_eq!(orch.shutdown_grace, Duration::from_secs(3));
        assert_eq!(orch.restart_timeout, Duration::from_secs(60));
        assert_eq!(orch.pool_wait_timeout, None);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let toml_str = r#"
[[services]]
id = "db"
health_url = "http://localhost:8001/health"

[[services]]
id = "db"
health_url = "http://localhost:8002/health"
"#;
        let config = OrchestratorConfig::from_toml_str(toml_str).unwrap();
        assert!(matches!(config.services(), Err(ConfigError::DuplicateService(id)) if id == "db"));
    }

    #[test]
    fn rejects_non_http_urls() {
        for url in ["https://localhost/health", "localhost:8000/health", "http:///health"] {
            let config = OrchestratorConfig {
                orchestrator: OrchestratorSection::default(),
                defaults: ServiceDefaults::default(),
                services: vec![ServiceConfig {
                    id: "db".to_string(),
                    health_url: url.to_string(),
                    ..Default::default()
                }],
            };
            assert!(
                matches!(config.services(), Err(ConfigError::InvalidHealthUrl { .. })),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_zero_threshold_and_inverted_backoff() {
        let mut svc = ServiceConfig {
            id: "secrets".to_string(),
            health_url: "http://localhost:8004/health".to_string(),
            failure_threshold: Some(0),
            ..Default::default()
        };
        let mut config = OrchestratorConfig {
            orchestrator: OrchestratorSection::default(),
            defaults: ServiceDefaults::default(),
            services: vec![svc.clone()],
        };
        assert!(matches!(config.services(), Err(ConfigError::Zero { .. })));

        svc.failure_threshold = None;
        svc.backoff_base = Some("10m".to_string());
        config.services = vec![svc];
        assert!(matches!(config.services(), Err(ConfigError::BackoffRange { .. })));
    }

    #[test]
    fn rejects_empty_service_list() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert!(matches!(config.services(), Err(ConfigError::NoServices)));
    }

    #[test]
    fn rejects_bad_duration() {
        let toml_str = r#"
[[services]]
id = "db"
health_url = "http://localhost:8001/health"
poll_interval = "soon"
"#;
        let config = OrchestratorConfig::from_toml_str(toml_str).unwrap();
        assert!(matches!(
            config.services(),
            Err(ConfigError::InvalidDuration { field, .. }) if field == "db.poll_interval"
        ));
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("ten"), None);
    }

    #[test]
    fn parse_duration_rejects_overflow() {
        assert_eq!(parse_duration("9999999999999999h"), None);
        assert_eq!(parse_duration("9999999999999999999m"), None);

        let toml_str = r#"
[[services]]
id = "db"
health_url = "http://localhost:8001/health"
poll_interval = "9999999999999999999m"
"#;
        let config = OrchestratorConfig::from_toml_str(toml_str).unwrap();
        assert!(matches!(
            config.services(),
            Err(ConfigError::InvalidDuration { field, .. }) if field == "db.poll_interval"
        ));
    }
}
