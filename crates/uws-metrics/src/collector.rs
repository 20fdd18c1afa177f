//! Metrics exporter: per-service probe and restart aggregates.
//!
//! Uses a lock-free design with atomics for counters and the latency
//! histogram; the service map itself sits behind an `RwLock` that is only
//! write-locked when a new service shows up.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use uws_state::{HealthCheckResult, ProbeErrorKind, ServiceState};

/// Upper bounds (inclusive, milliseconds) of the probe latency histogram.
pub const LATENCY_BUCKETS_MS: [u64; 11] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

/// Probe outcome labels, success first, in counter-slot order.
const OUTCOMES: [&str; 5] = [
    "success",
    "timeout",
    "connection_failed",
    "malformed_response",
    "reported_unhealthy",
];

fn outcome_slot(kind: Option<ProbeErrorKind>) -> usize {
    match kind {
        None => 0,
        Some(ProbeErrorKind::Timeout) => 1,
        Some(ProbeErrorKind::ConnectionFailed) => 2,
        Some(ProbeErrorKind::MalformedResponse) => 3,
        Some(ProbeErrorKind::ReportedUnhealthy) => 4,
    }
}

fn state_slot(state: ServiceState) -> u8 {
    ServiceState::ALL
        .iter()
        .position(|s| *s == state)
        .unwrap_or_default() as u8
}

struct LatencyHistogram {
    /// Non-cumulative counts, one per bucket plus the `+Inf` overflow.
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    count: AtomicU64,
    sum_ms: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_ms: AtomicU64::new(0),
        }
    }

    fn observe(&self, latency_ms: u64) {
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|le| latency_ms <= *le)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let mut cumulative = 0;
        let buckets = LATENCY_BUCKETS_MS
            .iter()
            .enumerate()
            .map(|(i, le)| {
                cumulative += self.buckets[i].load(Ordering::Relaxed);
                (*le, cumulative)
            })
            .collect();
        HistogramSnapshot {
            buckets,
            count: self.count.load(Ordering::Relaxed),
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
        }
    }
}

/// Per-service metrics bucket.
struct ServiceMetrics {
    /// Index into `ServiceState::ALL`.
    state: AtomicU8,
    /// Probe counts, indexed like `OUTCOMES`.
    probes: [AtomicU64; OUTCOMES.len()],
    latency: LatencyHistogram,
    restarts_succeeded: AtomicU64,
    restarts_failed: AtomicU64,
    failed_permanently: AtomicU64,
}

impl ServiceMetrics {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(state_slot(ServiceState::Unknown)),
            probes: std::array::from_fn(|_| AtomicU64::new(0)),
            latency: LatencyHistogram::new(),
            restarts_succeeded: AtomicU64::new(0),
            restarts_failed: AtomicU64::new(0),
            failed_permanently: AtomicU64::new(0),
        }
    }
}

/// Cumulative latency histogram at export time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramSnapshot {
    /// `(upper bound ms, cumulative count)` for every finite bucket.
    pub buckets: Vec<(u64, u64)>,
    pub count: u64,
    pub sum_ms: u64,
}

/// One service's aggregates at export time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMetricsSnapshot {
    pub service_id: String,
    pub state: ServiceState,
    /// `(outcome label, count)` for every outcome, success first.
    pub probes: Vec<(&'static str, u64)>,
    pub latency: HistogramSnapshot,
    pub restarts_succeeded: u64,
    pub restarts_failed: u64,
    pub failed_permanently: u64,
}

impl ServiceMetricsSnapshot {
    pub fn probe_count(&self, outcome: &str) -> u64 {
        self.probes
            .iter()
            .find(|(label, _)| *label == outcome)
            .map_or(0, |(_, n)| *n)
    }
}

/// Everything the exporter knows, sorted by service id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub services: Vec<ServiceMetricsSnapshot>,
    pub pool_saturated: u64,
}

impl MetricsSnapshot {
    pub fn service(&self, service_id: &str) -> Option<&ServiceMetricsSnapshot> {
        self.services.iter().find(|s| s.service_id == service_id)
    }
}

/// Pull-based aggregates of probe and restart activity.
#[derive(Default)]
pub struct MetricsExporter {
    services: RwLock<BTreeMap<String, Arc<ServiceMetrics>>>,
    pool_saturated: AtomicU64,
}

impl MetricsExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a service. Existing counters are kept.
    pub fn register(&self, service_id: &str) {
        self.service(service_id);
        debug!(%service_id, "registered for metrics collection");
    }

    /// Stop exporting a service.
    pub fn unregister(&self, service_id: &str) {
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        services.remove(service_id);
        debug!(%service_id, "unregistered from metrics collection");
    }

    /// Record the service's current state.
    pub fn set_state(&self, service_id: &str, state: ServiceState) {
        self.service(service_id)
            .state
            .store(state_slot(state), Ordering::Relaxed);
    }

    /// Count one probe and its latency.
    pub fn observe_probe(&self, result: &HealthCheckResult) {
        let m = self.service(&result.service_id);
        m.probes[outcome_slot(result.error_kind)].fetch_add(1, Ordering::Relaxed);
        m.latency.observe(result.latency_ms);
    }

    /// Count one restart attempt.
    pub fn record_restart(&self, service_id: &str, succeeded: bool) {
        let m = self.service(service_id);
        if succeeded {
            m.restarts_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            m.restarts_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count one escalation to `FailedPermanently`.
    pub fn record_failed_permanently(&self, service_id: &str) {
        self.service(service_id)
            .failed_permanently
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count one probe cycle skipped because no worker slot freed up.
    pub fn record_pool_saturated(&self) {
        self.pool_saturated.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter as of now.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        let services = services
            .iter()
            .map(|(id, m)| ServiceMetricsSnapshot {
                service_id: id.clone(),
                state: ServiceState::ALL
                    .get(m.state.load(Ordering::Relaxed) as usize)
                    .copied()
                    .unwrap_or(ServiceState::Unknown),
                probes: OUTCOMES
                    .iter()
                    .zip(m.probes.iter())
                    .map(|(label, n)| (*label, n.load(Ordering::Relaxed)))
                    .collect(),
                latency: m.latency.snapshot(),
                restarts_succeeded: m.restarts_succeeded.load(Ordering::Relaxed),
                restarts_failed: m.restarts_failed.load(Ordering::Relaxed),
                failed_permanently: m.failed_permanently.load(Ordering::Relaxed),
            })
            .collect();
        MetricsSnapshot {
            services,
            pool_saturated: self.pool_saturated.load(Ordering::Relaxed),
        }
    }

    /// List all registered service IDs.
    pub fn registered_services(&self) -> Vec<String> {
        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        services.keys().cloned().collect()
    }

    fn service(&self, service_id: &str) -> Arc<ServiceMetrics> {
        {
            let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(m) = services.get(service_id) {
                return Arc::clone(m);
            }
        }
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            services
                .entry(service_id.to_string())
                .or_insert_with(|| Arc::new(ServiceMetrics::new())),
        )
    }
}
