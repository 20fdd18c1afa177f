//! uws-metrics: observability for the UWS health supervisor.
//!
//! Aggregates probe outcomes, probe latency, restart attempts and
//! circuit-breaker escalations per service, and renders them in the
//! Prometheus text exposition format.
//!
//! # Architecture
//!
//! ```text
//! MetricsExporter
//!   ├── set_state()               ← registry, after every committed update
//!   ├── observe_probe()           ← registry, once per probe result
//!   ├── record_restart()          ← restart controller, once per attempt
//!   ├── record_failed_permanently()
//!   └── snapshot() → MetricsSnapshot
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```
//!
//! Counters are atomics read at scrape time, so an export always reflects
//! the last completed update.

pub mod collector;
pub mod prometheus;

pub use collector::{
    HistogramSnapshot, LATENCY_BUCKETS_MS, MetricsExporter, MetricsSnapshot,
    ServiceMetricsSnapshot,
};
pub use prometheus::{CONTENT_TYPE, render_prometheus};
