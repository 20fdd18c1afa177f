//! uws-health: health monitoring and auto-restart control loop.
//!
//! ```text
//!  HealthMonitor ──probe──► Prober (HTTP /health)
//!       │
//!       ▼ HealthCheckResult
//!  ServiceRegistry ──commit──► StatusStore, MetricsExporter
//!       │
//!       ▼ HealthEvent (mpsc)
//!  RestartController ──restart──► Lifecycle
//! ```
//!
//! The registry is the only writer of service descriptors. The monitor
//! feeds it probe results; the controller reacts to the edges it
//! publishes and books restart attempts back through it.

pub mod checker;
pub mod error;
pub mod monitor;
pub mod registry;
pub mod restart;
pub mod transition;

pub use checker::{BoxFuture, HttpProber, ProbeTarget, Prober, http_probe};
pub use error::{HealthError, HealthResult};
pub use monitor::HealthMonitor;
pub use registry::{HealthEvent, HealthEvents, ServiceRegistry};
pub use restart::{Lifecycle, RestartController, RestartOutcome};
pub use transition::{RestartGate, SkipReason, backoff_delay};
