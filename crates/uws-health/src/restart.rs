//! Restart controller: turns unhealthy notifications into lifecycle calls.
//!
//! The controller consumes the registry's event channel. For each restart
//! request it asks the registry for permission (backoff, budget and the
//! in-flight lock are all decided there), invokes the external lifecycle
//! collaborator with a timeout, and books the completion back into the
//! registry. Restart calls run on a `JoinSet` so one slow collaborator
//! never holds up requests for other services.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use uws_metrics::MetricsExporter;
use uws_state::ServiceState;

use crate::checker::BoxFuture;
use crate::error::{HealthError, HealthResult};
use crate::registry::{HealthEvent, HealthEvents, ServiceRegistry};
use crate::transition::{RestartGate, SkipReason};

const DEFAULT_RESTART_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// The process manager or container runtime that actually restarts a
/// service. Calls must be idempotent and safe on a stopped service.
pub trait Lifecycle: Send + Sync {
    fn restart<'a>(&'a self, service_id: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// What the controller did with one restart request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    /// The collaborator reported success.
    Restarted { attempt: u32, delay_ms: u64 },
    /// No call was made.
    Skipped(SkipReason),
}

pub struct RestartController {
    registry: Arc<ServiceRegistry>,
    lifecycle: Arc<dyn Lifecycle>,
    metrics: Arc<MetricsExporter>,
    restart_timeout: Duration,
    shutdown_grace: Duration,
}

impl RestartController {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        lifecycle: Arc<dyn Lifecycle>,
        metrics: Arc<MetricsExporter>,
    ) -> Self {
        Self {
            registry,
            lifecycle,
            metrics,
            restart_timeout: DEFAULT_RESTART_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Upper bound on a single lifecycle call.
    pub fn with_restart_timeout(mut self, timeout: Duration) -> Self {
        self.restart_timeout = timeout;
        self
    }

    /// How long in-flight restarts may run after shutdown is signaled.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Handle one `Unhealthy` notification for `service_id`.
    ///
    /// Both restart failure kinds come back as errors:
    /// `RestartInvocationFailed` when the collaborator failed or timed out
    /// (the attempt still counts against the budget), and
    /// `RestartBudgetExhausted` when the circuit opened instead of calling.
    pub async fn on_unhealthy_transition(&self, service_id: &str) -> HealthResult<RestartOutcome> {
        let (attempt, delay_ms) = match self.registry.begin_restart(service_id, epoch_millis()).await? {
            RestartGate::Proceed { attempt, delay_ms } => (attempt, delay_ms),
            RestartGate::Exhausted { attempts } => {
                return Err(HealthError::RestartBudgetExhausted {
                    service_id: service_id.to_string(),
                    attempts,
                });
            }
            RestartGate::Skip(reason) => {
                debug!(%service_id, ?reason, "restart request skipped");
                return Ok(RestartOutcome::Skipped(reason));
            }
        };

        info!(%service_id, attempt, delay_ms, "restarting service");

        let call = tokio::time::timeout(self.restart_timeout, self.lifecycle.restart(service_id));
        let result = match call.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(_) => Err(format!("timed out after {}ms", self.restart_timeout.as_millis())),
        };

        self.metrics.record_restart(service_id, result.is_ok());
        self.registry.complete_restart(service_id).await?;

        match result {
            Ok(()) => {
                info!(%service_id, attempt, outcome = "restarted", "restart call succeeded");
                Ok(RestartOutcome::Restarted { attempt, delay_ms })
            }
            Err(reason) => Err(HealthError::RestartInvocationFailed {
                service_id: service_id.to_string(),
                reason,
            }),
        }
    }

    /// Consume registry events until shutdown is signaled or the registry
    /// goes away, then give running restarts `shutdown_grace` to finish.
    pub async fn run(self: Arc<Self>, mut events: HealthEvents, mut shutdown: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();
        info!("restart controller started");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(HealthEvent::RestartRequested { service_id, .. }) => {
                        let this = Arc::clone(&self);
                        tasks.spawn(async move { this.handle_request(&service_id).await });
                    }
                    Some(HealthEvent::Transition {
                        service_id,
                        from: ServiceState::Restarting,
                        to: ServiceState::Unhealthy,
                        ..
                    }) => {
                        warn!(%service_id, outcome = "still_unhealthy", "service still unhealthy after restart");
                    }
                    Some(HealthEvent::Transition { .. }) => {}
                    None => {
                        debug!("health event channel closed");
                        break;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "restart task panicked");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("restart controller shutting down");
                    break;
                }
            }
        }

        if !tasks.is_empty() {
            let pending = tasks.len();
            let drained = tokio::time::timeout(self.shutdown_grace, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(pending, "abandoning in-flight restarts after shutdown grace");
                tasks.abort_all();
            }
        }
        info!("restart controller stopped");
    }

    async fn handle_request(&self, service_id: &str) {
        match self.on_unhealthy_transition(service_id).await {
            Ok(_) => {}
            Err(HealthError::RestartInvocationFailed { service_id, reason }) => {
                warn!(%service_id, %reason, outcome = "invocation_failed", "restart mechanism failed");
            }
            Err(HealthError::RestartBudgetExhausted { service_id, attempts }) => {
                // The registry already logged the escalation.
                debug!(%service_id, attempts, outcome = "budget_exhausted", "no restart issued");
            }
            Err(e) => {
                error!(%service_id, error = %e, "restart request failed");
            }
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
