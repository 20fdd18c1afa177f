//! Health monitor: one scheduled probe loop per registered service.
//!
//! Each loop ticks on the service's poll interval, takes a permit from the
//! shared probe pool, runs the probe, and hands the result to the
//! registry. A loop never touches a descriptor itself, and a failing
//! probe for one service never delays another service's loop beyond the
//! pool's concurrency cap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{RwLock, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use uws_metrics::MetricsExporter;
use uws_state::{HealthCheckResult, ProbeErrorKind};

use crate::checker::{ProbeTarget, Prober};
use crate::error::{HealthError, HealthResult};
use crate::registry::ServiceRegistry;

/// Slack on top of a probe's own timeout before the loop gives up on it.
const PROBE_DEADLINE_SLACK: Duration = Duration::from_millis(500);

/// Per-service monitor state.
struct MonitorSlot {
    /// Handle to the probe loop.
    handle: JoinHandle<()>,
    /// Shutdown signal for this loop.
    shutdown_tx: watch::Sender<bool>,
}

/// Everything a probe loop shares with the monitor.
#[derive(Clone)]
struct LoopContext {
    registry: Arc<ServiceRegistry>,
    prober: Arc<dyn Prober>,
    metrics: Arc<MetricsExporter>,
    permits: Arc<Semaphore>,
    pool_wait_timeout: Option<Duration>,
}

/// Schedules probes for every registered service.
pub struct HealthMonitor {
    ctx: LoopContext,
    /// Active loops: service_id → slot.
    monitors: Arc<RwLock<HashMap<String, MonitorSlot>>>,
}

impl HealthMonitor {
    /// Create a monitor whose loops share `max_concurrent_probes` permits.
    pub fn new(
        registry: Arc<ServiceRegistry>,
        prober: Arc<dyn Prober>,
        metrics: Arc<MetricsExporter>,
        max_concurrent_probes: usize,
    ) -> Self {
        Self {
            ctx: LoopContext {
                registry,
                prober,
                metrics,
                permits: Arc::new(Semaphore::new(max_concurrent_probes.max(1))),
                pool_wait_timeout: None,
            },
            monitors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// How long a loop waits for a pool permit before skipping the cycle.
    /// Defaults to the service's poll interval.
    pub fn with_pool_wait_timeout(mut self, timeout: Duration) -> Self {
        self.ctx.pool_wait_timeout = Some(timeout);
        self
    }

    /// Start the probe loop for a registered service. An existing loop for
    /// the same service is replaced.
    pub async fn start_monitor(&self, service_id: &str) -> HealthResult<()> {
        let desc = self
            .ctx
            .registry
            .get(service_id)
            .await
            .ok_or_else(|| HealthError::UnknownService(service_id.to_string()))?;

        let target = ProbeTarget::from_descriptor(&desc);
        let interval = Duration::from_millis(desc.poll_interval_ms.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_probe_loop(
            self.ctx.clone(),
            target,
            interval,
            shutdown_rx,
        ));

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            service_id.to_string(),
            MonitorSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(%service_id, url = %desc.health_url, interval_ms = desc.poll_interval_ms, "health monitor started");
        Ok(())
    }

    /// Start a loop for every service in the registry.
    pub async fn start_all(&self) -> HealthResult<usize> {
        let services = self.ctx.registry.list().await;
        for desc in &services {
            self.start_monitor(&desc.id).await?;
        }
        Ok(services.len())
    }

    /// Stop one service's loop.
    pub async fn stop_monitor(&self, service_id: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(service_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(%service_id, "health monitor stopped");
        }
    }

    /// Signal every loop to stop scheduling, wait up to `grace` for
    /// in-flight probes to be committed, then abort whatever remains.
    pub async fn shutdown(&self, grace: Duration) {
        let slots: Vec<(String, MonitorSlot)> = self.monitors.write().await.drain().collect();
        for (_, slot) in &slots {
            let _ = slot.shutdown_tx.send(true);
        }

        let deadline = tokio::time::Instant::now() + grace;
        let mut abandoned = 0usize;
        for (service_id, mut slot) in slots {
            if tokio::time::timeout_at(deadline, &mut slot.handle).await.is_err() {
                slot.handle.abort();
                abandoned += 1;
                debug!(%service_id, "probe loop aborted after grace period");
            }
        }

        if abandoned > 0 {
            warn!(abandoned, "some probe loops did not stop within the grace period");
        }
        info!("all health monitors stopped");
    }

    /// Service ids with a running loop.
    pub async fn active_monitors(&self) -> Vec<String> {
        let monitors = self.monitors.read().await;
        let mut ids: Vec<String> = monitors.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn is_monitoring(&self, service_id: &str) -> bool {
        let monitors = self.monitors.read().await;
        monitors.contains_key(service_id)
    }
}

/// The probe loop for a single service.
async fn run_probe_loop(
    ctx: LoopContext,
    target: ProbeTarget,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let service_id = target.service_id.clone();
    let pool_wait = ctx.pool_wait_timeout.unwrap_or(interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(%service_id, url = %target.health_url, "probe loop starting");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let permit = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            acquired = tokio::time::timeout(pool_wait, Arc::clone(&ctx.permits).acquire_owned()) => {
                match acquired {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => {
                        debug!(%service_id, "probe pool closed");
                        break;
                    }
                    Err(_) => {
                        ctx.metrics.record_pool_saturated();
                        error!(
                            %service_id,
                            wait_ms = pool_wait.as_millis() as u64,
                            "probe pool saturated, skipping cycle"
                        );
                        continue;
                    }
                }
            }
        };

        // In-flight probes are left to finish; shutdown waits for them.
        let result = probe_with_deadline(ctx.prober.as_ref(), &target).await;
        drop(permit);

        match ctx.registry.update(result).await {
            Ok(_) => {}
            Err(HealthError::UnknownService(_)) => {
                debug!(%service_id, "service deregistered, probe loop exiting");
                break;
            }
            Err(e) => {
                error!(%service_id, error = %e, "failed to apply probe result");
            }
        }
    }

    debug!(%service_id, "probe loop stopped");
}

/// Run one probe, synthesizing a timeout if the prober overruns its own
/// deadline.
async fn probe_with_deadline(prober: &dyn Prober, target: &ProbeTarget) -> HealthCheckResult {
    let deadline = target.timeout + PROBE_DEADLINE_SLACK;
    match tokio::time::timeout(deadline, prober.probe(target)).await {
        Ok(result) => result,
        Err(_) => HealthCheckResult {
            service_id: target.service_id.clone(),
            observed_at: epoch_millis(),
            http_status: None,
            latency_ms: deadline.as_millis() as u64,
            body: None,
            detail: Some(format!("probe exceeded {}ms", deadline.as_millis())),
            error_kind: Some(ProbeErrorKind::Timeout),
        },
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
