//! ServiceRegistry: the single owner of every `ServiceDescriptor`.
//!
//! Each descriptor sits behind its own mutex, so updates for one service
//! are serialized while different services proceed independently. Every
//! update runs the transition rules, commits the resulting status to the
//! `StatusStore`, refreshes the metrics gauge, and publishes any edge on
//! the event channel, all before the service's lock is released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, mpsc};
use tracing::{debug, error, info, warn};

use uws_metrics::MetricsExporter;
use uws_state::{HealthCheckResult, ServiceDescriptor, ServiceId, ServiceState, StatusStore};

use crate::error::{HealthError, HealthResult};
use crate::transition::{self, RestartGate, Step};

/// Published by the registry after a committed update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// The service moved along an edge of the state machine.
    Transition {
        service_id: ServiceId,
        from: ServiceState,
        to: ServiceState,
        at: u64,
    },
    /// The service entered `Unhealthy` (or its deferred notification came
    /// due) and the restart controller should act.
    RestartRequested { service_id: ServiceId, at: u64 },
}

/// Receiving half of the registry's event channel.
pub type HealthEvents = mpsc::UnboundedReceiver<HealthEvent>;

pub struct ServiceRegistry {
    services: RwLock<HashMap<ServiceId, Arc<Mutex<ServiceDescriptor>>>>,
    store: StatusStore,
    metrics: Arc<MetricsExporter>,
    events: mpsc::UnboundedSender<HealthEvent>,
}

impl ServiceRegistry {
    /// Create an empty registry and the channel its events arrive on.
    pub fn new(store: StatusStore, metrics: Arc<MetricsExporter>) -> (Self, HealthEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Self {
            services: RwLock::new(HashMap::new()),
            store,
            metrics,
            events,
        };
        (registry, rx)
    }

    /// Add a service. Its first status is committed immediately.
    pub async fn register(&self, desc: ServiceDescriptor) -> HealthResult<()> {
        let mut services = self.services.write().await;
        if services.contains_key(&desc.id) {
            return Err(HealthError::AlreadyRegistered(desc.id));
        }

        self.store.write(&desc.status())?;
        self.metrics.register(&desc.id);
        self.metrics.set_state(&desc.id, desc.current_state);
        info!(service_id = %desc.id, url = %desc.health_url, "service registered");

        services.insert(desc.id.clone(), Arc::new(Mutex::new(desc)));
        Ok(())
    }

    /// Remove a service and its published status.
    pub async fn deregister(&self, service_id: &str) -> HealthResult<ServiceDescriptor> {
        let slot = self
            .services
            .write()
            .await
            .remove(service_id)
            .ok_or_else(|| HealthError::UnknownService(service_id.to_string()))?;

        // Writers that already hold this slot see it detached once they get
        // the lock, so nothing is committed after the delete below.
        let desc = slot.lock().await;
        self.store.delete(service_id)?;
        self.metrics.unregister(service_id);
        info!(%service_id, "service deregistered");
        Ok(desc.clone())
    }

    /// Apply one probe result. The probe's `observed_at` is the clock the
    /// backoff window is compared against.
    pub async fn update(&self, result: HealthCheckResult) -> HealthResult<ServiceState> {
        let mut desc = self.lock_live(&result.service_id).await?;

        let now = result.observed_at;
        self.metrics.observe_probe(&result);
        let step = transition::apply_probe(&mut desc, result, now);

        self.commit(&desc, step, now);
        Ok(desc.current_state)
    }

    /// Ask to restart a service; see [`transition::begin_restart`].
    pub async fn begin_restart(&self, service_id: &str, now: u64) -> HealthResult<RestartGate> {
        let mut desc = self.lock_live(service_id).await?;

        let from = desc.current_state;
        let gate = transition::begin_restart(&mut desc, now);
        let to = desc.current_state;
        let step = Step {
            transition: (from != to).then_some((from, to)),
            restart_requested: false,
        };

        self.commit(&desc, step, now);
        Ok(gate)
    }

    /// Record that the lifecycle call for a restart has returned.
    pub async fn complete_restart(&self, service_id: &str) -> HealthResult<()> {
        let mut desc = self.lock_live(service_id).await?;

        if transition::complete_restart(&mut desc) {
            self.commit(&desc, Step::default(), epoch_millis());
        }
        Ok(())
    }

    /// Operator reset of a `FailedPermanently` service.
    pub async fn reset(&self, service_id: &str) -> HealthResult<()> {
        let mut desc = self.lock_live(service_id).await?;

        if !transition::reset(&mut desc) {
            return Err(HealthError::NotFailedPermanently(service_id.to_string()));
        }
        info!(%service_id, "circuit breaker reset by operator");
        self.commit(&desc, Step::default(), epoch_millis());
        Ok(())
    }

    /// A copy of one descriptor.
    pub async fn get(&self, service_id: &str) -> Option<ServiceDescriptor> {
        let slot = self.slot(service_id).await.ok()?;
        let desc = slot.lock().await;
        Some(desc.clone())
    }

    /// Copies of every descriptor, sorted by id.
    pub async fn list(&self) -> Vec<ServiceDescriptor> {
        let slots: Vec<_> = self.services.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(slot.lock().await.clone());
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn is_registered(&self, service_id: &str) -> bool {
        self.services.read().await.contains_key(service_id)
    }

    async fn slot(&self, service_id: &str) -> HealthResult<Arc<Mutex<ServiceDescriptor>>> {
        self.services
            .read()
            .await
            .get(service_id)
            .cloned()
            .ok_or_else(|| HealthError::UnknownService(service_id.to_string()))
    }

    /// Lock a service's descriptor for writing. Fails if the service was
    /// deregistered while this caller waited for the lock.
    async fn lock_live(&self, service_id: &str) -> HealthResult<OwnedMutexGuard<ServiceDescriptor>> {
        let slot = self.slot(service_id).await?;
        let guard = Arc::clone(&slot).lock_owned().await;
        let live = self
            .services
            .read()
            .await
            .get(service_id)
            .is_some_and(|current| Arc::ptr_eq(current, &slot));
        if !live {
            return Err(HealthError::UnknownService(service_id.to_string()));
        }
        Ok(guard)
    }

    /// Publish a committed descriptor. Called with the service lock held.
    fn commit(&self, desc: &ServiceDescriptor, step: Step, now: u64) {
        let service_id = &desc.id;

        if let Err(e) = self.store.write(&desc.status()) {
            error!(%service_id, error = %e, "failed to commit status");
        }
        self.metrics.set_state(service_id, desc.current_state);

        if let Some((from, to)) = step.transition {
            debug_assert!(transition::is_edge(from, to), "illegal edge {from} -> {to}");
            match to {
                ServiceState::Unhealthy => warn!(
                    %service_id,
                    %from,
                    failures = desc.policy.failure_threshold,
                    deferred = desc.restart_deferred,
                    "service marked unhealthy"
                ),
                ServiceState::FailedPermanently => {
                    self.metrics.record_failed_permanently(service_id);
                    error!(
                        %service_id,
                        attempts = desc.restart_attempts,
                        "restart budget exhausted, service failed permanently"
                    );
                }
                _ => info!(%service_id, %from, %to, "service state changed"),
            }
            self.publish(HealthEvent::Transition {
                service_id: service_id.clone(),
                from,
                to,
                at: now,
            });
        }

        if step.restart_requested {
            debug!(%service_id, "restart requested");
            self.publish(HealthEvent::RestartRequested {
                service_id: service_id.clone(),
                at: now,
            });
        }
    }

    fn publish(&self, event: HealthEvent) {
        // Nobody listening only happens during shutdown.
        if self.events.send(event).is_err() {
            debug!("health event dropped, no subscriber");
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
