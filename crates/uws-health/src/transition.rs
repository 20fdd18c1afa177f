//! Debounced health state machine.
//!
//! Pure functions over a `ServiceDescriptor`: they apply one probe result
//! or one restart step, mutate counters, and report the edge taken (if
//! any). The registry calls them under the per-service lock and publishes
//! whatever they return.
//!
//! ```text
//! Unknown ──► Healthy ◄──► Unhealthy ──► FailedPermanently
//!                ▲            │  ▲
//!                │            ▼  │
//!                └──────── Restarting
//! ```

use uws_state::{HealthCheckResult, HealthPolicy, ServiceDescriptor, ServiceState};

/// Every edge the control loop may take.
pub const EDGES: [(ServiceState, ServiceState); 7] = [
    (ServiceState::Unknown, ServiceState::Healthy),
    (ServiceState::Healthy, ServiceState::Unhealthy),
    (ServiceState::Unhealthy, ServiceState::Healthy),
    (ServiceState::Unhealthy, ServiceState::Restarting),
    (ServiceState::Restarting, ServiceState::Healthy),
    (ServiceState::Restarting, ServiceState::Unhealthy),
    (ServiceState::Unhealthy, ServiceState::FailedPermanently),
];

pub fn is_edge(from: ServiceState, to: ServiceState) -> bool {
    EDGES.contains(&(from, to))
}

/// What applying a probe did to a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Step {
    /// `(from, to)` when the state changed.
    pub transition: Option<(ServiceState, ServiceState)>,
    /// The restart controller must be notified.
    pub restart_requested: bool,
}

/// Result of asking for permission to restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartGate {
    /// Go ahead; the service is now `Restarting`.
    Proceed { attempt: u32, delay_ms: u64 },
    /// The circuit opened; the service is now `FailedPermanently`.
    Exhausted { attempts: u32 },
    /// Nothing to do.
    Skip(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The service left `Unhealthy` before the request was handled.
    NotUnhealthy,
    /// Another restart for the same service is still running.
    InFlight,
    /// `backoff_until` is still ahead; the request was deferred.
    Backoff,
}

/// Exponential restart backoff: `min(base * 2^attempts, max)`.
pub fn backoff_delay(policy: &HealthPolicy, attempts: u32) -> u64 {
    let factor = 2u64.checked_pow(attempts).unwrap_or(u64::MAX);
    policy
        .backoff_base_ms
        .saturating_mul(factor)
        .min(policy.backoff_max_ms)
}

fn in_backoff(desc: &ServiceDescriptor, now: u64) -> bool {
    desc.backoff_until.is_some_and(|until| now < until)
}

/// Move to `to`, reset the per-transition counters, and apply entry
/// actions. Returns whether a restart notification is due.
fn enter(desc: &mut ServiceDescriptor, to: ServiceState, now: u64) -> bool {
    desc.current_state = to;
    desc.consecutive_failures = 0;
    desc.consecutive_successes = 0;

    match to {
        ServiceState::Healthy => {
            desc.restart_attempts = 0;
            desc.backoff_until = None;
            desc.restart_deferred = false;
            false
        }
        ServiceState::Unhealthy => {
            if in_backoff(desc, now) {
                desc.restart_deferred = true;
                false
            } else {
                desc.restart_deferred = false;
                true
            }
        }
        ServiceState::FailedPermanently => {
            desc.restart_deferred = false;
            false
        }
        ServiceState::Unknown | ServiceState::Restarting => false,
    }
}

/// Apply one probe result observed at `now` (unix ms).
pub fn apply_probe(desc: &mut ServiceDescriptor, result: HealthCheckResult, now: u64) -> Step {
    let success = result.is_success();
    desc.last_result = Some(result);

    // The outcome of an in-flight restart is judged by the probes after it.
    if desc.restart_in_flight {
        return Step::default();
    }

    if success {
        desc.consecutive_successes = desc.consecutive_successes.saturating_add(1);
        desc.consecutive_failures = 0;
    } else {
        desc.consecutive_failures = desc.consecutive_failures.saturating_add(1);
        desc.consecutive_successes = 0;
    }

    let policy = desc.policy;
    let from = desc.current_state;
    let to = match (from, success) {
        (ServiceState::Unknown, true)
            if desc.consecutive_successes >= policy.initial_success_threshold =>
        {
            Some(ServiceState::Healthy)
        }
        (ServiceState::Unhealthy | ServiceState::Restarting, true)
            if desc.consecutive_successes >= policy.success_threshold =>
        {
            Some(ServiceState::Healthy)
        }
        (ServiceState::Healthy | ServiceState::Restarting, false)
            if desc.consecutive_failures >= policy.failure_threshold =>
        {
            Some(ServiceState::Unhealthy)
        }
        _ => None,
    };

    match to {
        Some(to) => {
            let restart_requested = enter(desc, to, now);
            Step {
                transition: Some((from, to)),
                restart_requested,
            }
        }
        None => {
            // A notification held back by backoff fires on the first
            // failure once the window has passed.
            let fire_deferred = from == ServiceState::Unhealthy
                && !success
                && desc.restart_deferred
                && !in_backoff(desc, now);
            if fire_deferred {
                desc.restart_deferred = false;
            }
            Step {
                transition: None,
                restart_requested: fire_deferred,
            }
        }
    }
}

/// Ask to restart a service that was reported `Unhealthy`.
///
/// On `Proceed` the attempt is already booked: `restart_attempts` is
/// incremented, `backoff_until` pushed out, and the state is `Restarting`.
pub fn begin_restart(desc: &mut ServiceDescriptor, now: u64) -> RestartGate {
    if desc.restart_in_flight {
        return RestartGate::Skip(SkipReason::InFlight);
    }
    if desc.current_state != ServiceState::Unhealthy {
        return RestartGate::Skip(SkipReason::NotUnhealthy);
    }
    if in_backoff(desc, now) {
        desc.restart_deferred = true;
        return RestartGate::Skip(SkipReason::Backoff);
    }
    if desc.restart_attempts >= desc.policy.max_restart_attempts {
        let attempts = desc.restart_attempts;
        enter(desc, ServiceState::FailedPermanently, now);
        return RestartGate::Exhausted { attempts };
    }

    let delay_ms = backoff_delay(&desc.policy, desc.restart_attempts);
    desc.restart_attempts += 1;
    desc.last_restart_at = Some(now);
    desc.backoff_until = Some(now.saturating_add(delay_ms));
    desc.restart_in_flight = true;
    enter(desc, ServiceState::Restarting, now);

    RestartGate::Proceed {
        attempt: desc.restart_attempts,
        delay_ms,
    }
}

/// Mark the outstanding restart call as finished. Successful and failed
/// calls are booked the same way; the next probes decide the state.
pub fn complete_restart(desc: &mut ServiceDescriptor) -> bool {
    if !desc.restart_in_flight {
        return false;
    }
    desc.restart_in_flight = false;
    desc.consecutive_failures = 0;
    desc.consecutive_successes = 0;
    true
}

/// Operator clear of the circuit breaker: back to `Unknown` with a fresh
/// restart budget. Not a control-loop edge.
pub fn reset(desc: &mut ServiceDescriptor) -> bool {
    if desc.current_state != ServiceState::FailedPermanently {
        return false;
    }
    desc.current_state = ServiceState::Unknown;
    desc.consecutive_failures = 0;
    desc.consecutive_successes = 0;
    desc.restart_attempts = 0;
    desc.backoff_until = None;
    desc.restart_deferred = false;
    desc.restart_in_flight = false;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use uws_state::ProbeErrorKind;

    const T0: u64 = 1_000_000;

    fn policy() -> HealthPolicy {
        HealthPolicy {
            failure_threshold: 3,
            success_threshold: 2,
            initial_success_threshold: 1,
            backoff_base_ms: 1_000,
            backoff_max_ms: 8_000,
            max_restart_attempts: 3,
        }
    }

    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new("db", "db", "http://localhost:8001/health", 30_000, 5_000, policy())
    }

    fn ok() -> HealthCheckResult {
        result(None)
    }

    fn fail(kind: ProbeErrorKind) -> HealthCheckResult {
        result(Some(kind))
    }

    fn result(error_kind: Option<ProbeErrorKind>) -> HealthCheckResult {
        HealthCheckResult {
            service_id: "db".to_string(),
            observed_at: T0,
            http_status: match error_kind {
                None => Some(200),
                Some(ProbeErrorKind::ReportedUnhealthy) => Some(503),
                Some(_) => None,
            },
            latency_ms: 1,
            body: None,
            detail: None,
            error_kind,
        }
    }

    fn healthy() -> ServiceDescriptor {
        let mut desc = descriptor();
        apply_probe(&mut desc, ok(), T0);
        assert_eq!(desc.current_state, ServiceState::Healthy);
        desc
    }

    fn unhealthy() -> ServiceDescriptor {
        let mut desc = healthy();
        for _ in 0..3 {
            apply_probe(&mut desc, fail(ProbeErrorKind::ReportedUnhealthy), T0);
        }
        assert_eq!(desc.current_state, ServiceState::Unhealthy);
        desc
    }

    #[test]
    fn unknown_to_healthy_on_first_success() {
        let mut desc = descriptor();
        let step = apply_probe(&mut desc, ok(), T0);
        assert_eq!(
            step.transition,
            Some((ServiceState::Unknown, ServiceState::Healthy))
        );
        assert!(!step.restart_requested);
    }

    #[test]
    fn failures_while_unknown_only_count() {
        let mut desc = descriptor();
        for _ in 0..10 {
            let step = apply_probe(&mut desc, fail(ProbeErrorKind::ConnectionFailed), T0);
            assert_eq!(step, Step::default());
        }
        assert_eq!(desc.current_state, ServiceState::Unknown);
        assert_eq!(desc.consecutive_failures, 10);
    }

    #[test]
    fn initial_threshold_above_one_is_respected() {
        let mut desc = descriptor();
        desc.policy.initial_success_threshold = 2;
        apply_probe(&mut desc, ok(), T0);
        assert_eq!(desc.current_state, ServiceState::Unknown);
        apply_probe(&mut desc, ok(), T0);
        assert_eq!(desc.current_state, ServiceState::Healthy);
    }

    #[test]
    fn below_failure_threshold_then_success_stays_healthy() {
        let mut desc = healthy();
        apply_probe(&mut desc, fail(ProbeErrorKind::Timeout), T0);
        apply_probe(&mut desc, fail(ProbeErrorKind::Timeout), T0);
        assert_eq!(desc.consecutive_failures, 2);

        apply_probe(&mut desc, ok(), T0);
        assert_eq!(desc.current_state, ServiceState::Healthy);
        assert_eq!(desc.consecutive_failures, 0);

        // The streak starts over.
        apply_probe(&mut desc, fail(ProbeErrorKind::Timeout), T0);
        apply_probe(&mut desc, fail(ProbeErrorKind::Timeout), T0);
        assert_eq!(desc.current_state, ServiceState::Healthy);
    }

    #[test]
    fn exactly_failure_threshold_leaves_healthy_and_requests_restart() {
        let mut desc = healthy();
        let mut steps = Vec::new();
        for _ in 0..3 {
            steps.push(apply_probe(&mut desc, fail(ProbeErrorKind::ReportedUnhealthy), T0));
        }
        assert_eq!(steps[0], Step::default());
        assert_eq!(steps[1], Step::default());
        assert_eq!(
            steps[2].transition,
            Some((ServiceState::Healthy, ServiceState::Unhealthy))
        );
        assert!(steps[2].restart_requested);
        assert_eq!(desc.consecutive_successes, 0);
    }

    #[test]
    fn timeouts_count_like_reported_unhealthy() {
        let mut desc = healthy();
        for _ in 0..3 {
            apply_probe(&mut desc, fail(ProbeErrorKind::Timeout), T0);
        }
        assert_eq!(desc.current_state, ServiceState::Unhealthy);
        assert_eq!(
            desc.last_result.as_ref().unwrap().error_kind,
            Some(ProbeErrorKind::Timeout)
        );
    }

    #[test]
    fn restart_notification_is_edge_triggered() {
        let mut desc = unhealthy();
        for _ in 0..20 {
            let step = apply_probe(&mut desc, fail(ProbeErrorKind::ReportedUnhealthy), T0);
            assert!(!step.restart_requested);
            assert!(step.transition.is_none());
        }
    }

    #[test]
    fn recovery_needs_success_threshold() {
        let mut desc = unhealthy();
        desc.restart_attempts = 2;

        apply_probe(&mut desc, ok(), T0);
        assert_eq!(desc.current_state, ServiceState::Unhealthy);
        // A failure in between breaks the streak.
        apply_probe(&mut desc, fail(ProbeErrorKind::Timeout), T0);
        apply_probe(&mut desc, ok(), T0);
        assert_eq!(desc.current_state, ServiceState::Unhealthy);

        let step = apply_probe(&mut desc, ok(), T0);
        assert_eq!(
            step.transition,
            Some((ServiceState::Unhealthy, ServiceState::Healthy))
        );
        assert_eq!(desc.restart_attempts, 0);
        assert_eq!(desc.consecutive_failures, 0);
        assert!(desc.backoff_until.is_none());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        let delays: Vec<u64> = (0..8).map(|n| backoff_delay(&p, n)).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 8_000, 8_000, 8_000, 8_000]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        // Absurd attempt counts saturate instead of overflowing.
        assert_eq!(backoff_delay(&p, 200), 8_000);
    }

    #[test]
    fn begin_restart_books_the_attempt() {
        let mut desc = unhealthy();
        let gate = begin_restart(&mut desc, T0);
        assert_eq!(gate, RestartGate::Proceed { attempt: 1, delay_ms: 1_000 });
        assert_eq!(desc.current_state, ServiceState::Restarting);
        assert_eq!(desc.restart_attempts, 1);
        assert_eq!(desc.last_restart_at, Some(T0));
        assert_eq!(desc.backoff_until, Some(T0 + 1_000));
        assert!(desc.restart_in_flight);

        // The Restarting state locks out a second call.
        assert_eq!(begin_restart(&mut desc, T0), RestartGate::Skip(SkipReason::InFlight));
    }

    #[test]
    fn probes_during_restart_are_recorded_but_ignored() {
        let mut desc = unhealthy();
        begin_restart(&mut desc, T0);
        for _ in 0..5 {
            let step = apply_probe(&mut desc, ok(), T0);
            assert_eq!(step, Step::default());
        }
        assert_eq!(desc.current_state, ServiceState::Restarting);
        assert_eq!(desc.consecutive_successes, 0);
        assert!(desc.last_result.is_some());
    }

    #[test]
    fn after_restart_successes_recover() {
        let mut desc = unhealthy();
        begin_restart(&mut desc, T0);
        assert!(complete_restart(&mut desc));
        assert!(!complete_restart(&mut desc));

        apply_probe(&mut desc, ok(), T0 + 10);
        assert_eq!(desc.current_state, ServiceState::Restarting);
        let step = apply_probe(&mut desc, ok(), T0 + 20);
        assert_eq!(
            step.transition,
            Some((ServiceState::Restarting, ServiceState::Healthy))
        );
        assert_eq!(desc.restart_attempts, 0);
    }

    #[test]
    fn after_restart_failures_reenter_unhealthy() {
        let mut desc = unhealthy();
        begin_restart(&mut desc, T0);
        complete_restart(&mut desc);

        let later = T0 + 5_000;
        apply_probe(&mut desc, fail(ProbeErrorKind::ConnectionFailed), later);
        apply_probe(&mut desc, fail(ProbeErrorKind::ConnectionFailed), later);
        let step = apply_probe(&mut desc, fail(ProbeErrorKind::ConnectionFailed), later);
        assert_eq!(
            step.transition,
            Some((ServiceState::Restarting, ServiceState::Unhealthy))
        );
        assert!(step.restart_requested);
    }

    #[test]
    fn reentry_during_backoff_defers_then_fires_once() {
        let mut desc = unhealthy();
        begin_restart(&mut desc, T0);
        complete_restart(&mut desc);
        let until = desc.backoff_until.unwrap();

        // Back to Unhealthy before the window closes: no notification.
        for _ in 0..3 {
            apply_probe(&mut desc, fail(ProbeErrorKind::Timeout), until - 10);
        }
        assert_eq!(desc.current_state, ServiceState::Unhealthy);
        assert!(desc.restart_deferred);

        // Still inside the window: still nothing.
        let step = apply_probe(&mut desc, fail(ProbeErrorKind::Timeout), until - 1);
        assert!(!step.restart_requested);

        // First failure after the window: exactly one notification.
        let step = apply_probe(&mut desc, fail(ProbeErrorKind::Timeout), until);
        assert!(step.restart_requested);
        let step = apply_probe(&mut desc, fail(ProbeErrorKind::Timeout), until + 1);
        assert!(!step.restart_requested);
    }

    #[test]
    fn begin_restart_during_backoff_defers() {
        let mut desc = unhealthy();
        desc.backoff_until = Some(T0 + 100);
        assert_eq!(begin_restart(&mut desc, T0), RestartGate::Skip(SkipReason::Backoff));
        assert!(desc.restart_deferred);
        assert_eq!(desc.current_state, ServiceState::Unhealthy);
    }

    #[test]
    fn budget_exhaustion_opens_the_circuit() {
        let mut desc = unhealthy();
        let mut now = T0;
        let mut delays = Vec::new();

        for attempt in 1..=3 {
            match begin_restart(&mut desc, now) {
                RestartGate::Proceed { attempt: n, delay_ms } => {
                    assert_eq!(n, attempt);
                    delays.push(delay_ms);
                }
                other => panic!("attempt {attempt}: unexpected {other:?}"),
            }
            complete_restart(&mut desc);
            now = desc.backoff_until.unwrap();
            for _ in 0..3 {
                apply_probe(&mut desc, fail(ProbeErrorKind::ConnectionFailed), now);
            }
            assert_eq!(desc.current_state, ServiceState::Unhealthy);
        }
        assert_eq!(delays, vec![1_000, 2_000, 4_000]);

        assert_eq!(begin_restart(&mut desc, now), RestartGate::Exhausted { attempts: 3 });
        assert_eq!(desc.current_state, ServiceState::FailedPermanently);

        // Terminal: no more notifications or transitions.
        for _ in 0..5 {
            let step = apply_probe(&mut desc, ok(), now);
            assert_eq!(step, Step::default());
        }
        assert_eq!(
            begin_restart(&mut desc, now),
            RestartGate::Skip(SkipReason::NotUnhealthy)
        );
        assert_eq!(desc.current_state, ServiceState::FailedPermanently);
    }

    #[test]
    fn reset_only_clears_failed_permanently() {
        let mut desc = unhealthy();
        assert!(!reset(&mut desc));

        desc.policy.max_restart_attempts = 0;
        assert_eq!(begin_restart(&mut desc, T0), RestartGate::Exhausted { attempts: 0 });
        assert!(reset(&mut desc));
        assert_eq!(desc.current_state, ServiceState::Unknown);
        assert_eq!(desc.restart_attempts, 0);

        apply_probe(&mut desc, ok(), T0);
        assert_eq!(desc.current_state, ServiceState::Healthy);
    }

    #[derive(Clone, Copy, Debug)]
    enum Action {
        Ok,
        Fail,
        Begin,
        Complete,
    }

    /// Every sequence of up to seven actions only ever takes listed edges.
    #[test]
    fn exhaustive_sequences_stay_on_edges() {
        const ACTIONS: [Action; 4] = [Action::Ok, Action::Fail, Action::Begin, Action::Complete];
        const LEN: u32 = 7;

        for code in 0..4usize.pow(LEN) {
            let mut desc = descriptor();
            desc.policy.failure_threshold = 2;
            desc.policy.max_restart_attempts = 2;
            desc.policy.backoff_base_ms = 0;
            desc.policy.backoff_max_ms = 0;

            let mut c = code;
            let mut trace = Vec::new();
            for tick in 0..LEN {
                let action = ACTIONS[c % 4];
                c /= 4;
                trace.push(action);

                let before = desc.current_state;
                let now = T0 + tick as u64;
                match action {
                    Action::Ok => {
                        apply_probe(&mut desc, ok(), now);
                    }
                    Action::Fail => {
                        apply_probe(&mut desc, fail(ProbeErrorKind::Timeout), now);
                    }
                    Action::Begin => {
                        begin_restart(&mut desc, now);
                    }
                    Action::Complete => {
                        complete_restart(&mut desc);
                    }
                }
                let after = desc.current_state;
                assert!(
                    before == after || is_edge(before, after),
                    "illegal edge {before} -> {after} after {trace:?}"
                );
            }
        }
    }
}
