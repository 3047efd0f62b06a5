//! Component health probes and aggregation.

use chrono::Utc;

use vigil_core::types::{ComponentHealth, ComponentState, HealthStatus};
use vigil_store::SnapshotStore;

use crate::resilience::{BreakerState, CircuitBreaker};
use crate::scheduler::Scheduler;

pub fn component(name: &str, state: ComponentState, message: Option<String>) -> ComponentHealth {
    ComponentHealth {
        name: name.to_string(),
        state,
        message,
        checked_at: Utc::now(),
    }
}

/// Probe storage connectivity.
pub async fn probe_storage(store: &dyn SnapshotStore) -> ComponentHealth {
    match store.probe().await {
        Ok(()) => component("storage", ComponentState::Healthy, None),
        Err(e) => {
            tracing::warn!(error = %e, "Storage probe failed");
            component("storage", ComponentState::Unhealthy, Some(e.to_string()))
        }
    }
}

/// Report on the scheduler's dispatch loop.
pub fn scheduler_health(scheduler: &Scheduler) -> ComponentHealth {
    if scheduler.is_running() {
        component("scheduler", ComponentState::Healthy, None)
    } else {
        component(
            "scheduler",
            ComponentState::Unhealthy,
            Some("dispatch loop not running".to_string()),
        )
    }
}

/// Report on the storage circuit breaker.
pub fn breaker_health(breaker: &CircuitBreaker) -> ComponentHealth {
    match breaker.state() {
        BreakerState::Closed => component("storage-circuit", ComponentState::Healthy, None),
        BreakerState::HalfOpen => component(
            "storage-circuit",
            ComponentState::Degraded,
            Some("trial call in flight".to_string()),
        ),
        BreakerState::Open => component(
            "storage-circuit",
            ComponentState::Degraded,
            Some("open, rejecting storage operations".to_string()),
        ),
    }
}

/// Aggregate component reports into one status. A failing component
/// degrades the monitor without stopping it; only a fully failed set reads
/// as unhealthy.
pub fn aggregate(components: Vec<ComponentHealth>) -> HealthStatus {
    let state = if components
        .iter()
        .all(|c| c.state == ComponentState::Healthy)
    {
        ComponentState::Healthy
    } else if components
        .iter()
        .all(|c| c.state == ComponentState::Unhealthy)
    {
        ComponentState::Unhealthy
    } else {
        ComponentState::Degraded
    };

    HealthStatus {
        state,
        components,
        checked_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_healthy_aggregates_healthy() {
        let status = aggregate(vec![
            component("a", ComponentState::Healthy, None),
            component("b", ComponentState::Healthy, None),
        ]);
        assert_eq!(status.state, ComponentState::Healthy);
    }

    #[test]
    fn one_failure_degrades() {
        let status = aggregate(vec![
            component("a", ComponentState::Healthy, None),
            component("b", ComponentState::Unhealthy, Some("down".to_string())),
        ]);
        assert_eq!(status.state, ComponentState::Degraded);
    }

    #[test]
    fn total_failure_is_unhealthy() {
        let status = aggregate(vec![
            component("a", ComponentState::Unhealthy, None),
            component("b", ComponentState::Unhealthy, None),
        ]);
        assert_eq!(status.state, ComponentState::Unhealthy);
    }

    #[test]
    fn empty_component_list_is_healthy() {
        let status = aggregate(vec![]);
        assert_eq!(status.state, ComponentState::Healthy);
    }
}
