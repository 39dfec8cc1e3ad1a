//! Reconciliation of freshly observed statuses against the cache.
//!
//! Every observation from either backend flows through one channel into a
//! single reconciler task, which keeps per-key ordering trivially and makes
//! the merge the only writer of container entries.

use crate::cache::StatusCache;
use crate::events::{FanOut, StatusEvent};
use crate::model::{
    commands_for_state, ContainerStatus, DeploymentStatus, GroupedKey, ServiceStatus,
};
use crate::telemetry::{EMPTY_CPU, EMPTY_MEMORY};
use chrono::{DateTime, Utc};
use log::{debug, info};
use tokio::sync::mpsc;

/// One normalized backend observation.
#[derive(Debug, Clone)]
pub enum Observation {
    Upsert(ContainerStatus),
    Delete {
        project_id: String,
        environment: String,
        container_name: String,
    },
    Deployment(DeploymentStatus),
    DeploymentDeleted(GroupedKey),
    Service(ServiceStatus),
    ServiceDeleted(GroupedKey),
}

/// Merge rule of the engine, kept pure so every branch is unit-testable.
/// Returns `None` when the observation must be dropped.
pub fn merge(
    mut new: ContainerStatus,
    old: Option<&ContainerStatus>,
    now: DateTime<Utc>,
) -> Option<ContainerStatus> {
    let Some(old) = old else {
        // first observation
        new.commands = commands_for_state(new.state);
        return Some(new);
    };

    if old.in_transit {
        let real_transition = old.state != new.state;
        let stats_only = !new.cpu_info.is_empty();
        // Stats-only noise must not clear the "awaiting confirmation" flag
        // before the actual state change lands.
        if !real_transition && stats_only {
            return None;
        }
    }

    if new.state.is_terminal() {
        if old.finished.is_some() {
            // already finalized, never resurrect with stale data
            return None;
        }
        new.finished = Some(now);
        new.memory_info = EMPTY_MEMORY.to_string();
        new.cpu_info = EMPTY_CPU.to_string();
    } else {
        // finished is write-once even when a non-terminal state comes in later
        new.finished = old.finished;
        if new.cpu_info.is_empty() {
            // telemetry gaps must not erase last-known values
            new.cpu_info = old.cpu_info.clone();
            new.memory_info = old.memory_info.clone();
        }
    }

    new.commands = commands_for_state(new.state);
    Some(new)
}

#[derive(Clone)]
pub struct Reconciler {
    cache: StatusCache,
    fanout: FanOut,
}

impl Reconciler {
    pub fn new(cache: StatusCache, fanout: FanOut) -> Self {
        Self { cache, fanout }
    }

    /// Consumes observations until every producer hangs up.
    pub async fn run(self, mut rx: mpsc::Receiver<Observation>) {
        while let Some(observation) = rx.recv().await {
            self.apply(observation).await;
        }
        info!("reconciler stopped");
    }

    pub async fn apply(&self, observation: Observation) {
        match observation {
            Observation::Upsert(status) => self.observe(status).await,
            Observation::Delete {
                project_id,
                environment,
                container_name,
            } => {
                self.observe_deleted(&project_id, &environment, &container_name)
                    .await
            }
            Observation::Deployment(status) => self.cache.save_deployment(status).await,
            Observation::DeploymentDeleted(key) => self.cache.delete_deployment(&key).await,
            Observation::Service(status) => self.cache.save_service(status).await,
            Observation::ServiceDeleted(key) => self.cache.delete_service(&key).await,
        }
    }

    async fn observe(&self, new: ContainerStatus) {
        let key = new.grouped_key();
        let old = self.cache.get_container(&key).await;
        match merge(new, old.as_ref(), Utc::now()) {
            Some(merged) => {
                self.cache.save_container(merged.clone()).await;
                self.fanout.publish(StatusEvent::Updated(merged));
            }
            None => debug!("dropped observation for {}/{}", key.group, key.key),
        }
    }

    async fn observe_deleted(&self, project_id: &str, environment: &str, container_name: &str) {
        let key = GroupedKey::new(project_id, environment, container_name);
        if self.cache.delete_container(&key).await.is_some() {
            self.cache
                .delete_camel_for_project(project_id, environment)
                .await;
            let identity = ContainerStatus::identity(project_id, environment, container_name);
            self.fanout.publish(StatusEvent::Deleted(identity));
            info!("container {container_name} removed from {environment}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContainerCommand, ContainerState, ContainerType};

    fn observed(state: ContainerState, cpu: &str) -> ContainerStatus {
        let mut status = ContainerStatus::new(
            "orders",
            "dev",
            "orders-devmode",
            ContainerType::Devmode,
            state,
        );
        status.cpu_info = cpu.to_string();
        status
    }

    #[test]
    fn test_first_observation_is_inserted() {
        let new = observed(ContainerState::Created, "");
        let merged = merge(new.clone(), None, Utc::now()).unwrap();
        assert_eq!(merged.state, ContainerState::Created);
        assert_eq!(
            merged.commands,
            vec![ContainerCommand::Run, ContainerCommand::Delete]
        );
    }

    #[test]
    fn test_reobservation_is_idempotent() {
        let now = Utc::now();
        let first = merge(observed(ContainerState::Running, ""), None, now).unwrap();
        let second = merge(observed(ContainerState::Running, ""), Some(&first), now).unwrap();
        assert_eq!(first, second);

        // terminal: second apply is dropped entirely, cache stays as-is
        let first = merge(observed(ContainerState::Exited, ""), None, now).unwrap();
        let stamped = merge(observed(ContainerState::Exited, ""), Some(&first), now).unwrap();
        assert!(stamped.finished.is_some());
        let third = merge(observed(ContainerState::Exited, ""), Some(&stamped), now);
        assert!(third.is_none());
    }

    #[test]
    fn test_finalization_is_one_way() {
        let now = Utc::now();
        let running = merge(observed(ContainerState::Running, ""), None, now).unwrap();
        let exited = merge(observed(ContainerState::Exited, ""), Some(&running), now).unwrap();
        let finished = exited.finished.unwrap();
        assert_eq!(exited.memory_info, EMPTY_MEMORY);
        assert_eq!(exited.cpu_info, EMPTY_CPU);

        // a later non-terminal observation may update state but never finished
        let resurrected = merge(observed(ContainerState::Running, ""), Some(&exited), now).unwrap();
        assert_eq!(resurrected.finished, Some(finished));

        // and a later terminal observation is dropped outright
        assert!(merge(observed(ContainerState::Dead, ""), Some(&exited), now).is_none());
    }

    #[test]
    fn test_transit_suppression_drops_stats_only_updates() {
        let mut old = observed(ContainerState::Running, "");
        old.in_transit = true;

        // same state, fresh telemetry → dropped
        let stats_only = observed(ContainerState::Running, "12%");
        assert!(merge(stats_only, Some(&old), Utc::now()).is_none());

        // real transition overrides suppression
        let transition = observed(ContainerState::Exited, "");
        let merged = merge(transition, Some(&old), Utc::now()).unwrap();
        assert_eq!(merged.state, ContainerState::Exited);
        assert!(!merged.in_transit);

        // same state without telemetry clears the flag on the next real pass
        let plain = observed(ContainerState::Running, "");
        let merged = merge(plain, Some(&old), Utc::now()).unwrap();
        assert!(!merged.in_transit);
    }

    #[test]
    fn test_telemetry_gap_carries_last_known_values() {
        let mut old = observed(ContainerState::Running, "12.00%");
        old.memory_info = "100.00MiB/1.00GiB".to_string();

        let merged = merge(observed(ContainerState::Running, ""), Some(&old), Utc::now()).unwrap();
        assert_eq!(merged.cpu_info, "12.00%");
        assert_eq!(merged.memory_info, "100.00MiB/1.00GiB");

        let merged = merge(
            observed(ContainerState::Running, "14.00%"),
            Some(&old),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(merged.cpu_info, "14.00%");
    }

    #[tokio::test]
    async fn test_delete_cascades_to_camel_statuses() {
        let cache = StatusCache::new();
        let mut fanout = FanOut::new();
        let mut events = fanout.subscribe(8);
        let reconciler = Reconciler::new(cache.clone(), fanout);

        reconciler
            .apply(Observation::Upsert(observed(ContainerState::Running, "")))
            .await;
        cache
            .save_camel(crate::model::CamelStatus {
                project_id: "orders".to_string(),
                environment: "dev".to_string(),
                container_name: "orders-devmode".to_string(),
                values: Vec::new(),
            })
            .await;

        reconciler
            .apply(Observation::Delete {
                project_id: "orders".to_string(),
                environment: "dev".to_string(),
                container_name: "orders-devmode".to_string(),
            })
            .await;

        let key = GroupedKey::new("orders", "dev", "orders-devmode");
        assert!(cache.get_container(&key).await.is_none());
        assert!(cache.get_camel(&key).await.is_none());

        assert!(matches!(events.recv().await, Some(StatusEvent::Updated(_))));
        assert!(matches!(events.recv().await, Some(StatusEvent::Deleted(_))));
    }
}
