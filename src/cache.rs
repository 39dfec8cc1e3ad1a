//! In-memory status cache, the only mutable resource shared across the
//! scheduled-tick, watch-callback and command-dispatch tasks.
//!
//! Ordering and suppression are resolved by the reconciler before anything
//! reaches `save`; the cache itself is plain last-write-wins. All reads
//! return clones so callers never mutate shared entries in place.

use crate::model::{CamelStatus, ContainerStatus, DeploymentStatus, GroupedKey, ServiceStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct CacheMaps {
    containers: HashMap<GroupedKey, ContainerStatus>,
    deployments: HashMap<GroupedKey, DeploymentStatus>,
    services: HashMap<GroupedKey, ServiceStatus>,
    camels: HashMap<GroupedKey, CamelStatus>,
}

#[derive(Clone, Default)]
pub struct StatusCache {
    inner: Arc<RwLock<CacheMaps>>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn save_container(&self, status: ContainerStatus) {
        let mut maps = self.inner.write().await;
        maps.containers.insert(status.grouped_key(), status);
    }

    pub async fn get_container(&self, key: &GroupedKey) -> Option<ContainerStatus> {
        let maps = self.inner.read().await;
        maps.containers.get(key).cloned()
    }

    pub async fn get_all_containers(&self) -> Vec<ContainerStatus> {
        let maps = self.inner.read().await;
        maps.containers.values().cloned().collect()
    }

    pub async fn get_containers_by_env(&self, environment: &str) -> Vec<ContainerStatus> {
        let maps = self.inner.read().await;
        maps.containers
            .values()
            .filter(|s| s.environment == environment)
            .cloned()
            .collect()
    }

    pub async fn get_containers_by_project_and_env(
        &self,
        project_id: &str,
        environment: &str,
    ) -> Vec<ContainerStatus> {
        let maps = self.inner.read().await;
        maps.containers
            .values()
            .filter(|s| s.project_id == project_id && s.environment == environment)
            .cloned()
            .collect()
    }

    pub async fn delete_container(&self, key: &GroupedKey) -> Option<ContainerStatus> {
        let mut maps = self.inner.write().await;
        maps.containers.remove(key)
    }

    pub async fn save_deployment(&self, status: DeploymentStatus) {
        let mut maps = self.inner.write().await;
        maps.deployments.insert(status.grouped_key(), status);
    }

    pub async fn get_deployments_by_env(&self, environment: &str) -> Vec<DeploymentStatus> {
        let maps = self.inner.read().await;
        maps.deployments
            .values()
            .filter(|s| s.environment == environment)
            .cloned()
            .collect()
    }

    pub async fn delete_deployment(&self, key: &GroupedKey) {
        let mut maps = self.inner.write().await;
        maps.deployments.remove(key);
    }

    pub async fn save_service(&self, status: ServiceStatus) {
        let mut maps = self.inner.write().await;
        maps.services.insert(status.grouped_key(), status);
    }

    pub async fn get_services_by_env(&self, environment: &str) -> Vec<ServiceStatus> {
        let maps = self.inner.read().await;
        maps.services
            .values()
            .filter(|s| s.environment == environment)
            .cloned()
            .collect()
    }

    pub async fn delete_service(&self, key: &GroupedKey) {
        let mut maps = self.inner.write().await;
        maps.services.remove(key);
    }

    pub async fn save_camel(&self, status: CamelStatus) {
        let mut maps = self.inner.write().await;
        maps.camels.insert(status.grouped_key(), status);
    }

    pub async fn get_camel(&self, key: &GroupedKey) -> Option<CamelStatus> {
        let maps = self.inner.read().await;
        maps.camels.get(key).cloned()
    }

    /// A deleted container cannot have a meaningful application-level status;
    /// drop every camel entry for its project/environment.
    pub async fn delete_camel_for_project(&self, project_id: &str, environment: &str) {
        let mut maps = self.inner.write().await;
        maps.camels
            .retain(|_, s| !(s.project_id == project_id && s.environment == environment));
    }

    /// Administrative "reset all statuses".
    pub async fn clear_all(&self) {
        let mut maps = self.inner.write().await;
        maps.containers.clear();
        maps.deployments.clear();
        maps.services.clear();
        maps.camels.clear();
    }
}
