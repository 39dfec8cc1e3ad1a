//! User command dispatch: run/pause/stop/delete/deploy translated into
//! backend calls, with the status marked "in transit" before the backend
//! confirms anything.

use crate::cache::StatusCache;
use crate::error::CaravelError;
use crate::events::{FanOut, StatusEvent};
use crate::model::{
    commands_for_state, ContainerCommand, ContainerState, ContainerStatus, ContainerType,
    GroupedKey,
};
use bollard::query_parameters::{
    RemoveContainerOptions, StartContainerOptions, StopContainerOptionsBuilder,
};
use bollard::Docker;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::{Api, Client};
use log::info;

/// The backend calls the dispatcher needs; one implementation per deployment
/// mode, selected once at startup.
pub trait ContainerBackend: Send + Sync + 'static {
    fn issue(
        &self,
        status: &ContainerStatus,
        command: ContainerCommand,
    ) -> impl Future<Output = Result<(), CaravelError>> + Send;
}

pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

impl ContainerBackend for DockerBackend {
    async fn issue(
        &self,
        status: &ContainerStatus,
        command: ContainerCommand,
    ) -> Result<(), CaravelError> {
        let name = &status.container_name;
        match command {
            ContainerCommand::Run => {
                if status.state == ContainerState::Paused {
                    self.docker.unpause_container(name).await?;
                } else {
                    self.docker
                        .start_container(name, None::<StartContainerOptions>)
                        .await?;
                }
            }
            ContainerCommand::Pause => self.docker.pause_container(name).await?,
            ContainerCommand::Stop => {
                let options = StopContainerOptionsBuilder::new().t(10).build();
                self.docker.stop_container(name, Some(options)).await?;
            }
            ContainerCommand::Delete => {
                self.docker
                    .remove_container(
                        name,
                        Some(RemoveContainerOptions {
                            force: true,
                            ..Default::default()
                        }),
                    )
                    .await?;
            }
            ContainerCommand::Deploy => {
                return Err(CaravelError::UnsupportedCommand(command));
            }
        }
        Ok(())
    }
}

pub struct KubernetesBackend {
    client: Client,
    namespace: String,
}

impl KubernetesBackend {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

impl ContainerBackend for KubernetesBackend {
    async fn issue(
        &self,
        status: &ContainerStatus,
        command: ContainerCommand,
    ) -> Result<(), CaravelError> {
        match command {
            // removing the pod is how both stop and delete look on Kubernetes;
            // a deployment-managed pod comes back, a devmode pod does not
            ContainerCommand::Stop | ContainerCommand::Delete => {
                let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
                pods.delete(&status.container_name, &DeleteParams::default())
                    .await?;
                Ok(())
            }
            ContainerCommand::Deploy => {
                let deployments: Api<Deployment> =
                    Api::namespaced(self.client.clone(), &self.namespace);
                let patch = serde_json::json!({
                    "spec": {
                        "template": {
                            "metadata": {
                                "annotations": {
                                    "caravel.dev/restartedAt": Utc::now().to_rfc3339()
                                }
                            }
                        }
                    }
                });
                deployments
                    .patch(
                        &status.project_id,
                        &PatchParams::default(),
                        &Patch::Merge(&patch),
                    )
                    .await?;
                Ok(())
            }
            ContainerCommand::Run | ContainerCommand::Pause => {
                Err(CaravelError::UnsupportedCommand(command))
            }
        }
    }
}

pub struct CommandDispatcher<B: ContainerBackend> {
    cache: StatusCache,
    fanout: FanOut,
    backend: B,
    environment: String,
}

impl<B: ContainerBackend> CommandDispatcher<B> {
    pub fn new(cache: StatusCache, fanout: FanOut, backend: B, environment: String) -> Self {
        Self {
            cache,
            fanout,
            backend,
            environment,
        }
    }

    /// Issues one user command. The pending status is cached and broadcast
    /// before the backend call so the UI shows the transition immediately;
    /// if the backend rejects the call the flag self-heals through the next
    /// observation or the cleanup sweep, never through explicit rollback.
    pub async fn manage(
        &self,
        project_id: &str,
        container_type: ContainerType,
        container_name: &str,
        command: ContainerCommand,
    ) -> Result<(), CaravelError> {
        let key = GroupedKey::new(project_id, &self.environment, container_name);
        let mut status = match self.cache.get_container(&key).await {
            Some(existing) => existing,
            None => ContainerStatus::pending(
                project_id,
                &self.environment,
                container_name,
                container_type,
            ),
        };
        status.in_transit = true;
        status.init_date = Utc::now();
        status.commands = commands_for_state(status.state);

        self.cache.save_container(status.clone()).await;
        self.fanout.publish(StatusEvent::Updated(status.clone()));
        info!("issuing {command} for {container_name} in {}", self.environment);

        self.backend.issue(&status, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingBackend {
        issued: Arc<Mutex<Vec<(String, ContainerCommand)>>>,
        fail: bool,
    }

    impl ContainerBackend for RecordingBackend {
        async fn issue(
            &self,
            status: &ContainerStatus,
            command: ContainerCommand,
        ) -> Result<(), CaravelError> {
            self.issued
                .lock()
                .unwrap()
                .push((status.container_name.clone(), command));
            if self.fail {
                return Err(CaravelError::BackendUnreachable("test".to_string()));
            }
            Ok(())
        }
    }

    fn dispatcher(
        cache: StatusCache,
        fanout: FanOut,
        backend: RecordingBackend,
    ) -> CommandDispatcher<RecordingBackend> {
        CommandDispatcher::new(cache, fanout, backend, "dev".to_string())
    }

    #[tokio::test]
    async fn test_manage_synthesizes_pending_status_before_backend_call() {
        let cache = StatusCache::new();
        let mut fanout = FanOut::new();
        let mut events = fanout.subscribe(8);
        let backend = RecordingBackend::default();
        let dispatcher = dispatcher(cache.clone(), fanout, backend.clone());

        dispatcher
            .manage(
                "orders",
                ContainerType::Devmode,
                "orders-devmode",
                ContainerCommand::Run,
            )
            .await
            .unwrap();

        let key = GroupedKey::new("orders", "dev", "orders-devmode");
        let cached = cache.get_container(&key).await.unwrap();
        assert!(cached.in_transit);
        assert!(cached.container_id.is_none());

        match events.recv().await {
            Some(StatusEvent::Updated(status)) => assert!(status.in_transit),
            other => panic!("expected updated event, got {other:?}"),
        }
        assert_eq!(
            backend.issued.lock().unwrap().as_slice(),
            &[("orders-devmode".to_string(), ContainerCommand::Run)]
        );
    }

    #[tokio::test]
    async fn test_transit_marker_survives_backend_failure() {
        let cache = StatusCache::new();
        let backend = RecordingBackend {
            fail: true,
            ..Default::default()
        };
        let dispatcher = dispatcher(cache.clone(), FanOut::new(), backend);

        let result = dispatcher
            .manage(
                "orders",
                ContainerType::Devmode,
                "orders-devmode",
                ContainerCommand::Stop,
            )
            .await;
        assert!(result.is_err());

        // no rollback: the marker stays until an observation corrects it
        let key = GroupedKey::new("orders", "dev", "orders-devmode");
        assert!(cache.get_container(&key).await.unwrap().in_transit);
    }
}
