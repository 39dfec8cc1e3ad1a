//! Kubernetes backend observer: three label-scoped watches (Pod, Deployment,
//! Service) plus a periodic full resync, feeding the reconciler channel.

use crate::config::Config;
use crate::error::CaravelError;
use crate::health::Health;
use crate::model::{
    ContainerState, ContainerStatus, ContainerType, DeploymentStatus, GroupedKey, ServiceStatus,
    LABEL_COMMIT, LABEL_PROJECT_ID, LABEL_RUNTIME, LABEL_TYPE,
};
use crate::reconcile::Observation;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ListParams;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Only resources carrying the runtime marker are observed.
fn runtime_selector() -> String {
    LABEL_RUNTIME.to_string()
}

pub struct KubernetesObserver {
    client: Client,
    namespace: String,
    environment: String,
    resync_interval: Duration,
    tx: mpsc::Sender<Observation>,
    health: Health,
}

impl KubernetesObserver {
    pub async fn connect(
        config: &Config,
        tx: mpsc::Sender<Observation>,
        health: Health,
    ) -> Result<Self, CaravelError> {
        let client = Client::try_default().await?;
        health.set_backend(true);
        Ok(Self {
            client,
            namespace: config.namespace.clone().unwrap_or_else(|| "default".to_string()),
            environment: config.environment.clone(),
            resync_interval: Duration::from_secs(config.poll.resync_interval),
            tx,
            health,
        })
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Watches pods until the observation channel closes. The watcher
    /// auto-reconnects with backoff on most errors.
    pub async fn watch_pods(&self) {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let config = watcher::Config::default().labels(&runtime_selector());
        info!("starting pod watch in {}", self.namespace);

        let mut stream = watcher(api, config).default_backoff().boxed();
        while let Some(result) = stream.next().await {
            match result {
                Ok(watcher::Event::Apply(pod)) | Ok(watcher::Event::InitApply(pod)) => {
                    if let Some(status) = normalize_pod(&pod, &self.environment) {
                        if self.tx.send(Observation::Upsert(status)).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(watcher::Event::Delete(pod)) => {
                    // the resource is gone; only identity fields are needed
                    if let Some((project_id, name)) = pod_identity(&pod) {
                        let _ = self
                            .tx
                            .send(Observation::Delete {
                                project_id,
                                environment: self.environment.clone(),
                                container_name: name,
                            })
                            .await;
                    }
                }
                Ok(watcher::Event::Init) => {}
                Ok(watcher::Event::InitDone) => self.health.set_watch_established("pods"),
                Err(e) => {
                    self.health.set_watch_lost("pods");
                    error!("pod watch error: {e:?}");
                }
            }
        }
    }

    pub async fn watch_deployments(&self) {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let config = watcher::Config::default().labels(&runtime_selector());
        info!("starting deployment watch in {}", self.namespace);

        let mut stream = watcher(api, config).default_backoff().boxed();
        while let Some(result) = stream.next().await {
            match result {
                Ok(watcher::Event::Apply(deployment))
                | Ok(watcher::Event::InitApply(deployment)) => {
                    if let Some(status) = normalize_deployment(&deployment, &self.environment) {
                        if self.tx.send(Observation::Deployment(status)).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(watcher::Event::Delete(deployment)) => {
                    if let Some((project_id, name)) = meta_identity(&deployment.metadata) {
                        let key = GroupedKey::new(&project_id, &self.environment, &name);
                        let _ = self.tx.send(Observation::DeploymentDeleted(key)).await;
                    }
                }
                Ok(watcher::Event::Init) => {}
                Ok(watcher::Event::InitDone) => self.health.set_watch_established("deployments"),
                Err(e) => {
                    self.health.set_watch_lost("deployments");
                    error!("deployment watch error: {e:?}");
                }
            }
        }
    }

    pub async fn watch_services(&self) {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let config = watcher::Config::default().labels(&runtime_selector());
        info!("starting service watch in {}", self.namespace);

        let mut stream = watcher(api, config).default_backoff().boxed();
        while let Some(result) = stream.next().await {
            match result {
                Ok(watcher::Event::Apply(service)) | Ok(watcher::Event::InitApply(service)) => {
                    if let Some(status) = normalize_service(&service, &self.environment) {
                        if self.tx.send(Observation::Service(status)).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(watcher::Event::Delete(service)) => {
                    if let Some((project_id, name)) = meta_identity(&service.metadata) {
                        let key = GroupedKey::new(&project_id, &self.environment, &name);
                        let _ = self.tx.send(Observation::ServiceDeleted(key)).await;
                    }
                }
                Ok(watcher::Event::Init) => {}
                Ok(watcher::Event::InitDone) => self.health.set_watch_established("services"),
                Err(e) => {
                    self.health.set_watch_lost("services");
                    error!("service watch error: {e:?}");
                }
            }
        }
    }

    /// Full re-list of pods, deployments and services on top of the push
    /// updates; corrects anything a dropped watch event might have left
    /// behind.
    pub async fn run_resync_loop(&self) {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let params = ListParams::default().labels(&runtime_selector());
        let mut interval = tokio::time::interval(self.resync_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match pods.list(&params).await {
                Ok(listed) => {
                    for pod in listed {
                        if let Some(status) = normalize_pod(&pod, &self.environment) {
                            if self.tx.send(Observation::Upsert(status)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => warn!("pod resync failed: {e:?}"),
            }
            match deployments.list(&params).await {
                Ok(listed) => {
                    for deployment in listed {
                        if let Some(status) = normalize_deployment(&deployment, &self.environment)
                        {
                            if self.tx.send(Observation::Deployment(status)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => warn!("deployment resync failed: {e:?}"),
            }
            match services.list(&params).await {
                Ok(listed) => {
                    for service in listed {
                        if let Some(status) = normalize_service(&service, &self.environment) {
                            if self.tx.send(Observation::Service(status)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => warn!("service resync failed: {e:?}"),
            }
        }
    }
}

fn meta_identity(
    metadata: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
) -> Option<(String, String)> {
    let name = metadata.name.clone()?;
    let project_id = metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(LABEL_PROJECT_ID))
        .cloned()
        .unwrap_or_else(|| name.clone());
    Some((project_id, name))
}

fn pod_identity(pod: &Pod) -> Option<(String, String)> {
    meta_identity(&pod.metadata)
}

/// Maps a pod record to the common status shape. Phase maps onto the Docker
/// state vocabulary; the `Ready` condition is tracked separately and never
/// folded into `state`.
pub fn normalize_pod(pod: &Pod, environment: &str) -> Option<ContainerStatus> {
    let name = pod.metadata.name.clone()?;
    let labels: std::collections::HashMap<String, String> = pod
        .metadata
        .labels
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect();
    let project_id = labels
        .get(LABEL_PROJECT_ID)
        .cloned()
        .unwrap_or_else(|| name.clone());
    let container_type = ContainerType::from_label(labels.get(LABEL_TYPE).map(String::as_str));

    let phase = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.clone());
    let state = match phase.as_deref() {
        Some("Running") => ContainerState::Running,
        Some("Failed") => ContainerState::Dead,
        Some("Succeeded") => ContainerState::Exited,
        _ => ContainerState::Created,
    };
    let ready = pod.status.as_ref().and_then(|status| {
        status.conditions.as_ref().map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
    });

    let mut status = ContainerStatus::new(&project_id, environment, &name, container_type, state);
    status.phase = phase;
    status.ready = ready;
    status.pod_ip = pod.status.as_ref().and_then(|s| s.pod_ip.clone());
    status.image = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.containers.first())
        .and_then(|container| container.image.clone());
    status.created = pod.metadata.creation_timestamp.clone().map(|time| time.0);
    status.commit = labels.get(LABEL_COMMIT).cloned();
    status.camel_runtime = labels.get(LABEL_RUNTIME).cloned();
    status.labels = labels;
    Some(status)
}

pub fn normalize_deployment(deployment: &Deployment, environment: &str) -> Option<DeploymentStatus> {
    let (project_id, name) = meta_identity(&deployment.metadata)?;
    let status = deployment.status.as_ref();
    Some(DeploymentStatus {
        project_id,
        environment: environment.to_string(),
        name,
        image: deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.template.spec.as_ref())
            .and_then(|pod_spec| pod_spec.containers.first())
            .and_then(|container| container.image.clone()),
        replicas: status.and_then(|s| s.replicas).unwrap_or(0),
        ready_replicas: status.and_then(|s| s.ready_replicas).unwrap_or(0),
        unavailable_replicas: status.and_then(|s| s.unavailable_replicas).unwrap_or(0),
    })
}

pub fn normalize_service(service: &Service, environment: &str) -> Option<ServiceStatus> {
    let (project_id, name) = meta_identity(&service.metadata)?;
    let spec = service.spec.as_ref();
    let port = spec.and_then(|s| s.ports.as_ref()).and_then(|ports| ports.first());
    Some(ServiceStatus {
        project_id,
        environment: environment.to_string(),
        name,
        port: port.map(|p| p.port),
        target_port: port.and_then(|p| p.target_port.as_ref()).map(|t| match t {
            IntOrString::Int(value) => value.to_string(),
            IntOrString::String(value) => value.clone(),
        }),
        cluster_ip: spec.and_then(|s| s.cluster_ip.clone()),
        service_type: spec.and_then(|s| s.type_.clone()),
    })
}
