//! Docker backend observer: a status job, a statistics job and a lifecycle
//! event stream, all feeding the reconciler channel.

use crate::cache::StatusCache;
use crate::config::Config;
use crate::error::CaravelError;
use crate::events::LifecycleEvent;
use crate::health::Health;
use crate::model::{
    ContainerState, ContainerStatus, ContainerType, GroupedKey, PortMapping, LABEL_COMMIT,
    LABEL_PROJECT_ID, LABEL_RUNTIME, LABEL_TYPE,
};
use crate::reconcile::Observation;
use crate::telemetry::{format_cpu, format_memory, CpuSampleTable, StatsSample};
use bollard::models::{ContainerSummary, ContainerSummaryStateEnum, PortTypeEnum};
use bollard::query_parameters::{
    CreateImageOptions, EventsOptions, ListContainersOptionsBuilder, StatsOptionsBuilder,
};
use bollard::Docker;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::MissedTickBehavior;

const STATS_TIMEOUT: Duration = Duration::from_secs(2);

/// Copies project sources into a freshly started devmode container. The
/// observer only decides when a sync is due; the dashboard's project file
/// service supplies the implementation at wiring time.
pub trait CodeSync: Send + Sync + 'static {
    fn sync(&self, container_name: &str) -> impl Future<Output = Result<(), CaravelError>> + Send;
}

/// Side-effect a lifecycle event resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEffect {
    PullImage(String),
    SyncCode(String),
}

pub fn lifecycle_effect(event: &LifecycleEvent) -> Option<LifecycleEffect> {
    match event {
        LifecycleEvent::BuildExited {
            image: Some(image), ..
        } => Some(LifecycleEffect::PullImage(image.clone())),
        // a build event without an image reference has nothing to pull
        LifecycleEvent::BuildExited { image: None, .. } => None,
        LifecycleEvent::DevModeStarted { container_name } => {
            Some(LifecycleEffect::SyncCode(container_name.clone()))
        }
    }
}

pub struct DockerObserver {
    docker: RwLock<Docker>,
    environment: String,
    status_interval: Duration,
    stats_interval: Duration,
    transit_grace: ChronoDuration,
    tx: mpsc::Sender<Observation>,
    cache: StatusCache,
    samples: Mutex<CpuSampleTable>,
    health: Health,
}

impl DockerObserver {
    pub fn connect(
        config: &Config,
        tx: mpsc::Sender<Observation>,
        cache: StatusCache,
        health: Health,
    ) -> Result<Arc<Self>, CaravelError> {
        let docker = Docker::connect_with_socket_defaults()?;
        Ok(Arc::new(Self {
            docker: RwLock::new(docker),
            environment: config.environment.clone(),
            status_interval: Duration::from_secs(config.poll.status_interval),
            stats_interval: Duration::from_secs(config.poll.stats_interval),
            transit_grace: ChronoDuration::seconds(config.transit_grace as i64),
            tx,
            cache,
            samples: Mutex::new(CpuSampleTable::new()),
            health,
        }))
    }

    /// Startup probe. The process aborts when Docker is the selected backend
    /// and unreachable.
    pub async fn ping(&self) -> Result<(), CaravelError> {
        let docker = self.client().await;
        docker.ping().await?;
        self.health.set_backend(true);
        Ok(())
    }

    async fn client(&self) -> Docker {
        self.docker.read().await.clone()
    }

    /// A dead connection is detected on the next failed tick; the pool is
    /// torn down and lazily recreated.
    async fn reconnect(&self) {
        match Docker::connect_with_socket_defaults() {
            Ok(docker) => {
                *self.docker.write().await = docker;
                info!("docker connection recreated");
            }
            Err(e) => {
                self.health.set_backend(false);
                error!("docker reconnect failed: {e}");
            }
        }
    }

    /// Status job: list all containers, normalize and publish each, then run
    /// the cleanup sweep. Ticks never overlap; a slow tick skips the next one.
    pub async fn run_status_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.status_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(e) = self.status_tick().await {
                warn!("status tick failed: {e}");
                self.reconnect().await;
            }
        }
    }

    async fn status_tick(&self) -> Result<(), CaravelError> {
        let docker = self.client().await;
        let containers = docker
            .list_containers(Some(
                ListContainersOptionsBuilder::default().all(true).build(),
            ))
            .await?;

        let mut live_names = HashSet::new();
        for container in &containers {
            let status = normalize_container(container, &self.environment);
            live_names.insert(status.container_name.clone());
            if self.tx.send(Observation::Upsert(status)).await.is_err() {
                return Ok(());
            }
        }
        self.health.set_backend(true);

        self.sweep(&live_names).await;
        Ok(())
    }

    /// Cleanup sweep: cached entries with no backend counterpart are orphans
    /// unless they are inside the in-transit grace window.
    async fn sweep(&self, live_names: &HashSet<String>) {
        let now = Utc::now();
        let cached = self.cache.get_containers_by_env(&self.environment).await;
        for status in cached {
            if live_names.contains(&status.container_name) {
                continue;
            }
            if sweep_keeps(&status, now, self.transit_grace) {
                continue;
            }
            debug!("sweeping orphaned container {}", status.container_name);
            self.samples.lock().await.forget(&status.container_name);
            let _ = self
                .tx
                .send(Observation::Delete {
                    project_id: status.project_id,
                    environment: status.environment,
                    container_name: status.container_name,
                })
                .await;
        }
    }

    /// Statistics job: one-shot stats per running container, merged into the
    /// cached entry without touching `state`.
    pub async fn run_stats_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.stats_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(e) = self.stats_tick().await {
                warn!("stats tick failed: {e}");
            }
        }
    }

    async fn stats_tick(&self) -> Result<(), CaravelError> {
        let docker = self.client().await;
        let containers = docker
            .list_containers(Some(ListContainersOptionsBuilder::default().build()))
            .await?;

        for container in containers {
            let Some(name) = container_name(&container) else {
                continue;
            };
            let Some(id) = container.id.clone() else {
                continue;
            };
            match self.collect_stats(&docker, &id, &name).await {
                Ok((cpu_info, memory_info)) => {
                    let project_id = container
                        .labels
                        .as_ref()
                        .and_then(|labels| labels.get(LABEL_PROJECT_ID))
                        .cloned()
                        .unwrap_or_else(|| name.clone());
                    let key = GroupedKey::new(&project_id, &self.environment, &name);
                    let Some(mut cached) = self.cache.get_container(&key).await else {
                        continue;
                    };
                    cached.cpu_info = cpu_info;
                    cached.memory_info = memory_info;
                    let _ = self.tx.send(Observation::Upsert(cached)).await;
                }
                // a single failed stats call skips that container, not the tick
                Err(e) => debug!("stats unavailable for {name}: {e}"),
            }
        }
        Ok(())
    }

    async fn collect_stats(
        &self,
        docker: &Docker,
        container_id: &str,
        name: &str,
    ) -> Result<(String, String), CaravelError> {
        let options = StatsOptionsBuilder::default()
            .stream(false)
            .one_shot(false)
            .build();
        let mut stream = docker.stats(container_id, Some(options));
        let response = tokio::time::timeout(STATS_TIMEOUT, stream.next())
            .await
            .map_err(|_| CaravelError::StatsUnavailable(name.to_string()))?
            .ok_or_else(|| CaravelError::StatsUnavailable(name.to_string()))??;

        let sample = StatsSample {
            total_cpu_usage: response
                .cpu_stats
                .as_ref()
                .and_then(|cpu| cpu.cpu_usage.as_ref())
                .and_then(|usage| usage.total_usage)
                .unwrap_or(0) as u64,
            system_cpu_usage: response
                .cpu_stats
                .as_ref()
                .and_then(|cpu| cpu.system_cpu_usage)
                .unwrap_or(0) as u64,
            online_cpus: response
                .cpu_stats
                .as_ref()
                .and_then(|cpu| cpu.online_cpus)
                .unwrap_or(0) as u32,
            memory_usage: response
                .memory_stats
                .as_ref()
                .and_then(|memory| memory.usage)
                .unwrap_or(0) as u64,
            memory_limit: response
                .memory_stats
                .as_ref()
                .and_then(|memory| memory.limit)
                .unwrap_or(0) as u64,
        };

        let percent = self.samples.lock().await.cpu_percent(name, sample);
        Ok((
            format_cpu(percent),
            format_memory(sample.memory_usage, sample.memory_limit),
        ))
    }

    /// Lifecycle event stream. Only side-effect triggers come from here;
    /// status updates always go through the list-based status job.
    pub async fn run_event_loop(self: Arc<Self>, side_effects: mpsc::Sender<LifecycleEvent>) {
        loop {
            let docker = self.client().await;
            let filters =
                HashMap::from([("type".to_string(), vec!["container".to_string()])]);
            let options = EventsOptions {
                since: None,
                until: None,
                filters: Some(filters),
            };
            let mut events_stream = docker.events(Some(options));
            while let Some(event) = events_stream.next().await {
                match event {
                    Ok(event) => {
                        let action = event.action.clone().unwrap_or_default();
                        let attributes = event
                            .actor
                            .as_ref()
                            .and_then(|actor| actor.attributes.clone())
                            .unwrap_or_default();
                        let Some(name) = attributes.get("name").cloned() else {
                            continue;
                        };
                        let container_type = ContainerType::from_label(
                            attributes.get(LABEL_TYPE).map(String::as_str),
                        );
                        let trigger = match (action.as_str(), container_type) {
                            ("die", ContainerType::Build) => Some(LifecycleEvent::BuildExited {
                                container_name: name,
                                image: attributes.get("image").cloned(),
                            }),
                            ("start", ContainerType::Devmode) => {
                                Some(LifecycleEvent::DevModeStarted {
                                    container_name: name,
                                })
                            }
                            _ => None,
                        };
                        if let Some(trigger) = trigger {
                            let _ = side_effects.try_send(trigger);
                        }
                    }
                    Err(e) => {
                        warn!("docker event stream error: {e}");
                        break;
                    }
                }
            }
            // stream ended, resubscribe after a short pause
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    /// Lifecycle side-effect consumer: a finished build gets its image pulled
    /// so the packaged container starts from a fresh one; a started devmode
    /// container is handed to the code-sync collaborator.
    pub async fn run_lifecycle_effects<S: CodeSync>(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<LifecycleEvent>,
        code_sync: S,
    ) {
        while let Some(event) = rx.recv().await {
            match lifecycle_effect(&event) {
                Some(LifecycleEffect::PullImage(image)) => {
                    info!("build finished, pulling {image}");
                    if let Err(e) = self.pull_image(&image).await {
                        warn!("image pull failed for {image}: {e}");
                    }
                }
                Some(LifecycleEffect::SyncCode(container_name)) => {
                    if let Err(e) = code_sync.sync(&container_name).await {
                        warn!("code sync failed for {container_name}: {e}");
                    }
                }
                None => {}
            }
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), CaravelError> {
        let docker = self.client().await;
        // a colon in the last path segment separates the tag
        let (name, tag) = match image.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => (name.to_string(), tag.to_string()),
            _ => (image.to_string(), "latest".to_string()),
        };
        let options = CreateImageOptions {
            from_image: Some(name),
            tag: Some(tag),
            ..Default::default()
        };
        let mut pull_stream = docker.create_image(Some(options), None, None);
        while let Some(progress) = pull_stream.next().await {
            let output = progress?;
            if let Some(status) = output.status {
                debug!("pull {image}: {status}");
            }
        }
        Ok(())
    }
}

/// Grace-window predicate of the cleanup sweep: a just-issued command whose
/// container has not appeared yet is left alone.
pub fn sweep_keeps(status: &ContainerStatus, now: DateTime<Utc>, grace: ChronoDuration) -> bool {
    status.in_transit && status.container_id.is_none() && now - status.init_date < grace
}

fn container_name(summary: &ContainerSummary) -> Option<String> {
    summary
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|name| name.trim_start_matches('/').to_string())
}

/// Maps a Docker container record to the common status shape. Containers
/// without a project label are tracked under their own name.
pub fn normalize_container(summary: &ContainerSummary, environment: &str) -> ContainerStatus {
    let name = container_name(summary).unwrap_or_default();
    let labels = summary.labels.clone().unwrap_or_default();
    let project_id = labels
        .get(LABEL_PROJECT_ID)
        .cloned()
        .unwrap_or_else(|| name.clone());
    let container_type = ContainerType::from_label(labels.get(LABEL_TYPE).map(String::as_str));
    let state = match summary.state {
        Some(ContainerSummaryStateEnum::CREATED) => ContainerState::Created,
        Some(ContainerSummaryStateEnum::RUNNING) => ContainerState::Running,
        Some(ContainerSummaryStateEnum::RESTARTING) => ContainerState::Restarting,
        Some(ContainerSummaryStateEnum::PAUSED) => ContainerState::Paused,
        Some(ContainerSummaryStateEnum::EXITED) => ContainerState::Exited,
        Some(ContainerSummaryStateEnum::DEAD) => ContainerState::Dead,
        Some(ContainerSummaryStateEnum::REMOVING) => ContainerState::Dead,
        _ => ContainerState::Created,
    };

    let mut status = ContainerStatus::new(&project_id, environment, &name, container_type, state);
    status.container_id = summary.id.clone();
    status.image = summary.image.clone();
    status.created = summary
        .created
        .and_then(|secs| DateTime::from_timestamp(secs, 0));
    status.commit = labels.get(LABEL_COMMIT).cloned();
    status.camel_runtime = labels.get(LABEL_RUNTIME).cloned();
    status.ports = summary
        .ports
        .clone()
        .unwrap_or_default()
        .iter()
        .map(|port| PortMapping {
            private_port: port.private_port,
            public_port: port.public_port,
            protocol: match port.typ {
                Some(PortTypeEnum::UDP) => "udp".to_string(),
                Some(PortTypeEnum::SCTP) => "sctp".to_string(),
                _ => "tcp".to_string(),
            },
        })
        .collect();
    status.labels = labels;
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(name: &str, state: ContainerSummaryStateEnum) -> ContainerSummary {
        ContainerSummary {
            id: Some("abc123".to_string()),
            names: Some(vec![format!("/{name}")]),
            image: Some("orders:latest".to_string()),
            state: Some(state),
            labels: Some(HashMap::from([
                (LABEL_PROJECT_ID.to_string(), "orders".to_string()),
                (LABEL_TYPE.to_string(), "devmode".to_string()),
            ])),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_maps_labels_and_state() {
        let status = normalize_container(
            &summary("orders-devmode", ContainerSummaryStateEnum::RUNNING),
            "dev",
        );
        assert_eq!(status.project_id, "orders");
        assert_eq!(status.container_name, "orders-devmode");
        assert_eq!(status.container_type, ContainerType::Devmode);
        assert_eq!(status.state, ContainerState::Running);
        assert_eq!(status.container_id.as_deref(), Some("abc123"));
        assert!(!status.in_transit);
    }

    #[test]
    fn test_normalize_without_labels_falls_back_to_name() {
        let mut raw = summary("postgres", ContainerSummaryStateEnum::EXITED);
        raw.labels = None;
        let status = normalize_container(&raw, "dev");
        assert_eq!(status.project_id, "postgres");
        assert_eq!(status.container_type, ContainerType::Unknown);
        assert_eq!(status.state, ContainerState::Exited);
    }

    #[test]
    fn test_build_exit_pulls_and_devmode_start_syncs() {
        let effect = lifecycle_effect(&LifecycleEvent::BuildExited {
            container_name: "orders-build".to_string(),
            image: Some("orders:1".to_string()),
        });
        assert_eq!(effect, Some(LifecycleEffect::PullImage("orders:1".to_string())));

        let effect = lifecycle_effect(&LifecycleEvent::BuildExited {
            container_name: "orders-build".to_string(),
            image: None,
        });
        assert_eq!(effect, None);

        let effect = lifecycle_effect(&LifecycleEvent::DevModeStarted {
            container_name: "orders-devmode".to_string(),
        });
        assert_eq!(
            effect,
            Some(LifecycleEffect::SyncCode("orders-devmode".to_string()))
        );
    }

    #[test]
    fn test_sweep_keeps_fresh_in_transit_entries() {
        let now = Utc::now();
        let grace = ChronoDuration::seconds(10);

        let mut pending =
            ContainerStatus::pending("orders", "dev", "orders-devmode", ContainerType::Devmode);
        pending.init_date = now;
        assert!(sweep_keeps(&pending, now, grace));

        // past the grace window it is an orphan
        pending.init_date = now - ChronoDuration::seconds(30);
        assert!(!sweep_keeps(&pending, now, grace));

        // a backend-confirmed container is never shielded
        let mut confirmed = pending.clone();
        confirmed.init_date = now;
        confirmed.container_id = Some("abc".to_string());
        assert!(!sweep_keeps(&confirmed, now, grace));
    }
}
