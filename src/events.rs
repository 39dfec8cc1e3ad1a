//! Fan-out between the reconciler and its downstream consumers.
//!
//! Explicit channels instead of an in-process bus: fire and forget,
//! at-least-once, every consumer does its own idempotent merge. A consumer
//! that cannot keep up loses events and catches up on the next observation.

use crate::cache::StatusCache;
use crate::model::{CamelStatus, CamelStatusValue, ContainerState, ContainerStatus, ContainerType};
use log::{debug, warn};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "status", rename_all = "lowercase")]
pub enum StatusEvent {
    Updated(ContainerStatus),
    Deleted(ContainerStatus),
}

/// Docker lifecycle events that only trigger side-effects, never status
/// updates: image sync after a build container exits, code copy into a
/// freshly started devmode container.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    BuildExited {
        container_name: String,
        /// Image the build container ran from, as reported by the event
        /// actor; the produced image is pulled under the same reference.
        image: Option<String>,
    },
    DevModeStarted {
        container_name: String,
    },
}

#[derive(Clone, Default)]
pub struct FanOut {
    senders: Vec<mpsc::Sender<StatusEvent>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, buffer: usize) -> mpsc::Receiver<StatusEvent> {
        let (tx, rx) = mpsc::channel(buffer);
        self.senders.push(tx);
        rx
    }

    pub fn publish(&self, event: StatusEvent) {
        for tx in &self.senders {
            if let Err(e) = tx.try_send(event.clone()) {
                warn!("dropping status event for a lagging consumer: {e}");
            }
        }
    }
}

/// Serializes accepted events to JSON and hands them to the SSE transport.
/// The transport itself (framing, keep-alive) lives outside this crate; it
/// subscribes to the broadcast sender.
pub async fn run_sse_bridge(
    mut rx: mpsc::Receiver<StatusEvent>,
    clients: broadcast::Sender<String>,
) {
    while let Some(event) = rx.recv().await {
        match serde_json::to_string(&event) {
            Ok(json) => {
                // send only fails when no UI client is connected
                let _ = clients.send(json);
            }
            Err(e) => warn!("failed to serialize status event: {e}"),
        }
    }
    debug!("sse bridge stopped");
}

/// Address of a container whose application-level health should be fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct CamelTarget {
    pub project_id: String,
    pub environment: String,
    pub container_name: String,
    pub address: String,
}

/// Picks containers whose infra-level status stabilized at `running` and
/// whose type carries application code, and asks the camel poller to fetch
/// their health.
pub async fn run_camel_trigger(
    mut rx: mpsc::Receiver<StatusEvent>,
    poller: mpsc::Sender<CamelTarget>,
) {
    while let Some(event) = rx.recv().await {
        if let Some(target) = camel_target_for(&event) {
            if let Err(e) = poller.try_send(target) {
                debug!("camel poller busy, skipping trigger: {e}");
            }
        }
    }
    debug!("camel trigger stopped");
}

pub(crate) fn camel_target_for(event: &StatusEvent) -> Option<CamelTarget> {
    let StatusEvent::Updated(status) = event else {
        return None;
    };
    if status.state != ContainerState::Running || status.in_transit {
        return None;
    }
    if !matches!(
        status.container_type,
        ContainerType::Devmode | ContainerType::Packaged
    ) {
        return None;
    }
    // Docker containers are reached by name, pods by IP.
    let address = status
        .pod_ip
        .clone()
        .unwrap_or_else(|| status.container_name.clone());
    Some(CamelTarget {
        project_id: status.project_id.clone(),
        environment: status.environment.clone(),
        container_name: status.container_name.clone(),
        address,
    })
}

/// Fetches `/q/health` from a triggered container and stores the result as a
/// [`CamelStatus`]. Failures are logged and skipped; the next trigger retries.
pub async fn run_camel_poller(
    mut rx: mpsc::Receiver<CamelTarget>,
    cache: StatusCache,
    health_port: u16,
) {
    let client = reqwest::Client::new();
    while let Some(target) = rx.recv().await {
        match fetch_camel_health(&client, &target, health_port).await {
            Ok(status) => cache.save_camel(status).await,
            Err(e) => debug!(
                "health fetch failed for {}: {e}",
                target.container_name
            ),
        }
    }
    debug!("camel poller stopped");
}

async fn fetch_camel_health(
    client: &reqwest::Client,
    target: &CamelTarget,
    port: u16,
) -> Result<CamelStatus, reqwest::Error> {
    let url = format!("http://{}:{}/q/health", target.address, port);
    let body: serde_json::Value = client
        .get(&url)
        .timeout(std::time::Duration::from_secs(2))
        .send()
        .await?
        .json()
        .await?;

    let mut values = Vec::new();
    if let Some(checks) = body.get("checks").and_then(|c| c.as_array()) {
        for check in checks {
            let name = check
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or("unknown");
            let status = check
                .get("status")
                .and_then(|s| s.as_str())
                .unwrap_or("UNKNOWN");
            values.push(CamelStatusValue {
                name: name.to_string(),
                status: status.to_string(),
            });
        }
    }

    Ok(CamelStatus {
        project_id: target.project_id.clone(),
        environment: target.environment.clone(),
        container_name: target.container_name.clone(),
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContainerStatus;

    fn running(container_type: ContainerType) -> ContainerStatus {
        ContainerStatus::new(
            "orders",
            "dev",
            "orders-devmode",
            container_type,
            ContainerState::Running,
        )
    }

    #[test]
    fn test_camel_trigger_only_for_running_code_containers() {
        let event = StatusEvent::Updated(running(ContainerType::Devmode));
        assert!(camel_target_for(&event).is_some());

        let event = StatusEvent::Updated(running(ContainerType::Devservice));
        assert!(camel_target_for(&event).is_none());

        let mut exited = running(ContainerType::Devmode);
        exited.state = ContainerState::Exited;
        assert!(camel_target_for(&StatusEvent::Updated(exited)).is_none());

        let mut transit = running(ContainerType::Devmode);
        transit.in_transit = true;
        assert!(camel_target_for(&StatusEvent::Updated(transit)).is_none());
    }

    #[test]
    fn test_camel_trigger_prefers_pod_ip() {
        let mut pod = running(ContainerType::Packaged);
        pod.pod_ip = Some("10.1.2.3".to_string());
        let target = camel_target_for(&StatusEvent::Updated(pod)).unwrap();
        assert_eq!(target.address, "10.1.2.3");

        let target =
            camel_target_for(&StatusEvent::Updated(running(ContainerType::Devmode))).unwrap();
        assert_eq!(target.address, "orders-devmode");
    }

    #[tokio::test]
    async fn test_fanout_delivers_to_every_subscriber() {
        let mut fanout = FanOut::new();
        let mut rx_a = fanout.subscribe(8);
        let mut rx_b = fanout.subscribe(8);

        fanout.publish(StatusEvent::Updated(running(ContainerType::Devmode)));

        assert!(matches!(rx_a.recv().await, Some(StatusEvent::Updated(_))));
        assert!(matches!(rx_b.recv().await, Some(StatusEvent::Updated(_))));
    }

    #[test]
    fn test_sse_payload_is_tagged_json() {
        let event = StatusEvent::Updated(running(ContainerType::Devmode));
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["event"], "updated");
        assert_eq!(json["status"]["projectId"], "orders");
    }
}
