//! Status entities shared by both backend observers and everything downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

/// Label carrying the project id on containers and pods.
pub const LABEL_PROJECT_ID: &str = "projectId";
/// Label classifying a container, decoded through [`ContainerType`].
pub const LABEL_TYPE: &str = "type";
pub const LABEL_COMMIT: &str = "commit";
/// Runtime marker label; the Kubernetes watches select on it.
pub const LABEL_RUNTIME: &str = "caravel.runtime";

/// Composite identifier addressing all per-project per-environment cached
/// entities: group = `project:environment`, key = resource name.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct GroupedKey {
    pub group: String,
    pub key: String,
}

impl GroupedKey {
    pub fn new(project_id: &str, environment: &str, key: impl Into<String>) -> Self {
        Self {
            group: format!("{project_id}:{environment}"),
            key: key.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerType {
    Internal,
    Devmode,
    Devservice,
    Packaged,
    Build,
    Unknown,
}

impl ContainerType {
    /// Total decoder for the `type` label; anything unrecognized is `Unknown`
    /// so a single unlabeled container never stalls the pipeline.
    pub fn from_label(value: Option<&str>) -> Self {
        match value {
            Some("internal") => ContainerType::Internal,
            Some("devmode") => ContainerType::Devmode,
            Some("devservice") => ContainerType::Devservice,
            Some("packaged") => ContainerType::Packaged,
            Some("build") => ContainerType::Build,
            _ => ContainerType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Dead,
}

impl ContainerState {
    /// Terminal states are finalized exactly once and never resurrected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContainerState::Exited | ContainerState::Dead)
    }
}

impl Display for ContainerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Restarting => "restarting",
            ContainerState::Paused => "paused",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerCommand {
    Run,
    Pause,
    Stop,
    Delete,
    Deploy,
}

impl Display for ContainerCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerCommand::Run => "run",
            ContainerCommand::Pause => "pause",
            ContainerCommand::Stop => "stop",
            ContainerCommand::Delete => "delete",
            ContainerCommand::Deploy => "deploy",
        };
        write!(f, "{s}")
    }
}

/// Permitted next actions given the current state. `commands` on a status is
/// always derived through this table, never set independently.
pub fn commands_for_state(state: ContainerState) -> Vec<ContainerCommand> {
    use ContainerCommand::*;
    match state {
        ContainerState::Created => vec![Run, Delete],
        ContainerState::Exited => vec![Run, Delete],
        ContainerState::Running => vec![Pause, Stop, Delete],
        ContainerState::Paused => vec![Run, Stop, Delete],
        ContainerState::Dead => vec![Delete],
        ContainerState::Restarting => vec![Delete],
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub private_port: u16,
    pub public_port: Option<u16>,
    pub protocol: String,
}

/// The central entity of the pipeline. One instance exists per grouped key in
/// the cache at any time; it is mutated only through the reconciler merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub project_id: String,
    pub environment: String,
    pub container_name: String,
    #[serde(rename = "type")]
    pub container_type: ContainerType,
    pub container_id: Option<String>,
    pub image: Option<String>,
    pub ports: Vec<PortMapping>,
    pub camel_runtime: Option<String>,
    pub commit: Option<String>,
    pub labels: HashMap<String, String>,
    pub state: ContainerState,
    pub phase: Option<String>,
    pub pod_ip: Option<String>,
    pub ready: Option<bool>,
    pub memory_info: String,
    pub cpu_info: String,
    pub commands: Vec<ContainerCommand>,
    pub in_transit: bool,
    pub created: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub init_date: DateTime<Utc>,
}

impl ContainerStatus {
    pub fn new(
        project_id: impl Into<String>,
        environment: impl Into<String>,
        container_name: impl Into<String>,
        container_type: ContainerType,
        state: ContainerState,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            environment: environment.into(),
            container_name: container_name.into(),
            container_type,
            container_id: None,
            image: None,
            ports: Vec::new(),
            camel_runtime: None,
            commit: None,
            labels: HashMap::new(),
            state,
            phase: None,
            pod_ip: None,
            ready: None,
            memory_info: String::new(),
            cpu_info: String::new(),
            commands: commands_for_state(state),
            in_transit: false,
            created: None,
            finished: None,
            init_date: Utc::now(),
        }
    }

    /// Synthetic status created by the command dispatcher before any backend
    /// observation exists. `init_date` seeds the cleanup grace window.
    pub fn pending(
        project_id: impl Into<String>,
        environment: impl Into<String>,
        container_name: impl Into<String>,
        container_type: ContainerType,
    ) -> Self {
        let mut status = Self::new(
            project_id,
            environment,
            container_name,
            container_type,
            ContainerState::Created,
        );
        status.in_transit = true;
        status
    }

    pub fn grouped_key(&self) -> GroupedKey {
        GroupedKey::new(&self.project_id, &self.environment, &self.container_name)
    }

    /// Identity-only copy published with delete notifications; the backend
    /// resource is gone, so nothing beyond the key is meaningful.
    pub fn identity(project_id: &str, environment: &str, container_name: &str) -> Self {
        Self::new(
            project_id,
            environment,
            container_name,
            ContainerType::Unknown,
            ContainerState::Exited,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    pub project_id: String,
    pub environment: String,
    pub name: String,
    pub image: Option<String>,
    pub replicas: i32,
    pub ready_replicas: i32,
    pub unavailable_replicas: i32,
}

impl DeploymentStatus {
    pub fn grouped_key(&self) -> GroupedKey {
        GroupedKey::new(&self.project_id, &self.environment, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub project_id: String,
    pub environment: String,
    pub name: String,
    pub port: Option<i32>,
    pub target_port: Option<String>,
    pub cluster_ip: Option<String>,
    #[serde(rename = "type")]
    pub service_type: Option<String>,
}

impl ServiceStatus {
    pub fn grouped_key(&self) -> GroupedKey {
        GroupedKey::new(&self.project_id, &self.environment, &self.name)
    }
}

/// Application-level health of a running container, collected by the camel
/// poller once the infra-level status stabilizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CamelStatus {
    pub project_id: String,
    pub environment: String,
    pub container_name: String,
    pub values: Vec<CamelStatusValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CamelStatusValue {
    pub name: String,
    pub status: String,
}

impl CamelStatus {
    pub fn grouped_key(&self) -> GroupedKey {
        GroupedKey::new(&self.project_id, &self.environment, &self.container_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_follow_state_table() {
        use ContainerCommand::*;
        assert_eq!(
            commands_for_state(ContainerState::Created),
            vec![Run, Delete]
        );
        assert_eq!(commands_for_state(ContainerState::Exited), vec![Run, Delete]);
        assert_eq!(
            commands_for_state(ContainerState::Running),
            vec![Pause, Stop, Delete]
        );
        assert_eq!(
            commands_for_state(ContainerState::Paused),
            vec![Run, Stop, Delete]
        );
        assert_eq!(commands_for_state(ContainerState::Dead), vec![Delete]);
    }

    #[test]
    fn test_unknown_type_label_is_total() {
        assert_eq!(ContainerType::from_label(None), ContainerType::Unknown);
        assert_eq!(
            ContainerType::from_label(Some("whatever")),
            ContainerType::Unknown
        );
        assert_eq!(
            ContainerType::from_label(Some("devmode")),
            ContainerType::Devmode
        );
    }

    #[test]
    fn test_status_serializes_with_camel_case_names() {
        let status = ContainerStatus::new(
            "orders",
            "dev",
            "orders-devmode",
            ContainerType::Devmode,
            ContainerState::Running,
        );
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["projectId"], "orders");
        assert_eq!(json["containerName"], "orders-devmode");
        assert_eq!(json["type"], "devmode");
        assert_eq!(json["state"], "running");
        assert_eq!(json["inTransit"], false);
        assert!(json["finished"].is_null());
    }

    #[test]
    fn test_grouped_key_equality_is_structural() {
        let a = GroupedKey::new("orders", "dev", "orders-devmode");
        let b = GroupedKey::new("orders", "dev", "orders-devmode");
        let c = GroupedKey::new("orders", "prod", "orders-devmode");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
