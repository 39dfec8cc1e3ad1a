use crate::model::ContainerCommand;
use bollard::errors::Error as BollardError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaravelError {
    #[error(transparent)]
    Docker(#[from] BollardError),
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),
    #[error("command `{0}` is not supported on this backend")]
    UnsupportedCommand(ContainerCommand),
    #[error("no stats available for container {0}")]
    StatsUnavailable(String),
}
