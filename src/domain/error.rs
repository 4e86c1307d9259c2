use thiserror::Error;

use super::model::Status;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("application {0} not found")]
    NotFound(String),

    #[error("application id {0} already registered")]
    DuplicateId(String),

    #[error("port {port} already owned by application {owner}")]
    PortInUse { port: u16, owner: String },

    #[error("no free port found in range {min}-{max} after {attempts} attempts")]
    NoFreePort { min: u16, max: u16, attempts: u32 },

    #[error("build step failed: {0}")]
    BuildFailed(String),

    #[error("run step failed: {0}")]
    RunFailed(String),

    #[error("{step} step timed out after {secs}s")]
    Timeout { step: &'static str, secs: u64 },

    #[error("container runtime failure: {0}")]
    RuntimeFailure(String),

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("application {id} can't move from {from} to {to}")]
    InvalidTransition { id: String, from: Status, to: Status },
}

impl DeployError {
    /// Machine readable kind reported to API clients.
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::NotFound(_) => "not_found",
            DeployError::DuplicateId(_) => "duplicate_id",
            DeployError::PortInUse { .. } => "port_in_use",
            DeployError::NoFreePort { .. } => "no_free_port",
            DeployError::BuildFailed(_) => "build_failed",
            DeployError::RunFailed(_) => "run_failed",
            DeployError::Timeout { .. } => "timeout",
            DeployError::RuntimeFailure(_) => "runtime_failure",
            DeployError::PersistenceFailure(_) => "persistence_failure",
            DeployError::InvalidRequest(_) => "invalid_request",
            DeployError::InvalidTransition { .. } => "invalid_transition",
        }
    }

    pub(crate) fn persistence(error: anyhow::Error) -> Self {
        DeployError::PersistenceFailure(format!("{error:#}"))
    }

    pub(crate) fn runtime(error: anyhow::Error) -> Self {
        DeployError::RuntimeFailure(format!("{error:#}"))
    }
}
