use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::DeployError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub name: String,
    pub repo_url: String,
    pub language: Option<Language>,
    pub port: u16,
    #[serde(rename = "container_id")]
    pub container_ref: Option<ContainerRef>,
    #[serde(rename = "image_id")]
    pub image_ref: Option<ImageRef>,
    pub status: Status,
    #[serde(rename = "error_msg")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Application {
    /// A fresh record in `Idle` owning the given port.
    pub fn new(id: String, name: String, repo_url: String, port: u16) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            repo_url,
            language: None,
            port,
            container_ref: None,
            image_ref: None,
            status: Status::Idle,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Body of a creation request.
#[derive(Clone, Debug, Deserialize)]
pub struct DeployRequest {
    pub repo_url: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Name shown for a repository when the caller did not supply one: the last
/// path segment without its `.git` suffix.
pub fn name_from_repo_url(repo_url: &str) -> String {
    let last = repo_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() || name.contains(':') {
        String::from("app")
    } else {
        name.to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Idle,
    Deploying,
    Running,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Deploying => "deploying",
            Status::Running => "running",
            Status::Error => "error",
        }
    }

    /// Edges of the lifecycle: `Idle -> Deploying -> {Running, Error}` and the
    /// out-of-band `Running -> Error`.
    pub fn can_transition_to(&self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Idle, Status::Deploying)
                | (Status::Deploying, Status::Running)
                | (Status::Deploying, Status::Error)
                | (Status::Running, Status::Error)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Status::Idle),
            "deploying" => Ok(Status::Deploying),
            "running" => Ok(Status::Running),
            "error" => Ok(Status::Error),
            other => Err(DeployError::PersistenceFailure(format!(
                "unknown stored status {other:?}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Go,
    Node,
    Python,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Go => "go",
            Language::Node => "node",
            Language::Python => "python",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "go" => Ok(Language::Go),
            "node" => Ok(Language::Node),
            "python" => Ok(Language::Python),
            other => Err(DeployError::PersistenceFailure(format!(
                "unknown stored language {other:?}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerRef(pub String);

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Runtime-specific build instructions for one application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildSpec {
    pub language: Language,
    pub repo_url: String,
    pub dockerfile: String,
    pub exposed_port: u16,
}

/// Where and how a built image is started.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSpec {
    pub app_id: String,
    pub container_name: String,
    /// Published on the host, never chosen by the runtime.
    pub host_port: u16,
    /// Port the image listens on, as exposed by its build specification.
    pub container_port: u16,
}

/// Outcome of a dangling image cleanup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub images_deleted: usize,
    pub space_reclaimed: u64,
}

/// Field changes applied together with a status transition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusChange {
    pub language: Option<Language>,
    pub container_ref: Option<ContainerRef>,
    pub image_ref: Option<ImageRef>,
    pub error_message: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Created,
    DeployStart,
    DeploySuccess,
    DeployError,
    Deleted,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::Created => "created",
            EventAction::DeployStart => "deploy_start",
            EventAction::DeploySuccess => "deploy_success",
            EventAction::DeployError => "deploy_error",
            EventAction::Deleted => "deleted",
        }
    }
}

impl FromStr for EventAction {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(EventAction::Created),
            "deploy_start" => Ok(EventAction::DeployStart),
            "deploy_success" => Ok(EventAction::DeploySuccess),
            "deploy_error" => Ok(EventAction::DeployError),
            "deleted" => Ok(EventAction::Deleted),
            other => Err(DeployError::PersistenceFailure(format!(
                "unknown stored event action {other:?}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub app_id: String,
    pub action: EventAction,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}
