use std::{fmt, future::Future, sync::Arc, time::Duration};

use log::{error, info, warn};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{
    allocator::PortAllocator,
    error::DeployError,
    model::{
        name_from_repo_url, Application, ContainerRef, DeployRequest, DeploymentEvent, EventAction,
        ImageRef, Language, PruneReport, RunSpec, Status, StatusChange,
    },
    port::ContainerRuntime,
    registry::AppRegistry,
};

pub type Runtime = Arc<dyn ContainerRuntime + Send + Sync>;

const MAX_NAME_LENGTH: usize = 128;
const MAX_LOG_LINES: usize = 1000;
const REPO_SCHEMES: [&str; 5] = ["https://", "http://", "git://", "ssh://", "git@"];

#[derive(Clone, Debug)]
pub struct DeploySettings {
    pub image_prefix: String,
    pub build_timeout: Duration,
    pub run_timeout: Duration,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            image_prefix: String::from("shipyard"),
            build_timeout: Duration::from_secs(900),
            run_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    BuildSpec,
    Build,
    Run,
    Finalize,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::BuildSpec => "build_spec",
            Step::Build => "build_image",
            Step::Run => "run_container",
            Step::Finalize => "finalize",
        })
    }
}

/// What startup recovery did with the stored records.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Recovery {
    pub restored: usize,
    pub abandoned: usize,
    pub resumed: usize,
    pub lost: usize,
}

/// Running records checked against the containers actually alive.
#[derive(Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct Reconciliation {
    pub checked: usize,
    pub healthy: usize,
    pub lost: usize,
    pub unknown: usize,
}

/// Drives applications from creation to `Running` or `Error`, and tears them down.
#[derive(Clone)]
pub struct DeploymentService {
    registry: Arc<AppRegistry>,
    allocator: Arc<PortAllocator>,
    runtime: Runtime,
    settings: DeploySettings,
}

impl DeploymentService {
    pub fn new(
        registry: Arc<AppRegistry>,
        allocator: Arc<PortAllocator>,
        runtime: Runtime,
        settings: DeploySettings,
    ) -> Self {
        Self {
            registry,
            allocator,
            runtime,
            settings,
        }
    }

    /// Registers a new application and starts its pipeline in the background.
    /// The returned record is already `Deploying`.
    pub async fn create_deployment(&self, request: DeployRequest) -> Result<Application, DeployError> {
        let (repo_url, name) = validate(request)?;
        let reservation = self.allocator.allocate()?;
        let app = Application::new(Uuid::new_v4().to_string(), name, repo_url, reservation.port());
        let app = self.registry.insert(app, reservation).await?;
        info!("Application {} ({}) created on port {}", app.name, app.id, app.port);
        self.log_event(&app.id, EventAction::Created, "Application created")
            .await;

        let (app, _pipeline) = self.start(&app.id).await?;
        Ok(app)
    }

    pub async fn list_deployments(&self) -> Vec<Application> {
        self.registry.list_all().await
    }

    pub async fn get_deployment(&self, id: &str) -> Result<Application, DeployError> {
        self.registry.find(id).await
    }

    pub async fn deployment_events(&self, id: &str) -> Result<Vec<DeploymentEvent>, DeployError> {
        self.registry.find(id).await?;
        self.registry
            .store()
            .events(id)
            .await
            .map_err(DeployError::persistence)
    }

    /// Forgets the application, then tears down what its last state holds.
    /// Runtime failures don't prevent the record from being deleted. A record
    /// removed while deploying is cleaned up by its own pipeline.
    pub async fn delete_deployment(&self, id: &str) -> Result<Application, DeployError> {
        let removed = self.registry.remove(id).await?;
        info!("Deleting application {} ({})", removed.name, removed.id);
        if let Some(container) = &removed.container_ref {
            self.discard_container(container).await;
        }
        if let Some(image) = &removed.image_ref {
            self.discard_image(image).await;
        }
        self.log_event(id, EventAction::Deleted, "Application deleted")
            .await;
        info!("Application {} deleted", id);
        Ok(removed)
    }

    /// Last lines written by the application's container, empty when it has none.
    pub async fn deployment_logs(&self, id: &str, tail: usize) -> Result<Vec<String>, DeployError> {
        let app = self.registry.find(id).await?;
        let Some(container) = app.container_ref else {
            return Ok(Vec::new());
        };
        self.runtime
            .container_logs(&container, tail.clamp(1, MAX_LOG_LINES))
            .await
            .map_err(DeployError::runtime)
    }

    pub async fn prune_images(&self) -> Result<PruneReport, DeployError> {
        info!("Pruning dangling images");
        self.runtime.prune_images().await.map_err(DeployError::runtime)
    }

    /// Moves `Running` records whose container is gone to `Error`. Records
    /// whose container can't be inspected are left untouched.
    pub async fn reconcile_containers(&self) -> Reconciliation {
        let mut reconciliation = Reconciliation::default();
        for app in self.registry.list_all().await {
            if app.status != Status::Running {
                continue;
            }
            reconciliation.checked += 1;
            let alive = match &app.container_ref {
                Some(container) => match self.runtime.container_running(container).await {
                    Ok(alive) => alive,
                    Err(e) => {
                        warn!("Can't check container of {} : {:#}", app.id, e);
                        reconciliation.unknown += 1;
                        continue;
                    }
                },
                None => false,
            };
            if alive {
                reconciliation.healthy += 1;
                continue;
            }
            let message = match &app.container_ref {
                Some(container) => format!("container {container} is no longer running"),
                None => String::from("running without a container"),
            };
            warn!("Application {} lost : {}", app.id, message);
            let change = StatusChange {
                error_message: Some(message.clone()),
                ..Default::default()
            };
            match self.registry.update_status(&app.id, Status::Error, change).await {
                Ok(_) => {
                    self.log_event(&app.id, EventAction::DeployError, &message)
                        .await;
                    reconciliation.lost += 1;
                }
                Err(e) => {
                    warn!("Can't mark {} as failed : {}", app.id, e);
                    reconciliation.unknown += 1;
                }
            }
        }
        reconciliation
    }

    /// Loads stored records into the registry. Records left `Deploying` by a
    /// previous run have nobody working on them anymore and are moved to
    /// `Error`; records still `Idle` get their pipeline started.
    pub async fn recover(&self) -> Result<Recovery, DeployError> {
        let apps = self
            .registry
            .store()
            .load()
            .await
            .map_err(DeployError::persistence)?;
        let mut recovery = Recovery {
            restored: self.registry.restore(apps.clone()),
            ..Default::default()
        };
        for app in apps {
            match app.status {
                Status::Deploying => {
                    let message = "deployment interrupted by a controller restart";
                    warn!("Application {} was left deploying, marking it as failed", app.id);
                    self.registry
                        .update_status(
                            &app.id,
                            Status::Error,
                            StatusChange {
                                error_message: Some(message.to_string()),
                                ..Default::default()
                            },
                        )
                        .await?;
                    self.log_event(&app.id, EventAction::DeployError, message)
                        .await;
                    recovery.abandoned += 1;
                }
                Status::Idle => {
                    info!("Resuming deployment of idle application {}", app.id);
                    self.start(&app.id).await?;
                    recovery.resumed += 1;
                }
                Status::Running | Status::Error => {}
            }
        }
        recovery.lost = self.reconcile_containers().await.lost;
        Ok(recovery)
    }

    /// `Idle -> Deploying`, then hands the pipeline to a background task. The
    /// transition is atomic on the record, so a second start of the same
    /// application fails with `InvalidTransition` instead of interleaving.
    pub async fn start(&self, id: &str) -> Result<(Application, JoinHandle<()>), DeployError> {
        let app = self
            .registry
            .update_status(id, Status::Deploying, StatusChange::default())
            .await?;
        self.log_event(id, EventAction::DeployStart, "Deployment started")
            .await;
        info!("Deployment of {} started", id);

        let service = self.clone();
        let deploying = app.clone();
        let pipeline = tokio::spawn(async move {
            service.run_pipeline(deploying).await;
        });
        Ok((app, pipeline))
    }

    async fn run_pipeline(&self, app: Application) {
        let language = self.runtime.detect_language(&app.repo_url);
        info!("Language detected for {} : {}", app.id, language);

        let spec = match self.runtime.build_spec(language, &app.repo_url) {
            Ok(spec) => spec,
            Err(e) => {
                let cause = DeployError::BuildFailed(format!("can't generate build specification: {e:#}"));
                return self.fail(&app, Step::BuildSpec, language, None, cause).await;
            }
        };

        let artifact_name = format!("{}_{}", self.settings.image_prefix, app.id);
        let build = self.runtime.build_image(&spec, &artifact_name);
        let image = match bounded(self.settings.build_timeout, Step::Build, build).await {
            Ok(Ok(image)) => image,
            Ok(Err(e)) => {
                let cause = DeployError::BuildFailed(format!("{e:#}"));
                return self.fail(&app, Step::Build, language, None, cause).await;
            }
            Err(timeout) => {
                self.discard_image(&ImageRef(artifact_name.clone())).await;
                return self.fail(&app, Step::Build, language, None, timeout).await;
            }
        };
        info!("Image {} built for {}", image, app.id);

        if let Err(DeployError::NotFound(_)) = self.registry.find(&app.id).await {
            warn!("Application {} deleted while building, discarding its image", app.id);
            self.discard_image(&image).await;
            self.registry.release_port(&app);
            return;
        }
        let run_spec = RunSpec {
            app_id: app.id.clone(),
            container_name: artifact_name.clone(),
            host_port: app.port,
            container_port: spec.exposed_port,
        };
        let run = self.runtime.run_container(&image, &run_spec);
        let container = match bounded(self.settings.run_timeout, Step::Run, run).await {
            Ok(Ok(container)) => container,
            Ok(Err(e)) => {
                let cause = DeployError::RunFailed(format!("{e:#}"));
                return self.fail(&app, Step::Run, language, Some(image), cause).await;
            }
            Err(timeout) => {
                self.discard_container(&ContainerRef(artifact_name.clone())).await;
                return self.fail(&app, Step::Run, language, Some(image), timeout).await;
            }
        };

        let change = StatusChange {
            language: Some(language),
            container_ref: Some(container.clone()),
            image_ref: Some(image.clone()),
            error_message: None,
        };
        match self.registry.update_status(&app.id, Status::Running, change).await {
            Ok(running) => {
                let message = format!(
                    "Deployment succeeded - port {}, container {}",
                    running.port, container
                );
                self.log_event(&app.id, EventAction::DeploySuccess, &message)
                    .await;
                info!("Application {} running on port {}", app.id, running.port);
            }
            Err(DeployError::NotFound(_)) => {
                warn!("Application {} deleted while deploying, discarding its container", app.id);
                self.discard_container(&container).await;
                self.discard_image(&image).await;
                self.registry.release_port(&app);
            }
            Err(e) => {
                self.discard_container(&container).await;
                self.fail(&app, Step::Finalize, language, Some(image), e).await;
            }
        }
    }

    async fn fail(
        &self,
        app: &Application,
        step: Step,
        language: Language,
        image: Option<ImageRef>,
        cause: DeployError,
    ) {
        let message = format!("{step}: {cause}");
        error!("Deployment of {} failed at {}", app.id, message);
        let change = StatusChange {
            language: Some(language),
            image_ref: image.clone(),
            error_message: Some(message.clone()),
            ..Default::default()
        };
        match self.registry.update_status(&app.id, Status::Error, change).await {
            Ok(_) => {
                self.log_event(&app.id, EventAction::DeployError, &message)
                    .await
            }
            Err(DeployError::NotFound(_)) => {
                info!("Application {} deleted while deploying", app.id);
                if let Some(image) = &image {
                    self.discard_image(image).await;
                }
                self.registry.release_port(app);
            }
            Err(e) => error!("Can't record failure of {} : {}", app.id, e),
        }
    }

    async fn discard_container(&self, container: &ContainerRef) {
        if let Err(e) = self.runtime.stop_and_remove(container).await {
            warn!("Can't stop and remove container {} : {:#}", container, e);
        }
    }

    async fn discard_image(&self, image: &ImageRef) {
        if let Err(e) = self.runtime.remove_image(image).await {
            warn!("Can't remove image {} : {:#}", image, e);
        }
    }

    /// The event log is an audit trail, a failing append is reported but
    /// doesn't undo the operation it describes.
    async fn log_event(&self, app_id: &str, action: EventAction, message: &str) {
        if let Err(e) = self
            .registry
            .store()
            .append_event(app_id, action, message)
            .await
        {
            warn!("Can't log {} event for {} : {:#}", action.as_str(), app_id, e);
        }
    }
}

async fn bounded<T>(
    limit: Duration,
    step: Step,
    work: impl Future<Output = T>,
) -> Result<T, DeployError> {
    tokio::time::timeout(limit, work)
        .await
        .map_err(|_| DeployError::Timeout {
            step: match step {
                Step::Run => "run",
                _ => "build",
            },
            secs: limit.as_secs(),
        })
}

fn validate(request: DeployRequest) -> Result<(String, String), DeployError> {
    let repo_url = request.repo_url.trim().to_string();
    if repo_url.is_empty() {
        return Err(DeployError::InvalidRequest(String::from("repo_url is required")));
    }
    if repo_url.chars().any(char::is_whitespace)
        || !REPO_SCHEMES.iter().any(|scheme| repo_url.starts_with(scheme))
    {
        return Err(DeployError::InvalidRequest(format!(
            "repo_url {repo_url:?} is not a repository url"
        )));
    }
    let name = match request.name.map(|name| name.trim().to_string()) {
        Some(name) if name.chars().count() > MAX_NAME_LENGTH => {
            return Err(DeployError::InvalidRequest(format!(
                "name is longer than {MAX_NAME_LENGTH} characters"
            )))
        }
        Some(name) if !name.is_empty() => name,
        _ => name_from_repo_url(&repo_url),
    };
    Ok((repo_url, name))
}
