use anyhow::Error;
use async_trait::async_trait;

use super::{
    buildspec,
    model::{
        Application, BuildSpec, ContainerRef, DeploymentEvent, EventAction, ImageRef, Language,
        PruneReport, RunSpec,
    },
};

#[async_trait]
pub trait ContainerRuntime {
    /// Best-effort classification, never fails.
    fn detect_language(&self, repo_url: &str) -> Language {
        buildspec::detect_language(repo_url)
    }

    fn build_spec(&self, language: Language, repo_url: &str) -> Result<BuildSpec, Error> {
        buildspec::generate(language, repo_url)
    }

    async fn build_image(&self, spec: &BuildSpec, image_name: &str) -> Result<ImageRef, Error>;

    /// Starts a container publishing `run.host_port`. The runtime must not pick another port.
    async fn run_container(&self, image: &ImageRef, run: &RunSpec) -> Result<ContainerRef, Error>;

    async fn stop_and_remove(&self, container: &ContainerRef) -> Result<(), Error>;

    async fn remove_image(&self, image: &ImageRef) -> Result<(), Error>;

    /// `false` when the container is gone or stopped.
    async fn container_running(&self, container: &ContainerRef) -> Result<bool, Error>;

    /// Last `tail` lines written by the container.
    async fn container_logs(&self, container: &ContainerRef, tail: usize) -> Result<Vec<String>, Error>;

    /// Removes images no longer referenced by any tag.
    async fn prune_images(&self) -> Result<PruneReport, Error>;
}

#[async_trait]
pub trait PersistenceGateway {
    async fn save(&self, app: &Application) -> Result<(), Error>;

    async fn load(&self) -> Result<Vec<Application>, Error>;

    async fn delete(&self, id: &str) -> Result<(), Error>;

    async fn append_event(&self, app_id: &str, action: EventAction, message: &str) -> Result<(), Error>;

    async fn events(&self, app_id: &str) -> Result<Vec<DeploymentEvent>, Error>;
}
