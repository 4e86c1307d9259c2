use std::collections::HashMap;

use anyhow::{bail, Context, Error};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
        StopContainerOptions,
    },
    errors::Error as DockerError,
    image::{BuildImageOptions, BuilderVersion, PruneImagesOptions, RemoveImageOptions},
    secret::{BuildInfoAux, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum},
    Docker, API_DEFAULT_VERSION,
};
use bytes::{BufMut, Bytes, BytesMut};
use flate2::{write::GzEncoder, Compression};
use futures::{StreamExt, TryStreamExt};
use log::{debug, info, warn};
use map_macro::hash_map;

use crate::{
    config::DockerConfig,
    domain::{
        model::{BuildSpec, ContainerRef, ImageRef, PruneReport, RunSpec},
        port::ContainerRuntime,
    },
};

const MANAGED_LABEL: &str = "shipyard.managed";
const APP_ID_LABEL: &str = "shipyard.app.id";
const HOST_PORT_LABEL: &str = "shipyard.host.port";
const STOP_GRACE_SECS: i64 = 10;

pub struct DockerContainerRuntime {
    pub docker: Docker,
}

impl DockerContainerRuntime {
    pub async fn connect(config: &DockerConfig) -> Result<Self, Error> {
        let docker = Docker::connect_with_socket(&config.socket, config.timeout_secs, API_DEFAULT_VERSION)
            .context("Can't connect to docker socket")?;
        let version = docker
            .version()
            .await
            .context("Docker daemon is not answering")?;
        info!(
            "Connected to docker {} on {}",
            version.version.unwrap_or_default(),
            config.socket
        );
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerContainerRuntime {
    async fn build_image(&self, spec: &BuildSpec, image_name: &str) -> Result<ImageRef, Error> {
        let context = build_context(&spec.dockerfile)?;
        info!("Build image {} for {} repository {}", image_name, spec.language, spec.repo_url);
        let mut output = std::pin::pin!(self.docker.build_image(
            BuildImageOptions {
                dockerfile: "Dockerfile",
                t: image_name,
                version: BuilderVersion::BuilderBuildKit,
                session: Some(format!("shipyard-{image_name}")),
                pull: true,
                rm: true,
                forcerm: true,
                labels: hash_map! { MANAGED_LABEL => "true" },
                ..Default::default()
            },
            None,
            Some(context),
        ));

        let mut image_id = None;
        while let Some(info) = output.next().await {
            let info = info.context("Docker build stream interrupted")?;
            if let Some(error) = info.error {
                bail!("{}", error.trim_end());
            }
            match info.aux {
                Some(BuildInfoAux::BuildKit(response)) => {
                    for vertex in response.vertexes {
                        if vertex.completed.is_some() {
                            debug!("Build {} => [Vertex] {}", image_name, vertex.name);
                        }
                        if !vertex.error.is_empty() {
                            warn!("Build {} => [Vertex] {} : {}", image_name, vertex.name, vertex.error);
                        }
                    }
                }
                Some(BuildInfoAux::Default(image)) => image_id = image.id,
                None => {}
            }
        }
        let image = ImageRef(image_id.unwrap_or_else(|| image_name.to_string()));
        info!("Image {} built : {}", image_name, image);
        Ok(image)
    }

    async fn run_container(&self, image: &ImageRef, run: &RunSpec) -> Result<ContainerRef, Error> {
        let exposed_port = format!("{}/tcp", run.container_port);
        let config = Config {
            image: Some(image.0.clone()),
            exposed_ports: Some(hash_map! {
                exposed_port.clone() => HashMap::new()
            }),
            host_config: Some(HostConfig {
                port_bindings: Some(hash_map! {
                    exposed_port.clone() => Some(vec![PortBinding {
                        host_ip: Some(String::from("0.0.0.0")),
                        host_port: Some(run.host_port.to_string()),
                    }])
                }),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::ON_FAILURE),
                    maximum_retry_count: Some(3),
                }),
                ..Default::default()
            }),
            labels: Some(hash_map! {
                String::from(MANAGED_LABEL) => String::from("true"),
                String::from(APP_ID_LABEL) => run.app_id.clone(),
                String::from(HOST_PORT_LABEL) => run.host_port.to_string(),
            }),
            ..Default::default()
        };
        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: run.container_name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .with_context(|| format!("Can't create container {}", run.container_name))?;
        let container = ContainerRef(container.id);

        if let Err(e) = self
            .docker
            .start_container(&container.0, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(cleanup) = self.stop_and_remove(&container).await {
                warn!("Can't clean container {} after failed start : {:#}", container, cleanup);
            }
            return Err(Error::new(e).context(format!("Can't start container {}", run.container_name)));
        }
        info!(
            "Container {} started, {} published on host port {}",
            container, exposed_port, run.host_port
        );
        Ok(container)
    }

    async fn stop_and_remove(&self, container: &ContainerRef) -> Result<(), Error> {
        match self
            .docker
            .stop_container(&container.0, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            Ok(()) => info!("Container {} stopped", container),
            Err(DockerError::DockerResponseServerError { status_code: 304, .. }) => {
                debug!("Container {} already stopped", container)
            }
            Err(e) => warn!("Can't stop container {} : {}", container, e),
        }
        self.docker
            .remove_container(
                &container.0,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("Error while removing container {}", container))
    }

    async fn remove_image(&self, image: &ImageRef) -> Result<(), Error> {
        self.docker
            .remove_image(
                &image.0,
                Some(RemoveImageOptions {
                    force: true,
                    ..Default::default()
                }),
                None,
            )
            .await
            .with_context(|| format!("Error while removing image {}", image))?;
        info!("Image {} removed", image);
        Ok(())
    }

    async fn container_running(&self, container: &ContainerRef) -> Result<bool, Error> {
        match self.docker.inspect_container(&container.0, None).await {
            Ok(inspect) => Ok(inspect
                .state
                .and_then(|state| state.running)
                .unwrap_or(false)),
            Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => Ok(false),
            Err(e) => Err(Error::new(e).context(format!("Can't inspect container {}", container))),
        }
    }

    async fn container_logs(&self, container: &ContainerRef, tail: usize) -> Result<Vec<String>, Error> {
        let output: Vec<_> = self
            .docker
            .logs(
                &container.0,
                Some(LogsOptions::<String> {
                    stdout: true,
                    stderr: true,
                    tail: tail.to_string(),
                    ..Default::default()
                }),
            )
            .try_collect()
            .await
            .with_context(|| format!("Can't read logs of container {}", container))?;
        Ok(output
            .into_iter()
            .flat_map(|chunk| {
                String::from_utf8_lossy(&chunk.into_bytes())
                    .lines()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|line| !line.trim().is_empty())
            .collect())
    }

    async fn prune_images(&self) -> Result<PruneReport, Error> {
        let response = self
            .docker
            .prune_images(Some(PruneImagesOptions {
                filters: hash_map! { "dangling" => vec!["true"] },
            }))
            .await
            .context("Can't prune dangling images")?;
        let report = PruneReport {
            images_deleted: response.images_deleted.map_or(0, |deleted| deleted.len()),
            space_reclaimed: response
                .space_reclaimed
                .and_then(|bytes| u64::try_from(bytes).ok())
                .unwrap_or(0),
        };
        info!(
            "Pruned {} dangling images, {} bytes reclaimed",
            report.images_deleted, report.space_reclaimed
        );
        Ok(report)
    }
}

/// Gzipped tar archive holding only the generated Dockerfile.
fn build_context(dockerfile: &str) -> Result<Bytes, Error> {
    let tar_gz = BytesMut::new().writer();
    let enc = GzEncoder::new(tar_gz, Compression::default());
    let mut tar = tar::Builder::new(enc);

    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    tar.append_data(&mut header, "Dockerfile", dockerfile.as_bytes())?;

    let tar_gz = tar.into_inner()?.finish()?;
    Ok(tar_gz.into_inner().freeze())
}
