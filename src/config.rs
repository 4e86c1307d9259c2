use std::time::Duration;

use anyhow::{ensure, Context, Error};
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};

use crate::domain::DeploySettings;

#[derive(Debug, Default, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub docker: DockerConfig,
    pub database: DatabaseConfig,
    pub ports: PortsConfig,
    pub deploy: DeployConfig,
}

#[derive(Debug, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DockerConfig {
    pub socket: String,
    pub timeout_secs: u64,
    pub image_prefix: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: "/var/run/docker.sock".to_string(),
            timeout_secs: 120,
            image_prefix: "shipyard".to_string(),
        }
    }
}

#[derive(Debug, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://shipyard.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PortsConfig {
    pub min: u16,
    pub max: u16,
    pub attempts: u32,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            min: 3000,
            max: 9999,
            attempts: 100,
        }
    }
}

#[derive(Debug, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeployConfig {
    pub build_timeout_secs: u64,
    pub run_timeout_secs: u64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            build_timeout_secs: 900,
            run_timeout_secs: 120,
        }
    }
}

impl AppConfig {
    pub fn deploy_settings(&self) -> DeploySettings {
        DeploySettings {
            image_prefix: self.docker.image_prefix.clone(),
            build_timeout: Duration::from_secs(self.deploy.build_timeout_secs),
            run_timeout: Duration::from_secs(self.deploy.run_timeout_secs),
        }
    }

    fn validate(self) -> Result<Self, Error> {
        ensure!(
            self.ports.min > 0 && self.ports.min <= self.ports.max,
            "Invalid port range {}-{}",
            self.ports.min,
            self.ports.max
        );
        ensure!(self.ports.attempts > 0, "Port allocation needs at least one attempt");
        ensure!(
            !self.docker.image_prefix.is_empty()
                && self
                    .docker
                    .image_prefix
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_'),
            "Image prefix {:?} is not a valid docker name",
            self.docker.image_prefix
        );
        Ok(self)
    }
}

pub fn load_config() -> Result<AppConfig, Error> {
    let builder = Config::builder()
        .add_source(File::with_name("shipyard").required(false))
        .add_source(
            Environment::with_prefix("shipyard")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
    load_config_from(builder)
}

fn load_config_from(builder: ConfigBuilder<DefaultState>) -> Result<AppConfig, Error> {
    builder
        .build()
        .context("Can't load configuration")?
        .try_deserialize::<AppConfig>()
        .context("Can't deserialize AppConfig from loaded configuration")?
        .validate()
}
