use std::sync::Arc;

use anyhow::{Context, Error};
use log::{error, info};
use tokio::net::TcpListener;

use crate::{
    config::load_config,
    domain::{
        allocator::{PortAllocator, PortLedger},
        registry::AppRegistry,
        DeploymentService,
    },
    infra::{docker::DockerContainerRuntime, sqlite::SqliteStore, web::router},
};

mod config;
mod domain;
mod infra;
#[cfg(test)]
mod testing;

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("Start Shipyard - Your Rust single host PaaS");

    let config = load_config()?;
    info!("Loaded config {:?}", config);

    let runtime = DockerContainerRuntime::connect(&config.docker).await?;
    let store = SqliteStore::connect(&config.database.url, config.database.max_connections).await?;

    let ledger = PortLedger::new();
    let registry = Arc::new(AppRegistry::new(Arc::new(store), ledger.clone()));
    let allocator = Arc::new(PortAllocator::new(
        config.ports.min,
        config.ports.max,
        config.ports.attempts,
        ledger,
    ));
    let service = DeploymentService::new(registry, allocator, Arc::new(runtime), config.deploy_settings());

    let recovery = service.recover().await?;
    info!(
        "Recovered {} applications ({} interrupted deployments, {} resumed, {} lost containers)",
        recovery.restored, recovery.abandoned, recovery.resumed, recovery.lost
    );

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("Can't listen on {}", config.server.listen))?;
    info!("Listening on {}", config.server.listen);
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Shipyard stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Can't listen for shutdown signal : {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
