//! In-memory doubles for the domain ports.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Error};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;

use crate::domain::{
    allocator::{PortAllocator, PortLedger},
    model::{
        Application, BuildSpec, ContainerRef, DeploymentEvent, EventAction, ImageRef, PruneReport,
        RunSpec,
    },
    port::{ContainerRuntime, PersistenceGateway},
    registry::AppRegistry,
    DeploySettings, DeploymentService,
};

/// A service wired to the given doubles, allocating over the whole default range.
pub fn deployment_service(
    store: Arc<MemoryStore>,
    runtime: Arc<FakeRuntime>,
    settings: DeploySettings,
) -> DeploymentService {
    deployment_service_in_range(store, runtime, settings, 3000, 9999)
}

pub fn deployment_service_in_range(
    store: Arc<MemoryStore>,
    runtime: Arc<FakeRuntime>,
    settings: DeploySettings,
    min: u16,
    max: u16,
) -> DeploymentService {
    let ledger = PortLedger::new();
    let registry = Arc::new(AppRegistry::new(store, ledger.clone()));
    let allocator = Arc::new(PortAllocator::new(min, max, 100, ledger));
    DeploymentService::new(registry, allocator, runtime, settings)
}

#[derive(Default)]
pub struct MemoryStore {
    apps: Mutex<HashMap<String, Application>>,
    events: Mutex<Vec<DeploymentEvent>>,
    failing: AtomicBool,
    failing_saves: AtomicUsize,
    save_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_apps(apps: Vec<Application>) -> Self {
        let store = Self::default();
        store
            .apps
            .lock()
            .unwrap()
            .extend(apps.into_iter().map(|app| (app.id.clone(), app)));
        store
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Makes the next `count` saves fail, everything else keeps working.
    pub fn fail_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Holds every following save until a permit is added to the returned
    /// semaphore, one save per permit.
    pub fn gate_saves(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.save_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn ungate_saves(&self) {
        *self.save_gate.lock().unwrap() = None;
    }

    pub fn stored(&self, id: &str) -> Option<Application> {
        self.apps.lock().unwrap().get(id).cloned()
    }

    pub fn actions(&self, app_id: &str) -> Vec<EventAction> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.app_id == app_id)
            .map(|event| event.action)
            .collect()
    }

    fn check(&self) -> Result<(), Error> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("store unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for MemoryStore {
    async fn save(&self, app: &Application) -> Result<(), Error> {
        let gate = self.save_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await?.forget();
        }
        self.check()?;
        let failing_saves = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if failing_saves.is_ok() {
            bail!("disk full");
        }
        self.apps.lock().unwrap().insert(app.id.clone(), app.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Vec<Application>, Error> {
        self.check()?;
        Ok(self.apps.lock().unwrap().values().cloned().collect())
    }

    async fn delete(&self, id: &str) -> Result<(), Error> {
        self.check()?;
        self.apps.lock().unwrap().remove(id);
        Ok(())
    }

    async fn append_event(&self, app_id: &str, action: EventAction, message: &str) -> Result<(), Error> {
        self.check()?;
        self.events.lock().unwrap().push(DeploymentEvent {
            app_id: app_id.to_string(),
            action,
            message: message.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn events(&self, app_id: &str) -> Result<Vec<DeploymentEvent>, Error> {
        self.check()?;
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.app_id == app_id)
            .cloned()
            .collect())
    }
}

/// Scriptable runtime recording every call it receives.
#[derive(Default)]
pub struct FakeRuntime {
    pub fail_build: AtomicBool,
    pub fail_run: AtomicBool,
    pub fail_stop: AtomicBool,
    pub build_delay: Mutex<Option<Duration>>,
    pub run_delay: Mutex<Option<Duration>>,
    /// Containers reported as no longer running.
    pub gone: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn build_image(&self, spec: &BuildSpec, image_name: &str) -> Result<ImageRef, Error> {
        self.record(format!("build {} {}", image_name, spec.language));
        let delay = *self.build_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_build.load(Ordering::SeqCst) {
            return Err(anyhow!("compilation error in main.go"));
        }
        Ok(ImageRef(format!("sha256:{image_name}")))
    }

    async fn run_container(&self, image: &ImageRef, run: &RunSpec) -> Result<ContainerRef, Error> {
        self.record(format!(
            "run {} {} {}:{}",
            image, run.container_name, run.host_port, run.container_port
        ));
        let delay = *self.run_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_run.load(Ordering::SeqCst) {
            return Err(anyhow!("port binding refused"));
        }
        Ok(ContainerRef(format!("ctr-{}", run.container_name)))
    }

    async fn stop_and_remove(&self, container: &ContainerRef) -> Result<(), Error> {
        self.record(format!("stop {}", container));
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(anyhow!("daemon unreachable"));
        }
        Ok(())
    }

    async fn remove_image(&self, image: &ImageRef) -> Result<(), Error> {
        self.record(format!("rmi {}", image));
        Ok(())
    }

    async fn container_running(&self, container: &ContainerRef) -> Result<bool, Error> {
        Ok(!self.gone.lock().unwrap().contains(&container.0))
    }

    async fn container_logs(&self, container: &ContainerRef, tail: usize) -> Result<Vec<String>, Error> {
        self.record(format!("logs {} {}", container, tail));
        Ok(vec![
            format!("{container} listening"),
            format!("{container} ready"),
        ])
    }

    async fn prune_images(&self) -> Result<PruneReport, Error> {
        self.record(String::from("prune"));
        Ok(PruneReport {
            images_deleted: 2,
            space_reclaimed: 1024,
        })
    }
}
