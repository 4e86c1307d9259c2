use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::Mutex;

use super::{
    allocator::{Claim, PortLedger, PortReservation},
    error::DeployError,
    model::{Application, Status, StatusChange},
    port::PersistenceGateway,
};

pub type Store = Arc<dyn PersistenceGateway + Send + Sync>;

/// `None` once the record has been removed, so a writer that fetched the slot
/// before the removal can't resurrect it.
type Slot = Arc<Mutex<Option<Application>>>;

/// In-memory view of every application, written through to the store.
///
/// Records are locked individually: a long write on one application never
/// blocks readers or writers of another.
pub struct AppRegistry {
    records: DashMap<String, Slot>,
    ledger: PortLedger,
    store: Store,
    inserting: Mutex<()>,
}

impl AppRegistry {
    pub fn new(store: Store, ledger: PortLedger) -> Self {
        Self {
            records: DashMap::new(),
            ledger,
            store,
            inserting: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Populates the registry with records loaded from storage, without
    /// writing them back.
    pub fn restore(&self, apps: Vec<Application>) -> usize {
        let mut restored = 0;
        for app in apps {
            if self.records.contains_key(&app.id) {
                warn!("Skipping duplicated stored application {}", app.id);
                continue;
            }
            if let Err(e) = self.ledger.claim(app.port, &app.id) {
                warn!("Stored application {} restored without port ownership : {}", app.id, e);
            }
            self.records
                .insert(app.id.clone(), Arc::new(Mutex::new(Some(app))));
            restored += 1;
        }
        restored
    }

    /// Stores a new record owning the reserved port. The reservation is
    /// committed only once the record is durable.
    pub async fn insert(
        &self,
        app: Application,
        reservation: PortReservation,
    ) -> Result<Application, DeployError> {
        let _inserting = self.inserting.lock().await;
        if self.records.contains_key(&app.id) {
            return Err(DeployError::DuplicateId(app.id));
        }
        if reservation.port() != app.port {
            let owner = match self.ledger.claim_of(app.port) {
                Some(Claim::Owned(owner)) => owner,
                Some(Claim::Reserved) => String::from("<reserved>"),
                None => String::from("<unreserved>"),
            };
            return Err(DeployError::PortInUse {
                port: app.port,
                owner,
            });
        }
        self.store
            .save(&app)
            .await
            .map_err(DeployError::persistence)?;
        self.records
            .insert(app.id.clone(), Arc::new(Mutex::new(Some(app.clone()))));
        self.ledger.commit(reservation, &app.id);
        debug!("Application {} registered on port {}", app.id, app.port);
        Ok(app)
    }

    pub async fn find(&self, id: &str) -> Result<Application, DeployError> {
        let slot = self.slot(id)?;
        let record = slot.lock().await;
        record
            .clone()
            .ok_or_else(|| DeployError::NotFound(id.to_string()))
    }

    /// Point in time copy of every record, oldest first.
    pub async fn list_all(&self) -> Vec<Application> {
        let slots: Vec<Slot> = self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut apps = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(app) = slot.lock().await.clone() {
                apps.push(app);
            }
        }
        apps.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        apps
    }

    /// Moves a record to `status`, persisting before the change becomes visible.
    pub async fn update_status(
        &self,
        id: &str,
        status: Status,
        change: StatusChange,
    ) -> Result<Application, DeployError> {
        let slot = self.slot(id)?;
        let mut record = slot.lock().await;
        let current = record
            .as_ref()
            .ok_or_else(|| DeployError::NotFound(id.to_string()))?;
        if !current.status.can_transition_to(status) {
            return Err(DeployError::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to: status,
            });
        }

        let mut next = current.clone();
        next.status = status;
        if change.language.is_some() {
            next.language = change.language;
        }
        if change.container_ref.is_some() {
            next.container_ref = change.container_ref;
        }
        if change.image_ref.is_some() {
            next.image_ref = change.image_ref;
        }
        next.error_message = change.error_message;
        next.updated_at = Utc::now().max(current.updated_at);

        self.store
            .save(&next)
            .await
            .map_err(DeployError::persistence)?;
        *record = Some(next.clone());
        Ok(next)
    }

    /// Removes a record whatever its status and returns its last state.
    ///
    /// The port goes back to the ledger unless the record was `Deploying`: its
    /// pipeline may still start a container on it, and hands the port back
    /// through [`AppRegistry::release_port`] once it has stopped.
    pub async fn remove(&self, id: &str) -> Result<Application, DeployError> {
        let slot = self.slot(id)?;
        let mut record = slot.lock().await;
        let app = record
            .clone()
            .ok_or_else(|| DeployError::NotFound(id.to_string()))?;
        self.store
            .delete(id)
            .await
            .map_err(DeployError::persistence)?;
        *record = None;
        self.records
            .remove_if(id, |_, current| Arc::ptr_eq(current, &slot));
        if app.status == Status::Deploying {
            debug!("Port {} stays claimed until the deployment of {} stops", app.port, id);
        } else {
            self.ledger.release(app.port, id);
        }
        Ok(app)
    }

    /// Gives back the port of a record removed while it was deploying.
    pub fn release_port(&self, app: &Application) {
        debug!("Releasing port {} of removed application {}", app.port, app.id);
        self.ledger.release(app.port, &app.id);
    }

    fn slot(&self, id: &str) -> Result<Slot, DeployError> {
        self.records
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DeployError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{allocator::PortAllocator, model::ContainerRef},
        testing::MemoryStore,
    };

    fn registry() -> (AppRegistry, Arc<MemoryStore>, PortLedger) {
        let store = Arc::new(MemoryStore::new());
        let ledger = PortLedger::new();
        (AppRegistry::new(store.clone(), ledger.clone()), store, ledger)
    }

    fn app(id: &str, port: u16) -> Application {
        Application::new(
            id.to_string(),
            format!("{id}-name"),
            format!("https://example.com/{id}.git"),
            port,
        )
    }

    async fn insert(registry: &AppRegistry, ledger: &PortLedger, id: &str, port: u16) -> Application {
        let reservation = ledger.try_reserve(port).unwrap();
        registry.insert(app(id, port), reservation).await.unwrap()
    }

    #[tokio::test]
    async fn find_returns_inserted_record() {
        let (registry, store, ledger) = registry();
        let inserted = insert(&registry, &ledger, "a", 4000).await;

        assert_eq!(registry.find("a").await.unwrap(), inserted);
        assert_eq!(store.stored("a"), Some(inserted));
        assert_eq!(ledger.claim_of(4000), Some(Claim::Owned(String::from("a"))));
    }

    #[tokio::test]
    async fn rejects_duplicate_id() {
        let (registry, _, ledger) = registry();
        insert(&registry, &ledger, "a", 4000).await;

        let reservation = ledger.try_reserve(4001).unwrap();
        let result = registry.insert(app("a", 4001), reservation).await;
        assert!(matches!(result, Err(DeployError::DuplicateId(id)) if id == "a"));
        assert_eq!(ledger.claim_of(4001), None);
    }

    #[tokio::test]
    async fn rejects_port_owned_by_another_record() {
        let (registry, _, ledger) = registry();
        insert(&registry, &ledger, "a", 4000).await;

        let reservation = ledger.try_reserve(4001).unwrap();
        let result = registry.insert(app("b", 4000), reservation).await;
        assert!(matches!(
            result,
            Err(DeployError::PortInUse { port: 4000, ref owner }) if owner == "a"
        ));
        assert!(registry.find("b").await.is_err());
    }

    #[tokio::test]
    async fn failed_insert_leaves_nothing_behind() {
        let (registry, store, ledger) = registry();
        store.fail(true);

        let reservation = ledger.try_reserve(4000).unwrap();
        let result = registry.insert(app("a", 4000), reservation).await;
        assert!(matches!(result, Err(DeployError::PersistenceFailure(_))));
        assert!(matches!(registry.find("a").await, Err(DeployError::NotFound(_))));
        assert_eq!(ledger.claim_of(4000), None);
    }

    #[tokio::test]
    async fn update_status_writes_through() {
        let (registry, store, ledger) = registry();
        let inserted = insert(&registry, &ledger, "a", 4000).await;

        registry
            .update_status("a", Status::Deploying, StatusChange::default())
            .await
            .unwrap();
        let running = registry
            .update_status(
                "a",
                Status::Running,
                StatusChange {
                    container_ref: Some(ContainerRef(String::from("c1"))),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(running.status, Status::Running);
        assert_eq!(running.container_ref, Some(ContainerRef(String::from("c1"))));
        assert!(running.updated_at >= inserted.updated_at);
        assert_eq!(store.stored("a"), Some(running));
    }

    #[tokio::test]
    async fn update_status_rejects_skipped_steps() {
        let (registry, _, ledger) = registry();
        insert(&registry, &ledger, "a", 4000).await;

        let result = registry
            .update_status("a", Status::Running, StatusChange::default())
            .await;
        assert!(matches!(
            result,
            Err(DeployError::InvalidTransition { from: Status::Idle, to: Status::Running, .. })
        ));
        assert_eq!(registry.find("a").await.unwrap().status, Status::Idle);
    }

    #[tokio::test]
    async fn memory_does_not_diverge_when_store_fails() {
        let (registry, store, ledger) = registry();
        insert(&registry, &ledger, "a", 4000).await;
        store.fail(true);

        let result = registry
            .update_status("a", Status::Deploying, StatusChange::default())
            .await;
        assert!(matches!(result, Err(DeployError::PersistenceFailure(_))));
        assert_eq!(registry.find("a").await.unwrap().status, Status::Idle);

        assert!(registry.remove("a").await.is_err());
        assert!(registry.find("a").await.is_ok());
    }

    #[tokio::test]
    async fn remove_twice_is_not_found_the_second_time() {
        let (registry, store, ledger) = registry();
        insert(&registry, &ledger, "a", 4000).await;

        registry.remove("a").await.unwrap();
        assert!(matches!(registry.remove("a").await, Err(DeployError::NotFound(_))));
        assert!(matches!(
            registry
                .update_status("a", Status::Deploying, StatusChange::default())
                .await,
            Err(DeployError::NotFound(_))
        ));
        assert_eq!(store.stored("a"), None);
        assert_eq!(ledger.claim_of(4000), None);
    }

    #[tokio::test]
    async fn removing_a_deploying_record_keeps_its_port_until_released() {
        let (registry, store, ledger) = registry();
        insert(&registry, &ledger, "a", 4000).await;
        registry
            .update_status("a", Status::Deploying, StatusChange::default())
            .await
            .unwrap();

        let removed = registry.remove("a").await.unwrap();
        assert_eq!(removed.status, Status::Deploying);
        assert_eq!(store.stored("a"), None);
        assert_eq!(ledger.claim_of(4000), Some(Claim::Owned(String::from("a"))));
        assert!(ledger.try_reserve(4000).is_none());

        registry.release_port(&removed);
        assert_eq!(ledger.claim_of(4000), None);
    }

    #[tokio::test]
    async fn list_all_is_a_snapshot() {
        let (registry, _, ledger) = registry();
        insert(&registry, &ledger, "a", 4000).await;
        insert(&registry, &ledger, "b", 4001).await;

        let snapshot = registry.list_all().await;
        registry.remove("a").await.unwrap();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.list_all().await.len(), 1);
    }

    #[tokio::test]
    async fn restore_does_not_write_back() {
        let (registry, store, ledger) = registry();
        let restored = registry.restore(vec![app("a", 4000), app("b", 4001)]);

        assert_eq!(restored, 2);
        assert_eq!(store.stored("a"), None);
        assert_eq!(registry.find("b").await.unwrap().port, 4001);
        assert_eq!(ledger.claim_of(4000), Some(Claim::Owned(String::from("a"))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creations_get_distinct_ports() {
        let (registry, _, ledger) = registry();
        let registry = Arc::new(registry);
        let allocator = Arc::new(PortAllocator::new(6000, 6099, 200, ledger));

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let registry = registry.clone();
                let allocator = allocator.clone();
                tokio::spawn(async move {
                    let reservation = allocator.allocate()?;
                    let port = reservation.port();
                    registry.insert(app(&format!("app-{i}"), port), reservation).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut ports: Vec<u16> = registry.list_all().await.iter().map(|a| a.port).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 20);
    }
}
