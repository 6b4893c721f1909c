//! In-memory object store with JSON snapshot persistence.
//!
//! Records live in `RwLock`-guarded maps. A snapshot can be written to and
//! read back from a local file so successive CLI runs see each other's work.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::store::ObjectStore;
use super::types::{Host, HostState, Instance, Service, ServiceExposeMap};
use crate::error::{CorralError, Result, StoreError};

/// Everything the store holds, in serializable form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Services by id.
    #[serde(default)]
    pub services: BTreeMap<i64, Service>,
    /// Hosts by id.
    #[serde(default)]
    pub hosts: BTreeMap<i64, Host>,
    /// Instances by id.
    #[serde(default)]
    pub instances: BTreeMap<i64, Instance>,
    /// Expose maps by id.
    #[serde(default)]
    pub expose_maps: BTreeMap<i64, ServiceExposeMap>,
    /// Next id to hand out.
    #[serde(default = "first_id")]
    pub next_id: i64,
}

const fn first_id() -> i64 {
    1
}

/// In-memory object store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Snapshot>,
}

impl Snapshot {
    /// Returns `id` if set, otherwise allocates one. Keeps `next_id` ahead of
    /// every id seen.
    fn assign_id(&mut self, id: i64) -> i64 {
        let id = if id == 0 { self.next_id.max(1) } else { id };
        self.next_id = self.next_id.max(id + 1);
        id
    }
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store from an existing snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
        }
    }

    /// Returns a copy of the current contents.
    pub async fn snapshot(&self) -> Snapshot {
        self.inner.read().await.clone()
    }

    /// Loads a store from a snapshot file.
    ///
    /// Returns `None` if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub async fn load_snapshot(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            debug!("Snapshot does not exist: {}", path.display());
            return Ok(None);
        }

        info!("Loading snapshot from: {}", path.display());

        let content = fs::read_to_string(path).await.map_err(|e| {
            CorralError::Store(StoreError::Corrupted {
                message: format!("Failed to read snapshot: {e}"),
            })
        })?;

        let snapshot: Snapshot = serde_json::from_str(&content).map_err(|e| {
            CorralError::Store(StoreError::Corrupted {
                message: format!("Failed to parse snapshot: {e}"),
            })
        })?;

        Ok(Some(Self::from_snapshot(snapshot)))
    }

    /// Writes the current contents to a snapshot file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or any filesystem step fails.
    pub async fn save_snapshot(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| write_failed("create snapshot directory", &e))?;
        }

        info!("Saving snapshot to: {}", path.display());

        let content = {
            let snapshot = self.inner.read().await;
            serde_json::to_string_pretty(&*snapshot)
                .map_err(|e| StoreError::serialization(format!("Failed to serialize snapshot: {e}")))?
        };

        // Write to a temporary file first, then rename
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| write_failed("create temp snapshot", &e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| write_failed("write snapshot", &e))?;
        file.sync_all().await.map_err(|e| write_failed("sync snapshot", &e))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| write_failed("rename snapshot", &e))?;

        debug!("Snapshot saved");
        Ok(())
    }
}

fn write_failed(step: &str, err: &std::io::Error) -> CorralError {
    CorralError::Store(StoreError::WriteFailed {
        message: format!("Failed to {step}: {err}"),
    })
}

fn missing(resource_type: &str, id: i64) -> CorralError {
    CorralError::Store(StoreError::not_found(resource_type, id))
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_service(&self, id: i64) -> Result<Service> {
        self.inner
            .read()
            .await
            .services
            .get(&id)
            .cloned()
            .ok_or_else(|| missing("service", id))
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        Ok(self.inner.read().await.services.values().cloned().collect())
    }

    async fn create_service(&self, mut service: Service) -> Result<Service> {
        let mut inner = self.inner.write().await;
        service.id = inner.assign_id(service.id);
        inner.services.insert(service.id, service.clone());
        Ok(service)
    }

    async fn update_service(&self, service: &Service) -> Result<()> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .services
            .get_mut(&service.id)
            .ok_or_else(|| missing("service", service.id))?;
        *slot = service.clone();
        Ok(())
    }

    async fn service_names_in_environment(&self, environment_id: i64) -> Result<Vec<String>> {
        Ok(self
            .inner
            .read()
            .await
            .services
            .values()
            .filter(|s| s.environment_id == environment_id && s.removed.is_none())
            .map(|s| s.name.clone())
            .collect())
    }

    async fn get_host(&self, id: i64) -> Result<Host> {
        self.inner
            .read()
            .await
            .hosts
            .get(&id)
            .cloned()
            .ok_or_else(|| missing("host", id))
    }

    async fn list_hosts(&self) -> Result<Vec<Host>> {
        Ok(self.inner.read().await.hosts.values().cloned().collect())
    }

    async fn create_host(&self, mut host: Host) -> Result<Host> {
        let mut inner = self.inner.write().await;
        host.id = inner.assign_id(host.id);
        inner.hosts.insert(host.id, host.clone());
        Ok(host)
    }

    async fn active_hosts(&self, account_id: i64) -> Result<Vec<Host>> {
        Ok(self
            .inner
            .read()
            .await
            .hosts
            .values()
            .filter(|h| h.account_id == account_id && h.state == HostState::Active)
            .cloned()
            .collect())
    }

    async fn get_instance(&self, id: i64) -> Result<Instance> {
        self.inner
            .read()
            .await
            .instances
            .get(&id)
            .cloned()
            .ok_or_else(|| missing("instance", id))
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        Ok(self.inner.read().await.instances.values().cloned().collect())
    }

    async fn create_instance(&self, mut instance: Instance) -> Result<Instance> {
        let mut inner = self.inner.write().await;
        instance.id = inner.assign_id(instance.id);
        inner.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn update_instance(&self, instance: &Instance) -> Result<()> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .instances
            .get_mut(&instance.id)
            .ok_or_else(|| missing("instance", instance.id))?;
        *slot = instance.clone();
        Ok(())
    }

    async fn find_instances_by_name(&self, account_id: i64, name: &str) -> Result<Vec<Instance>> {
        Ok(self
            .inner
            .read()
            .await
            .instances
            .values()
            .filter(|i| i.account_id == account_id && !i.state.is_removed() && i.name.eq_ignore_ascii_case(name))
            .cloned()
            .collect())
    }

    async fn find_instances_with_label(
        &self,
        account_id: i64,
        key: &str,
        value: &str,
    ) -> Result<Vec<Instance>> {
        Ok(self
            .inner
            .read()
            .await
            .instances
            .values()
            .filter(|i| i.account_id == account_id && !i.state.is_removed())
            .filter(|i| {
                i.labels
                    .iter()
                    .any(|(k, v)| k.eq_ignore_ascii_case(key) && v.eq_ignore_ascii_case(value))
            })
            .cloned()
            .collect())
    }

    async fn list_expose_maps(&self, service_id: i64) -> Result<Vec<ServiceExposeMap>> {
        Ok(self
            .inner
            .read()
            .await
            .expose_maps
            .values()
            .filter(|m| m.service_id == service_id)
            .cloned()
            .collect())
    }

    async fn expose_maps_for_instance(&self, instance_id: i64) -> Result<Vec<ServiceExposeMap>> {
        Ok(self
            .inner
            .read()
            .await
            .expose_maps
            .values()
            .filter(|m| m.instance_id == Some(instance_id) && m.removed.is_none())
            .cloned()
            .collect())
    }

    async fn create_expose_map(&self, mut map: ServiceExposeMap) -> Result<ServiceExposeMap> {
        let mut inner = self.inner.write().await;
        map.id = inner.assign_id(map.id);
        inner.expose_maps.insert(map.id, map.clone());
        Ok(map)
    }

    async fn update_expose_map(&self, map: &ServiceExposeMap) -> Result<()> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .expose_maps
            .get_mut(&map.id)
            .ok_or_else(|| missing("expose map", map.id))?;
        *slot = map.clone();
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Labels;
    use crate::state::types::InstanceState;
    use tempfile::TempDir;

    fn host(id: i64, state: HostState) -> Host {
        Host {
            id,
            account_id: 1,
            name: format!("host-{id}"),
            state,
            labels: Labels::new(),
        }
    }

    #[tokio::test]
    async fn test_ids_are_assigned_past_explicit_ones() {
        let store = MemoryStore::new();
        store.create_host(host(10, HostState::Active)).await.expect("create host");

        let instance = store
            .create_instance(Instance::new(1, "web"))
            .await
            .expect("create instance");
        assert_eq!(instance.id, 11);
    }

    #[tokio::test]
    async fn test_active_hosts_filters_state_and_account() {
        let store = MemoryStore::new();
        store.create_host(host(1, HostState::Active)).await.expect("create host");
        store.create_host(host(2, HostState::Inactive)).await.expect("create host");
        let mut other = host(3, HostState::Active);
        other.account_id = 2;
        store.create_host(other).await.expect("create host");

        let hosts = store.active_hosts(1).await.expect("active hosts");
        assert_eq!(hosts.iter().map(|h| h.id).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn test_label_lookup_is_case_insensitive_and_skips_removed() {
        let store = MemoryStore::new();
        let mut live = Instance::new(1, "a");
        live.labels.insert(String::from("Tier"), String::from("Web"));
        store.create_instance(live).await.expect("create instance");

        let mut gone = Instance::new(1, "b");
        gone.labels.insert(String::from("tier"), String::from("web"));
        gone.state = InstanceState::Removed;
        store.create_instance(gone).await.expect("create instance");

        let found = store
            .find_instances_with_label(1, "tier", "web")
            .await
            .expect("lookup");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "a");
    }

    #[tokio::test]
    async fn test_update_missing_record_is_not_found() {
        let store = MemoryStore::new();
        let result = store.update_instance(&Instance::new(1, "ghost")).await;
        assert!(result.expect_err("should fail").is_not_found());
    }

    #[tokio::test]
    async fn test_snapshot_save_and_load() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let path = temp.path().join("state").join("corral.json");

        let store = MemoryStore::new();
        store.create_host(host(4, HostState::Active)).await.expect("create host");
        store.save_snapshot(&path).await.expect("save snapshot");

        let loaded = MemoryStore::load_snapshot(&path)
            .await
            .expect("load snapshot")
            .expect("snapshot should exist");
        assert_eq!(loaded.get_host(4).await.expect("host").name, "host-4");
        assert_eq!(loaded.snapshot().await.next_id, 5);
    }

    #[tokio::test]
    async fn test_load_missing_snapshot() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let loaded = MemoryStore::load_snapshot(&temp.path().join("none.json"))
            .await
            .expect("load should not fail");
        assert!(loaded.is_none());
    }
}
