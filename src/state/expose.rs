//! Service membership through expose maps.
//!
//! An expose map binds an instance, an external IP address or an external
//! hostname to a service. Deployment units are rebuilt from the instance
//! maps of a service on every reconciliation pass.

use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use super::store::ObjectStore;
use super::types::{ExposeMapState, Instance, Service, ServiceExposeMap};
use crate::error::Result;
use crate::labels::{LABEL_SERVICE_LAUNCH_CONFIG, PRIMARY_LAUNCH_CONFIG_NAME};

/// Expose map queries and mutations on top of an [`ObjectStore`].
#[derive(Clone)]
pub struct ExposeMapDao {
    store: Arc<dyn ObjectStore>,
}

impl ExposeMapDao {
    /// Creates a DAO over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Creates an instance and the map binding it to `service`.
    ///
    /// # Errors
    ///
    /// Returns an error if either record cannot be stored.
    pub async fn create_service_instance(
        &self,
        service: &Service,
        instance: Instance,
    ) -> Result<(Instance, ServiceExposeMap)> {
        let instance = self.store.create_instance(instance).await?;
        let map = self.create_instance_map(service, &instance).await?;
        Ok((instance, map))
    }

    /// Binds an existing instance to `service`.
    ///
    /// The DNS prefix is the instance's launch config name, or `None` for the
    /// primary launch config.
    ///
    /// # Errors
    ///
    /// Returns an error if the map cannot be stored.
    pub async fn create_instance_map(
        &self,
        service: &Service,
        instance: &Instance,
    ) -> Result<ServiceExposeMap> {
        let dns_prefix = instance
            .labels
            .get(LABEL_SERVICE_LAUNCH_CONFIG)
            .filter(|lc| !lc.eq_ignore_ascii_case(PRIMARY_LAUNCH_CONFIG_NAME))
            .cloned();

        let mut map = ServiceExposeMap::new(service.account_id, service.id);
        map.instance_id = Some(instance.id);
        map.dns_prefix = dns_prefix;
        self.store.create_expose_map(map).await
    }

    /// Binds an external IP address to `service`, reusing a live map if one
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn create_ip_map(&self, service: &Service, ip_address: &str) -> Result<ServiceExposeMap> {
        let existing = self
            .store
            .list_expose_maps(service.id)
            .await?
            .into_iter()
            .find(|m| m.removed.is_none() && m.ip_address.as_deref() == Some(ip_address));
        if let Some(map) = existing {
            return Ok(map);
        }

        let mut map = ServiceExposeMap::new(service.account_id, service.id);
        map.ip_address = Some(ip_address.to_string());
        self.store.create_expose_map(map).await
    }

    /// Binds an external hostname to `service`, reusing a live map if one
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn create_hostname_map(&self, service: &Service, host_name: &str) -> Result<ServiceExposeMap> {
        let existing = self
            .store
            .list_expose_maps(service.id)
            .await?
            .into_iter()
            .find(|m| m.removed.is_none() && m.host_name.as_deref() == Some(host_name));
        if let Some(map) = existing {
            return Ok(map);
        }

        let mut map = ServiceExposeMap::new(service.account_id, service.id);
        map.host_name = Some(host_name.to_string());
        self.store.create_expose_map(map).await
    }

    /// Live instance maps of a service whose instance is not being removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn non_removed_instance_maps(&self, service_id: i64) -> Result<Vec<ServiceExposeMap>> {
        let mut maps = Vec::new();
        for map in self.store.list_expose_maps(service_id).await? {
            let Some(instance_id) = map.instance_id.filter(|_| map.is_live()) else {
                continue;
            };
            match self.store.get_instance(instance_id).await {
                Ok(instance) if !instance.state.is_removed() => maps.push(map),
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    debug!("Expose map {} points at missing instance {instance_id}", map.id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(maps)
    }

    /// Live IP address maps of a service.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn non_removed_ip_maps(&self, service_id: i64) -> Result<Vec<ServiceExposeMap>> {
        Ok(self
            .store
            .list_expose_maps(service_id)
            .await?
            .into_iter()
            .filter(|m| m.is_live() && m.ip_address.is_some())
            .collect())
    }

    /// Live hostname maps of a service.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn non_removed_hostname_maps(&self, service_id: i64) -> Result<Vec<ServiceExposeMap>> {
        Ok(self
            .store
            .list_expose_maps(service_id)
            .await?
            .into_iter()
            .filter(|m| m.is_live() && m.host_name.is_some())
            .collect())
    }

    /// Instances serving a service: map requested, activating or active, and
    /// instance not being removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn list_service_instances(&self, service_id: i64) -> Result<Vec<Instance>> {
        let mut instances = Vec::new();
        for map in self.store.list_expose_maps(service_id).await? {
            if !matches!(
                map.state,
                ExposeMapState::Requested | ExposeMapState::Activating | ExposeMapState::Active
            ) {
                continue;
            }
            let Some(instance_id) = map.instance_id else {
                continue;
            };
            match self.store.get_instance(instance_id).await {
                Ok(instance) if !instance.state.is_removed() => instances.push(instance),
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(instances)
    }

    /// Returns true if the map belongs to the primary launch config.
    #[must_use]
    pub const fn is_primary(map: &ServiceExposeMap) -> bool {
        map.dns_prefix.is_none()
    }

    /// Returns true if the map is requested, activating, active or updating.
    #[must_use]
    pub const fn is_active_map(map: &ServiceExposeMap) -> bool {
        matches!(
            map.state,
            ExposeMapState::Requested
                | ExposeMapState::Activating
                | ExposeMapState::Active
                | ExposeMapState::UpdatingActive
        )
    }

    /// The live map binding an instance to its service, if it has one.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn find_instance_map(&self, instance_id: i64) -> Result<Option<ServiceExposeMap>> {
        Ok(self
            .store
            .expose_maps_for_instance(instance_id)
            .await?
            .into_iter()
            .next())
    }

    /// The non-removed service of an account that an IP address is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn ip_address_service(&self, ip_address: &str, account_id: i64) -> Result<Option<Service>> {
        for service in self.store.list_services().await? {
            if service.account_id != account_id || service.removed.is_some() {
                continue;
            }
            let bound = self
                .store
                .list_expose_maps(service.id)
                .await?
                .iter()
                .any(|m| m.ip_address.as_deref() == Some(ip_address));
            if bound {
                return Ok(Some(service));
            }
        }
        Ok(None)
    }

    /// Marks an instance's maps removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn remove_instance_maps(&self, instance_id: i64) -> Result<()> {
        for map in self.store.expose_maps_for_instance(instance_id).await? {
            self.mark_removed(map).await?;
        }
        Ok(())
    }

    /// Releases the IP address and hostname bindings of a removed service.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn remove_service_maps(&self, service_id: i64) -> Result<usize> {
        let mut released = 0;
        for map in self.store.list_expose_maps(service_id).await? {
            if map.is_live() && (map.ip_address.is_some() || map.host_name.is_some()) {
                self.mark_removed(map).await?;
                released += 1;
            }
        }
        debug!("Released {released} external binding(s) of service {service_id}");
        Ok(released)
    }

    async fn mark_removed(&self, mut map: ServiceExposeMap) -> Result<()> {
        map.state = ExposeMapState::Removed;
        map.removed = Some(Utc::now());
        self.store.update_expose_map(&map).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;
    use crate::state::types::InstanceState;
    use crate::testing::service_fixture;

    fn dao() -> (ExposeMapDao, Arc<dyn ObjectStore>) {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        (ExposeMapDao::new(Arc::clone(&store)), store)
    }

    #[tokio::test]
    async fn test_dns_prefix_only_for_secondary_launch_configs() {
        let (dao, _store) = dao();
        let service = service_fixture(1, "web");

        let mut primary = Instance::new(1, "foo_web_1");
        primary.labels = service.system_labels(PRIMARY_LAUNCH_CONFIG_NAME);
        let (_, primary_map) = dao
            .create_service_instance(&service, primary)
            .await
            .expect("create primary");
        assert!(ExposeMapDao::is_primary(&primary_map));

        let mut sidekick = Instance::new(1, "foo_web_worker_1");
        sidekick.labels = service.system_labels("worker");
        let (_, sidekick_map) = dao
            .create_service_instance(&service, sidekick)
            .await
            .expect("create sidekick");
        assert_eq!(sidekick_map.dns_prefix.as_deref(), Some("worker"));
        assert!(!ExposeMapDao::is_primary(&sidekick_map));
    }

    #[tokio::test]
    async fn test_ip_map_is_created_once() {
        let (dao, _store) = dao();
        let service = service_fixture(1, "web");

        let first = dao.create_ip_map(&service, "10.0.0.1").await.expect("create");
        let second = dao.create_ip_map(&service, "10.0.0.1").await.expect("create");
        assert_eq!(first.id, second.id);
        assert_eq!(dao.non_removed_ip_maps(1).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn test_removed_instances_drop_out_of_service_listing() {
        let (dao, store) = dao();
        let service = service_fixture(1, "web");

        let (instance, _) = dao
            .create_service_instance(&service, Instance::new(1, "foo_web_1"))
            .await
            .expect("create");
        assert_eq!(dao.list_service_instances(1).await.expect("list").len(), 1);

        let mut removed = instance.clone();
        removed.state = InstanceState::Removed;
        store.update_instance(&removed).await.expect("update");

        assert!(dao.list_service_instances(1).await.expect("list").is_empty());
        assert!(dao.non_removed_instance_maps(1).await.expect("list").is_empty());
        assert!(dao.find_instance_map(instance.id).await.expect("find").is_some());
    }

    #[tokio::test]
    async fn test_remove_service_maps_releases_external_bindings() {
        let (dao, store) = dao();
        let service = store
            .create_service(service_fixture(1, "web"))
            .await
            .expect("create service");

        dao.create_ip_map(&service, "10.0.0.1").await.expect("ip");
        dao.create_hostname_map(&service, "web.example.com").await.expect("hostname");
        dao.create_service_instance(&service, Instance::new(1, "foo_web_1"))
            .await
            .expect("instance");

        assert_eq!(
            dao.ip_address_service("10.0.0.1", 1)
                .await
                .expect("lookup")
                .map(|s| s.id),
            Some(1)
        );

        let released = dao.remove_service_maps(1).await.expect("remove");
        assert_eq!(released, 2);
        assert!(dao.non_removed_ip_maps(1).await.expect("list").is_empty());
        assert!(dao.non_removed_hostname_maps(1).await.expect("list").is_empty());
        assert_eq!(dao.non_removed_instance_maps(1).await.expect("list").len(), 1);
    }

    #[test]
    fn test_active_map_states() {
        let mut map = ServiceExposeMap::new(1, 1);
        assert!(ExposeMapDao::is_active_map(&map));
        map.state = ExposeMapState::Removing;
        assert!(!ExposeMapDao::is_active_map(&map));
    }
}
