//! Object store trait definition.
//!
//! This module defines the interface the placement engine and the
//! deployment controller use to read and mutate entities.

use async_trait::async_trait;

use super::types::{Host, Instance, Service, ServiceExposeMap};
use crate::error::Result;

/// Trait for entity storage backends.
///
/// `create_*` methods assign a fresh id when the record's id is `0` and keep
/// the given id otherwise.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Loads a service by id.
    async fn get_service(&self, id: i64) -> Result<Service>;

    /// Lists every service, removed ones included.
    async fn list_services(&self) -> Result<Vec<Service>>;

    /// Creates a service.
    async fn create_service(&self, service: Service) -> Result<Service>;

    /// Replaces a stored service.
    async fn update_service(&self, service: &Service) -> Result<()>;

    /// Names of the non-removed services in an environment.
    async fn service_names_in_environment(&self, environment_id: i64) -> Result<Vec<String>>;

    /// Loads a host by id.
    async fn get_host(&self, id: i64) -> Result<Host>;

    /// Lists every host.
    async fn list_hosts(&self) -> Result<Vec<Host>>;

    /// Creates a host.
    async fn create_host(&self, host: Host) -> Result<Host>;

    /// Active hosts of an account, ordered by id.
    async fn active_hosts(&self, account_id: i64) -> Result<Vec<Host>>;

    /// Loads an instance by id.
    async fn get_instance(&self, id: i64) -> Result<Instance>;

    /// Lists every instance.
    async fn list_instances(&self) -> Result<Vec<Instance>>;

    /// Creates an instance.
    async fn create_instance(&self, instance: Instance) -> Result<Instance>;

    /// Replaces a stored instance.
    async fn update_instance(&self, instance: &Instance) -> Result<()>;

    /// Non-removed instances of an account with the given name, compared
    /// case-insensitively.
    async fn find_instances_by_name(&self, account_id: i64, name: &str) -> Result<Vec<Instance>>;

    /// Non-removed instances of an account carrying `key=value`, compared
    /// case-insensitively.
    async fn find_instances_with_label(
        &self,
        account_id: i64,
        key: &str,
        value: &str,
    ) -> Result<Vec<Instance>>;

    /// Lists the expose maps of a service, removed ones included.
    async fn list_expose_maps(&self, service_id: i64) -> Result<Vec<ServiceExposeMap>>;

    /// Non-removed expose maps bound to an instance.
    async fn expose_maps_for_instance(&self, instance_id: i64) -> Result<Vec<ServiceExposeMap>>;

    /// Creates an expose map.
    async fn create_expose_map(&self, map: ServiceExposeMap) -> Result<ServiceExposeMap>;

    /// Replaces a stored expose map.
    async fn update_expose_map(&self, map: &ServiceExposeMap) -> Result<()>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}
