//! Inventory and controller settings types.
//!
//! This module defines the structs that map to the `corral.yaml` inventory:
//! the hosts and services to reconcile, any instances already running, and
//! the tuning knobs of the deployment controller.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::state::{Host, Instance, Service};

/// Tuning knobs of the deployment controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ManagerConfig {
    /// How long a pass waits for its service group lock.
    #[serde(default = "default_lock_wait_timeout_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub lock_wait_timeout_secs: u64,

    /// How many times a waiter re-sends pending config items.
    #[serde(default = "default_item_wait_retries")]
    #[validate(range(max = 100))]
    pub item_wait_retries: u32,

    /// Pause between config-item polls.
    #[serde(default = "default_item_wait_timeout_millis")]
    #[validate(range(min = 1, max = 600_000))]
    pub item_wait_timeout_millis: u64,

    /// How long a started instance may take to report running.
    #[serde(default = "default_agent_start_timeout_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub agent_start_timeout_secs: u64,

    /// Grace window for health checks that do not set their own.
    #[serde(default = "default_health_grace_secs")]
    #[validate(range(max = 86_400))]
    pub default_health_grace_secs: u64,

    /// Pause between re-sends of config items whose requested and applied
    /// versions differ.
    #[serde(default = "default_resync_interval_millis")]
    #[validate(range(min = 1, max = 3_600_000))]
    pub resync_interval_millis: u64,
}

/// An instance declared in the inventory, optionally bound to a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceSpec {
    /// Service the instance belongs to.
    #[serde(default)]
    pub service_id: Option<i64>,
    /// The instance itself.
    #[serde(flatten)]
    pub instance: Instance,
}

/// The root inventory document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Inventory {
    /// Controller settings.
    #[serde(default)]
    pub manager: ManagerConfig,
    /// Hosts available for placement.
    #[serde(default)]
    pub hosts: Vec<Host>,
    /// Services to reconcile.
    #[serde(default)]
    pub services: Vec<Service>,
    /// Instances that already exist.
    #[serde(default)]
    pub instances: Vec<InstanceSpec>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            lock_wait_timeout_secs: default_lock_wait_timeout_secs(),
            item_wait_retries: default_item_wait_retries(),
            item_wait_timeout_millis: default_item_wait_timeout_millis(),
            agent_start_timeout_secs: default_agent_start_timeout_secs(),
            default_health_grace_secs: default_health_grace_secs(),
            resync_interval_millis: default_resync_interval_millis(),
        }
    }
}

const fn default_lock_wait_timeout_secs() -> u64 {
    30
}

const fn default_item_wait_retries() -> u32 {
    3
}

const fn default_item_wait_timeout_millis() -> u64 {
    1000
}

const fn default_agent_start_timeout_secs() -> u64 {
    120
}

const fn default_health_grace_secs() -> u64 {
    60
}

const fn default_resync_interval_millis() -> u64 {
    30_000
}

impl Inventory {
    /// Looks up a service by name.
    #[must_use]
    pub fn service_by_name(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }
}
