//! Entity types for services, hosts, instances and expose maps.
//!
//! These are the records the object store persists and the reconciliation
//! controller reads to build deployment units.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::labels::{
    Labels, LABEL_SERVICE_DEPLOYMENT_UNIT, LABEL_SERVICE_HASH, LABEL_SERVICE_LAUNCH_CONFIG,
    LABEL_STACK_NAME, LABEL_STACK_SERVICE_NAME, PRIMARY_LAUNCH_CONFIG_NAME,
};

/// Lifecycle state of a service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Created but never activated.
    Requested,
    /// Not running.
    Inactive,
    /// Being activated.
    Activating,
    /// Running.
    Active,
    /// Being updated while running.
    UpdatingActive,
    /// Being updated while stopped.
    UpdatingInactive,
    /// Being stopped.
    Deactivating,
    /// Being removed.
    Removing,
    /// Removed.
    Removed,
}

/// Lifecycle state of a host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    /// Accepting containers.
    #[default]
    Active,
    /// Not accepting containers.
    Inactive,
    /// Removed.
    Removed,
}

/// Lifecycle state of a container instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Created, not yet started.
    #[default]
    Requested,
    /// Start requested on the agent.
    Starting,
    /// Running.
    Running,
    /// Stop requested on the agent.
    Stopping,
    /// Stopped.
    Stopped,
    /// Failed.
    Error,
    /// Being removed.
    Removing,
    /// Removed.
    Removed,
}

/// Reported health of an instance with a health check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Passing.
    Healthy,
    /// No verdict yet.
    Initializing,
    /// Failing.
    Unhealthy,
}

/// Lifecycle state of a service expose map.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExposeMapState {
    /// Created.
    #[default]
    Requested,
    /// Being activated.
    Activating,
    /// Active.
    Active,
    /// Being updated.
    UpdatingActive,
    /// Being removed.
    Removing,
    /// Removed.
    Removed,
}

/// A logical, scalable workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Service {
    /// Service id.
    pub id: i64,
    /// Owning account.
    pub account_id: i64,
    /// Stack (environment) the service lives in.
    pub environment_id: i64,
    /// Stack name, used for `stack/service` references.
    pub stack_name: String,
    /// Service name, unique within the stack.
    pub name: String,
    /// Current state.
    pub state: ServiceState,
    /// Desired number of deployment units.
    #[serde(default = "default_scale")]
    pub scale: u32,
    /// Service-level labels inherited by every launch config.
    #[serde(default)]
    pub labels: Labels,
    /// Launch configs; exactly one is primary.
    pub launch_configs: Vec<LaunchConfig>,
    /// Services activated and locked together with this one.
    #[serde(default)]
    pub sidekick_service_ids: Vec<i64>,
    /// When the service was removed.
    #[serde(default)]
    pub removed: Option<DateTime<Utc>>,
}

/// One container shape within a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Launch config name; [`PRIMARY_LAUNCH_CONFIG_NAME`] for the primary.
    #[serde(default = "default_launch_config_name")]
    pub name: String,
    /// Container image.
    pub image: String,
    /// Container labels, including scheduling rules.
    #[serde(default)]
    pub labels: Labels,
    /// Container environment, may carry swarm-style affinity keys.
    #[serde(default)]
    pub environment: Labels,
    /// Optional health check.
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
}

/// Health check settings relevant to reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheckSpec {
    /// Startup window in which failures do not count.
    #[serde(default)]
    pub grace_period_secs: Option<u64>,
}

/// A host containers can be placed on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Host {
    /// Host id.
    pub id: i64,
    /// Owning account.
    pub account_id: i64,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Current state.
    #[serde(default)]
    pub state: HostState,
    /// Host labels matched by host affinity rules.
    #[serde(default)]
    pub labels: Labels,
}

/// A container instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    /// Instance id, assigned by the store.
    #[serde(default)]
    pub id: i64,
    /// Owning account.
    pub account_id: i64,
    /// Container name.
    pub name: String,
    /// Current state.
    #[serde(default)]
    pub state: InstanceState,
    /// Host the instance runs on.
    #[serde(default)]
    pub host_id: Option<i64>,
    /// Container labels.
    #[serde(default)]
    pub labels: Labels,
    /// Container environment.
    #[serde(default)]
    pub environment: Labels,
    /// Ordinal within its launch config.
    #[serde(default)]
    pub service_index: Option<u32>,
    /// Latest health verdict, if a health check is configured.
    #[serde(default)]
    pub health_state: Option<HealthState>,
    /// When the instance last reached running.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

/// Binds an instance, IP address or hostname to a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceExposeMap {
    /// Map id, assigned by the store.
    #[serde(default)]
    pub id: i64,
    /// Owning account.
    pub account_id: i64,
    /// Exposed service.
    pub service_id: i64,
    /// Bound instance.
    #[serde(default)]
    pub instance_id: Option<i64>,
    /// Bound external IP address.
    #[serde(default)]
    pub ip_address: Option<String>,
    /// Bound external hostname.
    #[serde(default)]
    pub host_name: Option<String>,
    /// DNS prefix; `None` for primary launch config members.
    #[serde(default)]
    pub dns_prefix: Option<String>,
    /// Current state.
    #[serde(default)]
    pub state: ExposeMapState,
    /// When the map was removed.
    #[serde(default)]
    pub removed: Option<DateTime<Utc>>,
}

const fn default_scale() -> u32 {
    1
}

fn default_launch_config_name() -> String {
    String::from(PRIMARY_LAUNCH_CONFIG_NAME)
}

impl ServiceState {
    /// Returns true while a lifecycle process owns the service.
    #[must_use]
    pub const fn is_transitioning(self) -> bool {
        matches!(
            self,
            Self::Activating
                | Self::UpdatingActive
                | Self::UpdatingInactive
                | Self::Deactivating
                | Self::Removing
        )
    }

    /// Returns true if units of a service in this state should be running.
    #[must_use]
    pub const fn is_active_eligible(self) -> bool {
        matches!(self, Self::Activating | Self::Active | Self::UpdatingActive)
    }
}

impl InstanceState {
    /// Returns true once removal has begun.
    #[must_use]
    pub const fn is_removed(self) -> bool {
        matches!(self, Self::Removing | Self::Removed)
    }
}

impl Service {
    /// Names of all launch configs, primary first.
    #[must_use]
    pub fn launch_config_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.launch_configs.iter().map(|lc| lc.name.as_str()).collect();
        names.sort_by_key(|name| *name != PRIMARY_LAUNCH_CONFIG_NAME);
        names
    }

    /// Looks up a launch config by name.
    #[must_use]
    pub fn launch_config(&self, name: &str) -> Option<&LaunchConfig> {
        self.launch_configs.iter().find(|lc| lc.name == name)
    }

    /// Returns true if the service should currently have running units.
    #[must_use]
    pub const fn is_active_eligible(&self) -> bool {
        self.removed.is_none() && self.state.is_active_eligible()
    }

    /// `stack/service` for the primary, `stack/service/launch-config` otherwise.
    #[must_use]
    pub fn stack_service_name(&self, launch_config: &str) -> String {
        if launch_config == PRIMARY_LAUNCH_CONFIG_NAME {
            format!("{}/{}", self.stack_name, self.name)
        } else {
            format!("{}/{}/{launch_config}", self.stack_name, self.name)
        }
    }

    /// Container name for the given launch config and ordinal.
    #[must_use]
    pub fn instance_name(&self, launch_config: &str, index: u32) -> String {
        if launch_config == PRIMARY_LAUNCH_CONFIG_NAME {
            format!("{}_{}_{index}", self.stack_name, self.name)
        } else {
            format!("{}_{}_{launch_config}_{index}", self.stack_name, self.name)
        }
    }

    /// System labels every instance of the given launch config carries.
    #[must_use]
    pub fn system_labels(&self, launch_config: &str) -> Labels {
        let mut labels = Labels::new();
        labels.insert(LABEL_STACK_NAME.to_string(), self.stack_name.clone());
        labels.insert(
            LABEL_STACK_SERVICE_NAME.to_string(),
            self.stack_service_name(launch_config),
        );
        labels.insert(LABEL_SERVICE_LAUNCH_CONFIG.to_string(), launch_config.to_string());
        labels
    }
}

impl LaunchConfig {
    /// Returns true for the primary launch config.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.name == PRIMARY_LAUNCH_CONFIG_NAME
    }
}

impl Instance {
    /// Creates an unsaved instance.
    #[must_use]
    pub fn new(account_id: i64, name: impl Into<String>) -> Self {
        Self {
            id: 0,
            account_id,
            name: name.into(),
            state: InstanceState::Requested,
            host_id: None,
            labels: Labels::new(),
            environment: Labels::new(),
            service_index: None,
            health_state: None,
            started_at: None,
        }
    }

    /// Deployment unit uuid, if the instance belongs to one.
    #[must_use]
    pub fn deployment_unit(&self) -> Option<&str> {
        self.labels.get(LABEL_SERVICE_DEPLOYMENT_UNIT).map(String::as_str)
    }

    /// Launch config name; instances without the label count as primary.
    #[must_use]
    pub fn launch_config_name(&self) -> &str {
        self.labels
            .get(LABEL_SERVICE_LAUNCH_CONFIG)
            .map_or(PRIMARY_LAUNCH_CONFIG_NAME, String::as_str)
    }

    /// Launch config hash recorded at creation.
    #[must_use]
    pub fn config_hash(&self) -> Option<&str> {
        self.labels.get(LABEL_SERVICE_HASH).map(String::as_str)
    }

    /// Returns true if the instance is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running
    }
}

impl ServiceExposeMap {
    /// Creates an unsaved map for the given service.
    #[must_use]
    pub const fn new(account_id: i64, service_id: i64) -> Self {
        Self {
            id: 0,
            account_id,
            service_id,
            instance_id: None,
            ip_address: None,
            host_name: None,
            dns_prefix: None,
            state: ExposeMapState::Requested,
            removed: None,
        }
    }

    /// Returns true if the map has not been removed.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.removed.is_none()
            && !matches!(self.state, ExposeMapState::Removing | ExposeMapState::Removed)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            Self::Requested => "requested",
            Self::Inactive => "inactive",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::UpdatingActive => "updating-active",
            Self::UpdatingInactive => "updating-inactive",
            Self::Deactivating => "deactivating",
            Self::Removing => "removing",
            Self::Removed => "removed",
        };
        write!(f, "{state}")
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            Self::Requested => "requested",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Removing => "removing",
            Self::Removed => "removed",
        };
        write!(f, "{state}")
    }
}
