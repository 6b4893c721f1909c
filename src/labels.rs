//! Well-known label keys, prefixes and macros.
//!
//! Scheduling rules and service membership are carried on containers as
//! labels in the `io.rancher.*` namespace; this module is the single place
//! those keys are spelled out.

use std::collections::HashMap;

/// Label map attached to services, launch configs, hosts and instances.
pub type Labels = HashMap<String, String>;

/// Stack (environment) name of the owning service.
pub const LABEL_STACK_NAME: &str = "io.rancher.stack.name";

/// `stack/service[/launch-config]` of the owning service.
pub const LABEL_STACK_SERVICE_NAME: &str = "io.rancher.stack_service.name";

/// Legacy spelling of [`LABEL_STACK_SERVICE_NAME`].
pub const LABEL_PROJECT_SERVICE_NAME: &str = "io.rancher.project_service.name";

/// Launch config the instance was created from.
pub const LABEL_SERVICE_LAUNCH_CONFIG: &str = "io.rancher.service.launch.config";

/// Name given to the primary launch config of every service.
pub const PRIMARY_LAUNCH_CONFIG_NAME: &str = "io.rancher.service.primary.launch.config";

/// Deployment unit the instance belongs to.
pub const LABEL_SERVICE_DEPLOYMENT_UNIT: &str = "io.rancher.service.deployment.unit";

/// Hash of the launch config the instance was created from.
pub const LABEL_SERVICE_HASH: &str = "io.rancher.service.hash";

/// Common prefix of every affinity label.
pub const LABEL_AFFINITY_NAMESPACE: &str = "io.rancher.scheduler.affinity";

/// Container-label affinity header (`..._ne`, `..._soft`, `..._soft_ne` suffixes).
pub const LABEL_HEADER_AFFINITY_CONTAINER_LABEL: &str = "io.rancher.scheduler.affinity:container_label";

/// Container affinity header.
pub const LABEL_HEADER_AFFINITY_CONTAINER: &str = "io.rancher.scheduler.affinity:container";

/// Host-label affinity header.
pub const LABEL_HEADER_AFFINITY_HOST_LABEL: &str = "io.rancher.scheduler.affinity:host_label";

/// Environment header for container affinity (`affinity:container==web`).
pub const ENV_HEADER_AFFINITY_CONTAINER: &str = "affinity:container";

/// Environment header for container-label affinity (`affinity:tier==web`).
pub const ENV_HEADER_AFFINITY_CONTAINER_LABEL: &str = "affinity:";

/// Environment header for host-label affinity (`constraint:region==west`).
pub const ENV_HEADER_AFFINITY_HOST_LABEL: &str = "constraint:";

/// Replaced by the instance's own `service[/launch-config]` name.
pub const SERVICE_NAME_MACRO: &str = "${service_name}";

/// Replaced by the instance's stack name.
pub const STACK_NAME_MACRO: &str = "${stack_name}";

/// Deprecated alias of [`STACK_NAME_MACRO`].
pub const PROJECT_NAME_MACRO: &str = "${project_name}";
