//! Inventory validation.
//!
//! This module checks an inventory for consistency before it seeds a store,
//! so reconciliation never runs against dangling references.

use crate::error::{ConfigError, CorralError, Result};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use validator::Validate;

use super::spec::{InstanceSpec, Inventory};
use crate::state::{Host, Service};

/// Largest scale a single service may request.
pub const MAX_SERVICE_SCALE: u32 = 1000;

/// Validator for inventories.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates an inventory.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn validate(&self, inventory: &Inventory) -> Result<ValidationResult> {
        let result = self.check(inventory);

        if let Some(first_error) = result.errors.first() {
            return Err(CorralError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }));
        }

        debug!("Inventory validation passed");
        Ok(result)
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, inventory: &Inventory) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_manager(inventory, &mut result);
        let hosts = Self::validate_hosts(&inventory.hosts, &mut result);
        let services = Self::validate_services(&inventory.services, &mut result);
        Self::validate_instances(&inventory.instances, &hosts, &services, &mut result);

        result
    }

    fn validate_manager(inventory: &Inventory, result: &mut ValidationResult) {
        if let Err(errors) = inventory.manager.validate() {
            for (field, field_errors) in errors.field_errors() {
                for error in field_errors {
                    result.errors.push(ValidationError {
                        field: format!("manager.{field}"),
                        message: error
                            .message
                            .as_ref()
                            .map_or_else(|| format!("Value out of range ({})", error.code), ToString::to_string),
                    });
                }
            }
        }
    }

    fn validate_hosts<'a>(hosts: &'a [Host], result: &mut ValidationResult) -> HashMap<i64, &'a Host> {
        if hosts.is_empty() {
            result.warnings.push(String::from("No hosts defined; nothing can be placed"));
        }

        let mut seen = HashMap::new();
        for (i, host) in hosts.iter().enumerate() {
            if host.id <= 0 {
                result.errors.push(ValidationError {
                    field: format!("hosts[{i}].id"),
                    message: format!("Host id must be positive, got {}", host.id),
                });
            }
            if seen.insert(host.id, host).is_some() {
                result.errors.push(ValidationError {
                    field: format!("hosts[{i}].id"),
                    message: format!("Duplicate host id: {}", host.id),
                });
            }
        }
        seen
    }

    fn validate_services<'a>(services: &'a [Service], result: &mut ValidationResult) -> HashMap<i64, &'a Service> {
        let mut seen = HashMap::new();
        let mut names = HashSet::new();

        for (i, service) in services.iter().enumerate() {
            let prefix = format!("services[{i}]");

            if service.id <= 0 {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.id"),
                    message: format!("Service id must be positive, got {}", service.id),
                });
            }
            if seen.insert(service.id, service).is_some() {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.id"),
                    message: format!("Duplicate service id: {}", service.id),
                });
            }

            if service.name.is_empty() {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: String::from("Service name cannot be empty"),
                });
            } else if !names.insert((service.environment_id, service.name.to_lowercase())) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!("Duplicate service name in environment: {}", service.name),
                });
            }

            if service.stack_name.is_empty() {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.stack_name"),
                    message: String::from("Stack name cannot be empty"),
                });
            }

            if service.scale > MAX_SERVICE_SCALE {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.scale"),
                    message: format!("Scale {} exceeds the maximum of {MAX_SERVICE_SCALE}", service.scale),
                });
            } else if service.scale == 0 {
                result.warnings.push(format!("{prefix}.scale: Scale 0 removes every unit"));
            }

            Self::validate_launch_configs(service, &prefix, result);
        }

        for (i, service) in services.iter().enumerate() {
            for sidekick in &service.sidekick_service_ids {
                if *sidekick == service.id {
                    result.errors.push(ValidationError {
                        field: format!("services[{i}].sidekick_service_ids"),
                        message: format!("Service {} lists itself as a sidekick", service.name),
                    });
                } else if !seen.contains_key(sidekick) {
                    result.errors.push(ValidationError {
                        field: format!("services[{i}].sidekick_service_ids"),
                        message: format!("Unknown sidekick service id: {sidekick}"),
                    });
                }
            }
        }

        seen
    }

    fn validate_launch_configs(service: &Service, prefix: &str, result: &mut ValidationResult) {
        let primaries = service.launch_configs.iter().filter(|lc| lc.is_primary()).count();
        if primaries != 1 {
            result.errors.push(ValidationError {
                field: format!("{prefix}.launch_configs"),
                message: format!(
                    "Service {} must have exactly one primary launch config, found {primaries}",
                    service.name
                ),
            });
        }

        let mut names = HashSet::new();
        for (i, lc) in service.launch_configs.iter().enumerate() {
            if !names.insert(lc.name.as_str()) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.launch_configs[{i}].name"),
                    message: format!("Duplicate launch config name: {}", lc.name),
                });
            }
            if lc.image.is_empty() {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.launch_configs[{i}].image"),
                    message: String::from("Container image cannot be empty"),
                });
            }
        }
    }

    fn validate_instances(
        instances: &[InstanceSpec],
        hosts: &HashMap<i64, &Host>,
        services: &HashMap<i64, &Service>,
        result: &mut ValidationResult,
    ) {
        let mut seen = HashSet::new();

        for (i, spec) in instances.iter().enumerate() {
            let prefix = format!("instances[{i}]");
            let instance = &spec.instance;

            if instance.id != 0 && !seen.insert(instance.id) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.id"),
                    message: format!("Duplicate instance id: {}", instance.id),
                });
            }

            if instance.name.is_empty() {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: String::from("Instance name cannot be empty"),
                });
            }

            if let Some(service_id) = spec.service_id {
                match services.get(&service_id) {
                    None => result.errors.push(ValidationError {
                        field: format!("{prefix}.service_id"),
                        message: format!("Unknown service id: {service_id}"),
                    }),
                    Some(service) if service.account_id != instance.account_id => {
                        result.errors.push(ValidationError {
                            field: format!("{prefix}.account_id"),
                            message: format!(
                                "Instance {} is in account {} but service {} is in account {}",
                                instance.name, instance.account_id, service.name, service.account_id
                            ),
                        });
                    }
                    Some(_) => {}
                }
            }

            if let Some(host_id) = instance.host_id {
                match hosts.get(&host_id) {
                    None => result.errors.push(ValidationError {
                        field: format!("{prefix}.host_id"),
                        message: format!("Unknown host id: {host_id}"),
                    }),
                    Some(host) if host.account_id != instance.account_id => {
                        result.errors.push(ValidationError {
                            field: format!("{prefix}.account_id"),
                            message: format!(
                                "Instance {} is in account {} but host {} is in account {}",
                                instance.name, instance.account_id, host_id, host.account_id
                            ),
                        });
                    }
                    Some(_) => {}
                }
            }
        }
    }
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Instance, LaunchConfig};
    use crate::testing::{host_fixture, service_fixture};

    fn inventory() -> Inventory {
        Inventory {
            hosts: vec![host_fixture(1, &[])],
            services: vec![service_fixture(10, "web")],
            ..Inventory::default()
        }
    }

    #[test]
    fn test_valid_inventory() {
        let result = ConfigValidator::new().validate(&inventory()).expect("valid");
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_two_primary_launch_configs() {
        let mut inventory = inventory();
        let extra = inventory.services[0].launch_configs[0].clone();
        inventory.services[0].launch_configs.push(extra);

        let result = ConfigValidator::new().check(&inventory);
        assert!(result.errors.iter().any(|e| e.message.contains("exactly one primary")));
        assert!(result.errors.iter().any(|e| e.message.contains("Duplicate launch config")));
    }

    #[test]
    fn test_unknown_sidekick_and_self_reference() {
        let mut inventory = inventory();
        inventory.services[0].sidekick_service_ids = vec![10, 99];

        let result = ConfigValidator::new().check(&inventory);
        assert_eq!(result.error_count(), 2);
    }

    #[test]
    fn test_instance_account_mismatch() {
        let mut inventory = inventory();
        let mut instance = Instance::new(2, "foo_web_1");
        instance.host_id = Some(1);
        inventory.instances.push(InstanceSpec {
            service_id: Some(10),
            instance,
        });

        let err = ConfigValidator::new().validate(&inventory).expect_err("invalid");
        assert!(matches!(
            err,
            CorralError::Config(ConfigError::ValidationError { field: Some(ref f), .. }) if f == "instances[0].account_id"
        ));
    }

    #[test]
    fn test_manager_range_checked() {
        let mut inventory = inventory();
        inventory.manager.lock_wait_timeout_secs = 0;

        let result = ConfigValidator::new().check(&inventory);
        assert_eq!(result.errors[0].field, "manager.lock_wait_timeout_secs");
    }

    #[test]
    fn test_empty_image_and_no_hosts() {
        let mut inventory = inventory();
        inventory.hosts.clear();
        inventory.services[0].launch_configs.push(LaunchConfig {
            name: String::from("worker"),
            image: String::new(),
            labels: Default::default(),
            environment: Default::default(),
            health_check: None,
        });

        let result = ConfigValidator::new().check(&inventory);
        assert_eq!(result.error_count(), 1);
        assert_eq!(result.warning_count(), 1);
    }
}
