//! Configuration module for the corral controller.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing the `corral.yaml` inventory
//! - Validation of inventory consistency
//! - Computing launch config hashes for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{
    apply_env_overrides, find_config_file, ConfigParser, DEFAULT_CONFIG_FILES, ENV_HEALTH_GRACE_SECS,
    ENV_ITEM_WAIT_RETRIES, ENV_ITEM_WAIT_TIMEOUT_MILLIS, ENV_LOCK_TIMEOUT_SECS,
};
pub use spec::{InstanceSpec, Inventory, ManagerConfig};
pub use validator::{ConfigValidator, ValidationError, ValidationResult, MAX_SERVICE_SCALE};
