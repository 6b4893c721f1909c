//! Configuration parser for loading the inventory.
//!
//! This module handles loading the inventory from YAML files and applying
//! environment variable overrides to the controller settings.

use crate::error::{ConfigError, CorralError, Result};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use super::spec::{Inventory, ManagerConfig};

/// Overrides `manager.lock_wait_timeout_secs`.
pub const ENV_LOCK_TIMEOUT_SECS: &str = "CORRAL_LOCK_TIMEOUT_SECS";

/// Overrides `manager.item_wait_retries`.
pub const ENV_ITEM_WAIT_RETRIES: &str = "CORRAL_ITEM_WAIT_RETRIES";

/// Overrides `manager.item_wait_timeout_millis`.
pub const ENV_ITEM_WAIT_TIMEOUT_MILLIS: &str = "CORRAL_ITEM_WAIT_TIMEOUT_MILLIS";

/// Overrides `manager.default_health_grace_secs`.
pub const ENV_HEALTH_GRACE_SECS: &str = "CORRAL_HEALTH_GRACE_SECS";

/// Configuration parser for loading the inventory.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving the `.env` file.
    base_path: Option<std::path::PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving the `.env` file.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads the inventory from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Inventory> {
        let path = path.as_ref();
        info!("Loading inventory from: {}", path.display());

        if !path.exists() {
            return Err(CorralError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            CorralError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses the inventory from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<Inventory> {
        debug!("Parsing YAML inventory");

        let inventory: Inventory = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            CorralError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed inventory with {} host(s), {} service(s), {} instance(s)",
            inventory.hosts.len(),
            inventory.services.len(),
            inventory.instances.len()
        );
        Ok(inventory)
    }

    /// Loads the inventory with environment variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// is not a number.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<Inventory> {
        let mut inventory = self.load_file(path)?;
        apply_env_overrides(&mut inventory.manager, |name| std::env::var(name).ok())?;
        Ok(inventory)
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                CorralError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Applies `CORRAL_*` overrides to the controller settings.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidEnvVar`] if an override is not a number.
pub fn apply_env_overrides(
    config: &mut ManagerConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(value) = parse_override(&lookup, ENV_LOCK_TIMEOUT_SECS)? {
        debug!("Overriding manager.lock_wait_timeout_secs from environment");
        config.lock_wait_timeout_secs = value;
    }

    if let Some(value) = parse_override(&lookup, ENV_ITEM_WAIT_RETRIES)? {
        debug!("Overriding manager.item_wait_retries from environment");
        config.item_wait_retries = value;
    }

    if let Some(value) = parse_override(&lookup, ENV_ITEM_WAIT_TIMEOUT_MILLIS)? {
        debug!("Overriding manager.item_wait_timeout_millis from environment");
        config.item_wait_timeout_millis = value;
    }

    if let Some(value) = parse_override(&lookup, ENV_HEALTH_GRACE_SECS)? {
        debug!("Overriding manager.default_health_grace_secs from environment");
        config.default_health_grace_secs = value;
    }

    Ok(())
}

fn parse_override<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    raw.trim().parse().map(Some).map_err(|_| {
        CorralError::Config(ConfigError::InvalidEnvVar {
            name: name.to_string(),
            value: raw,
        })
    })
}

/// Default inventory file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["corral.yaml", "corral.yml", "inventory.yaml"];

/// Finds the inventory file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no inventory file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found inventory file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(CorralError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::PRIMARY_LAUNCH_CONFIG_NAME;
    use crate::state::ServiceState;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_parse_minimal_inventory() {
        let parser = ConfigParser::new();
        let inventory = parser.parse_yaml("hosts: []\n", None).expect("parse");

        assert!(inventory.services.is_empty());
        assert_eq!(inventory.manager, ManagerConfig::default());
    }

    #[test]
    fn test_parse_full_inventory() {
        let yaml = r#"
manager:
  lock_wait_timeout_secs: 5
hosts:
  - id: 1
    account_id: 1
    name: h1
    labels:
      region: west
services:
  - id: 10
    account_id: 1
    environment_id: 1
    stack_name: foo
    name: web
    state: active
    scale: 2
    launch_configs:
      - image: nginx
        labels:
          io.rancher.scheduler.affinity:host_label: region=west
      - name: worker
        image: busybox
        health_check:
          grace_period_secs: 30
instances:
  - service_id: 10
    account_id: 1
    name: foo_web_1
    state: running
    host_id: 1
"#;
        let inventory = ConfigParser::new().parse_yaml(yaml, None).expect("parse");

        assert_eq!(inventory.manager.lock_wait_timeout_secs, 5);
        assert_eq!(inventory.manager.item_wait_retries, 3);

        let web = inventory.service_by_name("web").expect("service");
        assert_eq!(web.state, ServiceState::Active);
        assert_eq!(web.launch_configs[0].name, PRIMARY_LAUNCH_CONFIG_NAME);
        assert_eq!(
            web.launch_configs[1].health_check.as_ref().and_then(|h| h.grace_period_secs),
            Some(30)
        );

        assert_eq!(inventory.instances[0].service_id, Some(10));
        assert_eq!(inventory.instances[0].instance.host_id, Some(1));
    }

    #[test]
    fn test_parse_error_carries_location() {
        let err = ConfigParser::new()
            .parse_yaml("services: [", Some(Path::new("corral.yaml")))
            .expect_err("should fail");
        match err {
            CorralError::Config(ConfigError::ParseError { location, .. }) => {
                assert_eq!(location.as_deref(), Some("corral.yaml"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([(ENV_ITEM_WAIT_RETRIES, "7"), (ENV_HEALTH_GRACE_SECS, " 5 ")]);
        let mut config = ManagerConfig::default();

        apply_env_overrides(&mut config, |name| vars.get(name).map(|v| (*v).to_string())).expect("overrides");

        assert_eq!(config.item_wait_retries, 7);
        assert_eq!(config.default_health_grace_secs, 5);
        assert_eq!(config.lock_wait_timeout_secs, 30);
    }

    #[test]
    fn test_invalid_env_override() {
        let mut config = ManagerConfig::default();
        let err = apply_env_overrides(&mut config, |name| {
            (name == ENV_LOCK_TIMEOUT_SECS).then(|| String::from("soon"))
        })
        .expect_err("should fail");
        assert!(matches!(err, CorralError::Config(ConfigError::InvalidEnvVar { .. })));
    }

    #[test]
    fn test_find_config_file_in_parent() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        std::fs::write(temp.path().join("corral.yml"), "hosts: []\n").expect("write");
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("mkdir");

        let found = find_config_file(&nested).expect("find");
        assert_eq!(found, temp.path().join("corral.yml"));
    }
}
