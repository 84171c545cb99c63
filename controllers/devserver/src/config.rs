//! Operator configuration.
//!
//! Built once at startup from defaults, an optional YAML file and the
//! environment (in that order of precedence), then shared read-only.

use crate::error::ControllerError;
use crds::quantity::parse_quantity;
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info};

/// Env var naming the config file
pub const CONFIG_PATH_ENV: &str = "DEVSERVER_OPERATOR_CONFIG_PATH";

/// Config file used when `DEVSERVER_OPERATOR_CONFIG_PATH` is unset
pub const DEFAULT_CONFIG_PATH: &str = "/etc/devserver-operator/config.yaml";

/// Immutable operator settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorConfig {
    /// Home volume size when a DevServer enables persistence without a size
    pub default_persistent_home_size: String,
    /// Seconds between expiry sweeps
    pub expiration_interval: u64,
    /// Seconds between flavor schedulability sweeps
    pub flavor_reconciliation_interval: u64,
    /// Concurrent reconciliations
    pub worker_limit: usize,
    /// Publish Kubernetes Events
    pub posting_enabled: bool,
    /// Image used when neither the DevServer nor its flavor names one
    pub default_devserver_image: String,
    /// Image carrying sshd and the startup script
    pub static_dependencies_image: String,
    /// Restrict DevServer watches to one namespace
    pub watch_namespace: Option<String>,
    /// In-line retry budget for conflicts and transient errors
    pub max_retry_attempts: u32,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            default_persistent_home_size: "10Gi".to_string(),
            expiration_interval: 60,
            flavor_reconciliation_interval: 60,
            worker_limit: 1,
            posting_enabled: false,
            default_devserver_image: "seemethere/devserver-base:latest".to_string(),
            static_dependencies_image: "seemethere/devserver-static-dependencies:latest".to_string(),
            watch_namespace: None,
            max_retry_attempts: 5,
        }
    }
}

impl OperatorConfig {
    /// Load from the file at `DEVSERVER_OPERATOR_CONFIG_PATH` and the process environment.
    pub fn load() -> Result<Self, ControllerError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                info!("Loaded operator configuration from {}", path);
                Some(contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Operator config file not found at {}, using default values", path);
                None
            }
            Err(e) => {
                error!("Error loading operator configuration from {}: {}", path, e);
                None
            }
        };
        Self::from_sources(contents.as_deref(), |key| std::env::var(key).ok())
    }

    /// Build from optional file contents and an environment lookup.
    pub fn from_sources(
        file: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ControllerError> {
        let mut config = match file.map(str::trim) {
            None | Some("") => Self::default(),
            Some(contents) => serde_yaml::from_str(contents).unwrap_or_else(|e| {
                error!("Invalid operator configuration file, using defaults: {}", e);
                Self::default()
            }),
        };

        if let Some(v) = env("DEVSERVER_DEFAULT_PERSISTENT_HOME_SIZE") {
            config.default_persistent_home_size = v;
        }
        if let Some(v) = env("DEVSERVER_EXPIRATION_INTERVAL") {
            config.expiration_interval = parse_env("DEVSERVER_EXPIRATION_INTERVAL", &v)?;
        }
        if let Some(v) = env("DEVSERVER_FLAVOR_RECONCILIATION_INTERVAL") {
            config.flavor_reconciliation_interval =
                parse_env("DEVSERVER_FLAVOR_RECONCILIATION_INTERVAL", &v)?;
        }
        if let Some(v) = env("DEVSERVER_WORKER_LIMIT") {
            config.worker_limit = parse_env("DEVSERVER_WORKER_LIMIT", &v)?;
        }
        if let Some(v) = env("DEVSERVER_POSTING_ENABLED") {
            config.posting_enabled = parse_bool(&v);
        }
        if let Some(v) = env("DEVSERVER_DEFAULT_DEVSERVER_IMAGE") {
            config.default_devserver_image = v;
        }
        if let Some(v) = env("DEVSERVER_STATIC_DEPENDENCIES_IMAGE") {
            config.static_dependencies_image = v;
        }
        if let Some(v) = env("WATCH_NAMESPACE") {
            config.watch_namespace = Some(v).filter(|ns| !ns.is_empty());
        }
        if let Some(v) = env("DEVSERVER_MAX_RETRY_ATTEMPTS") {
            config.max_retry_attempts = parse_env("DEVSERVER_MAX_RETRY_ATTEMPTS", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ControllerError> {
        if self.worker_limit == 0 {
            return Err(ControllerError::InvalidConfig(
                "workerLimit must be at least 1".to_string(),
            ));
        }
        if self.expiration_interval == 0 || self.flavor_reconciliation_interval == 0 {
            return Err(ControllerError::InvalidConfig(
                "sweep intervals must be at least 1 second".to_string(),
            ));
        }
        parse_quantity(&self.default_persistent_home_size).map_err(|_| {
            ControllerError::InvalidConfig(format!(
                "defaultPersistentHomeSize '{}' is not a valid quantity",
                self.default_persistent_home_size
            ))
        })?;
        if self.default_devserver_image.trim().is_empty() {
            return Err(ControllerError::InvalidConfig(
                "defaultDevserverImage must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn expiration_interval(&self) -> Duration {
        Duration::from_secs(self.expiration_interval)
    }

    pub fn flavor_reconciliation_interval(&self) -> Duration {
        Duration::from_secs(self.flavor_reconciliation_interval)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ControllerError> {
    value.trim().parse().map_err(|_| {
        ControllerError::InvalidConfig(format!("{} has invalid value '{}'", key, value))
    })
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "t")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_sources() {
        let config = OperatorConfig::from_sources(None, env_of(&[])).unwrap();
        assert_eq!(config, OperatorConfig::default());
        assert_eq!(config.expiration_interval(), Duration::from_secs(60));
        assert_eq!(config.worker_limit, 1);
        assert!(!config.posting_enabled);
    }

    #[test]
    fn test_file_values_are_read() {
        let yaml = "expirationInterval: 30\nworkerLimit: 4\ndefaultDevserverImage: ubuntu:24.04\n";
        let config = OperatorConfig::from_sources(Some(yaml), env_of(&[])).unwrap();
        assert_eq!(config.expiration_interval, 30);
        assert_eq!(config.worker_limit, 4);
        assert_eq!(config.default_devserver_image, "ubuntu:24.04");
        assert_eq!(config.flavor_reconciliation_interval, 60);
    }

    #[test]
    fn test_env_overrides_file() {
        let yaml = "workerLimit: 4\npostingEnabled: false\n";
        let env = env_of(&[
            ("DEVSERVER_WORKER_LIMIT", "8"),
            ("DEVSERVER_POSTING_ENABLED", "T"),
            ("WATCH_NAMESPACE", "dev-alice"),
        ]);
        let config = OperatorConfig::from_sources(Some(yaml), env).unwrap();
        assert_eq!(config.worker_limit, 8);
        assert!(config.posting_enabled);
        assert_eq!(config.watch_namespace.as_deref(), Some("dev-alice"));
    }

    #[test]
    fn test_invalid_file_falls_back_to_defaults() {
        let config = OperatorConfig::from_sources(Some("workerLimit: [nope"), env_of(&[])).unwrap();
        assert_eq!(config, OperatorConfig::default());
    }

    #[test]
    fn test_unparsable_env_is_rejected() {
        let err = OperatorConfig::from_sources(None, env_of(&[("DEVSERVER_EXPIRATION_INTERVAL", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
    }

    #[test]
    fn test_zero_worker_limit_is_rejected() {
        let err = OperatorConfig::from_sources(None, env_of(&[("DEVSERVER_WORKER_LIMIT", "0")]))
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
    }
}
