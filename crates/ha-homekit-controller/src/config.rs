//! HomeKit controller configuration
//!
//! Parses the `homekit_controller:` section of configuration.yaml. Every
//! field has a default, so an absent section yields the stock timings.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Section name in configuration.yaml
pub const CONFIG_SECTION: &str = "homekit_controller";

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors that can occur while loading controller configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the file
    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML
    #[error("failed to parse YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Timings and thresholds for every accessory connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeKitControllerConfig {
    /// Seconds between polls of pollable characteristics
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Ceiling in seconds for the structure-fetch retry backoff
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,

    /// First retry delay in seconds; doubles per failed attempt
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay: u64,

    /// Milliseconds to coalesce entity map writes before flushing
    #[serde(default = "default_entity_map_save_delay")]
    pub entity_map_save_delay: u64,

    /// Milliseconds to batch new event subscriptions
    #[serde(default = "default_subscribe_cooldown")]
    pub subscribe_cooldown: u64,

    /// Consecutive poll failures before the connection is unavailable
    #[serde(default = "default_poll_failures_before_unavailable")]
    pub poll_failures_before_unavailable: u32,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_retry_interval() -> u64 {
    60
}

fn default_retry_base_delay() -> u64 {
    5
}

fn default_entity_map_save_delay() -> u64 {
    10_000
}

fn default_subscribe_cooldown() -> u64 {
    250
}

fn default_poll_failures_before_unavailable() -> u32 {
    1
}

impl Default for HomeKitControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            retry_interval: default_retry_interval(),
            retry_base_delay: default_retry_base_delay(),
            entity_map_save_delay: default_entity_map_save_delay(),
            subscribe_cooldown: default_subscribe_cooldown(),
            poll_failures_before_unavailable: default_poll_failures_before_unavailable(),
        }
    }
}

impl HomeKitControllerConfig {
    /// Load from `configuration.yaml` in a config directory
    pub fn load(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = config_dir.as_ref().join("configuration.yaml");
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let yaml: Value = serde_yaml::from_str(content)?;
        Self::from_yaml(&yaml)
    }

    /// Parse from a YAML document, reading the `homekit_controller` section
    pub fn from_yaml(yaml: &Value) -> ConfigResult<Self> {
        let section = match yaml {
            Value::Null => Value::Mapping(serde_yaml::Mapping::new()),
            Value::Mapping(mapping) => mapping
                .get(Value::String(CONFIG_SECTION.to_string()))
                .cloned()
                .filter(|v| !v.is_null())
                .unwrap_or(Value::Mapping(serde_yaml::Mapping::new())),
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: "root".to_string(),
                    reason: "configuration must be a mapping".to_string(),
                })
            }
        };

        let config: HomeKitControllerConfig =
            serde_yaml::from_value(section).map_err(|e| ConfigError::InvalidValue {
                key: CONFIG_SECTION.to_string(),
                reason: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let positive = [
            ("poll_interval", self.poll_interval),
            ("retry_interval", self.retry_interval),
            ("retry_base_delay", self.retry_base_delay),
            (
                "poll_failures_before_unavailable",
                self.poll_failures_before_unavailable as u64,
            ),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_base_delay)
    }

    pub fn entity_map_save_delay(&self) -> Duration {
        Duration::from_millis(self.entity_map_save_delay)
    }

    pub fn subscribe_cooldown(&self) -> Duration {
        Duration::from_millis(self.subscribe_cooldown)
    }
}
