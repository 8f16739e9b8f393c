//! Application configuration.
//!
//! Aggregates the queue, retry and monitor defaults plus the device list
//! into a single Config struct loaded from YAML files and environment
//! variables.

mod devices;

pub use devices::{ConnectionConfig, DeviceConfig};

use std::collections::HashSet;

use serde::Deserialize;

use crate::executor::RetryConfig;
use crate::monitor::MonitorConfig;
use crate::queue::QueueConfig;
use crate::runner::DeviceSettings;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "onair.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "ONAIR_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "ONAIR";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "ONAIR_LOG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Duplicate device id '{0}'")]
    DuplicateDevice(String),

    #[error("Device '{id}': {reason}")]
    InvalidDevice { id: String, reason: String },
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Queue timing shared by every device.
    pub queue: QueueConfig,
    /// Command retry policy shared by every device.
    pub retry: RetryConfig,
    /// Connection probing shared by every device.
    pub monitor: MonitorConfig,
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `onair.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.id.is_empty() {
                return Err(ConfigError::InvalidDevice {
                    id: device.id.clone(),
                    reason: "empty id".to_string(),
                });
            }
            if !seen.insert(device.id.as_str()) {
                return Err(ConfigError::DuplicateDevice(device.id.clone()));
            }
        }
        Ok(())
    }

    /// Runner settings for one device: shared sections plus its own options.
    pub fn device_settings(&self, device: &DeviceConfig) -> DeviceSettings {
        DeviceSettings {
            queue: self.queue.clone(),
            retry: device.retry.clone().unwrap_or_else(|| self.retry.clone()),
            monitor: self.monitor.clone(),
            resend_interval_ms: device.resend_interval_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn write_yaml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.queue.tick_interval_ms, 10);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.monitor.probe_interval_ms, 10_000);
        assert!(config.devices.is_empty());
    }

    #[test]
    #[serial]
    fn test_load_from_path() {
        let file = write_yaml(
            r#"
retry:
  max_attempts: 3
monitor:
  probe_interval_ms: 500
devices:
  - id: deck1
    kind: hyperdeck
  - id: web
    kind: http_send
    resend_interval_ms: 60000
    connection:
      type: http
      probe_url: http://localhost:9000/health
"#,
        );

        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff_ms, 300);
        assert_eq!(config.monitor.probe_interval_ms, 500);
        assert_eq!(config.devices.len(), 2);
        assert!(matches!(config.devices[0].connection, ConnectionConfig::Simulated));
        assert!(matches!(config.devices[1].connection, ConnectionConfig::Http(_)));

        let settings = config.device_settings(&config.devices[1]);
        assert_eq!(settings.resend_interval_ms, Some(60_000));
        assert_eq!(settings.retry.max_attempts, 3);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_yaml("queue:\n  late_threshold_ms: 250\n");
        std::env::set_var("ONAIR__QUEUE__LATE_THRESHOLD_MS", "40");

        let result = Config::load(file.path().to_str());
        std::env::remove_var("ONAIR__QUEUE__LATE_THRESHOLD_MS");

        assert_eq!(result.unwrap().queue.late_threshold_ms, 40);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_fails() {
        assert!(Config::load(Some("/nonexistent/onair.yaml")).is_err());
    }

    #[test]
    #[serial]
    fn test_duplicate_device_rejected() {
        let file = write_yaml(
            "devices:\n  - id: deck1\n    kind: hyperdeck\n  - id: deck1\n    kind: mixer\n",
        );
        assert!(matches!(
            Config::load(file.path().to_str()),
            Err(ConfigError::DuplicateDevice(id)) if id == "deck1"
        ));
    }
}
