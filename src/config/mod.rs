//! Configuration management for TempoSteps
//!
//! Handles loading, validating and hot-reloading the YAML configuration file.

pub mod watcher;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

use crate::serial::SerialSettings;

pub use watcher::ConfigWatcher;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub serial: SerialConfig,
    pub catalog: CatalogConfig,
    pub dispatch: DispatchConfig,
    pub status: StatusConfig,
}

/// Sensor link configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub poll_interval_ms: u64,
    pub open_timeout_ms: u64,
    /// Connect to `port` at startup
    pub autoconnect: bool,
}

/// Track catalog location
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub path: String,
}

/// Decode pipeline tuning
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub queue_capacity: usize,
}

/// Status ticker configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StatusConfig {
    /// 0 disables the ticker
    pub interval_ms: u64,
    pub stale_after_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: 9600,
            poll_interval_ms: 20,
            open_timeout_ms: 5000,
            autoconnect: true,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: "./library.tsv".to_string(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: crate::dispatcher::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            stale_after_ms: 5000,
        }
    }
}

impl SerialConfig {
    pub fn settings(&self) -> SerialSettings {
        SerialSettings {
            baud_rate: self.baud_rate,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            open_timeout: Duration::from_millis(self.open_timeout_ms),
        }
    }
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::parse(&contents).with_context(|| format!("Invalid config file: {}", path))
    }

    /// Load configuration, falling back to defaults when the file is absent
    pub async fn load_or_default(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            warn!("Config file {} not found, using defaults", path);
            return Ok(Self::default());
        }
        Self::load(path).await
    }

    /// Parse and validate YAML text
    pub fn parse(contents: &str) -> Result<Self> {
        // An empty file is a valid "all defaults" config
        let config: AppConfig = if contents.trim().is_empty() {
            AppConfig::default()
        } else {
            serde_yaml::from_str(contents).context("Failed to parse YAML config")?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, path: &str) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config to YAML")?;

        fs::write(path, yaml)
            .await
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        if self.serial.port.trim().is_empty() {
            anyhow::bail!("serial.port cannot be empty");
        }
        if self.serial.baud_rate == 0 {
            anyhow::bail!("serial.baud_rate must be positive");
        }
        if self.serial.poll_interval_ms == 0 || self.serial.poll_interval_ms > 1000 {
            anyhow::bail!(
                "serial.poll_interval_ms is {} (must be 1-1000)",
                self.serial.poll_interval_ms
            );
        }
        if self.serial.open_timeout_ms == 0 {
            anyhow::bail!("serial.open_timeout_ms must be positive");
        }
        if self.catalog.path.trim().is_empty() {
            anyhow::bail!("catalog.path cannot be empty");
        }
        if self.dispatch.queue_capacity == 0 {
            anyhow::bail!("dispatch.queue_capacity must be positive");
        }
        Ok(())
    }
}

fn default_port() -> String {
    "COM1".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.serial.port, "COM1");
        assert_eq!(config.serial.settings(), SerialSettings::default());
        assert_eq!(config.catalog.path, "./library.tsv");
    }

    #[test]
    fn test_partial_override() {
        let config = AppConfig::parse(
            r#"
serial:
  port: "/dev/ttyACM0"
  poll_interval_ms: 10
catalog:
  path: "music/library.tsv"
"#,
        )
        .unwrap();

        assert_eq!(config.serial.port, "/dev/ttyACM0");
        assert_eq!(config.serial.poll_interval_ms, 10);
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.catalog.path, "music/library.tsv");
        assert_eq!(config.status.interval_ms, 1000);
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = AppConfig::parse(include_str!("../../config.example.yaml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(AppConfig::parse("serial:\n  port: \"\"\n").is_err());
        assert!(AppConfig::parse("serial:\n  poll_interval_ms: 0\n").is_err());
        assert!(AppConfig::parse("serial:\n  baud_rate: 0\n").is_err());
        assert!(AppConfig::parse("dispatch:\n  queue_capacity: 0\n").is_err());
        assert!(AppConfig::parse("serial: [1, 2]\n").is_err());
    }

    #[tokio::test]
    async fn test_save_and_load() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("config.yaml");
        let path = path.to_string_lossy().to_string();

        let mut config = AppConfig::default();
        config.serial.port = "COM7".to_string();
        config.save(&path).await?;

        let loaded = AppConfig::load(&path).await?;
        assert_eq!(loaded, config);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_file_uses_defaults() -> Result<()> {
        let config = AppConfig::load_or_default("/no/such/tempo-steps.yaml").await?;
        assert_eq!(config, AppConfig::default());
        Ok(())
    }
}
