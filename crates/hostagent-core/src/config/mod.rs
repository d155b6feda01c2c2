//! Configuration management with file persistence

use crate::domain::resource::{ResourceConfig, parse_timeout};
use crate::error::{Error, Result};
use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

/// Host agent configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default `tracing` filter directive, overridden by `RUST_LOG`
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "hostagent_core=info".to_string(),
        }
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("HOSTAGENT_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("hostagent")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or return defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config = Self::from_toml(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.resources.validate()?;
        if self.logging.filter.trim().is_empty() {
            return Err(Error::ConfigError("logging.filter must not be empty".to_string()));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> Result<String> {
        match key {
            "resources.default_timeout_secs" => Ok(self
                .resources
                .default_timeout_secs
                .map(|secs| secs.to_string())
                .unwrap_or_else(|| "none".to_string())),
            "resources.log_auto_release" => Ok(self.resources.log_auto_release.to_string()),
            "logging.filter" => Ok(self.logging.filter.clone()),
            _ => Err(Error::ConfigError(format!(
                "Unknown configuration key: {}. Use `hostagent config show` to see available keys.",
                key
            ))),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "resources.default_timeout_secs" => {
                self.resources.default_timeout_secs = match value {
                    "none" | "" => None,
                    _ => Some(parse_timeout(value)?.as_secs_f64()),
                };
            }
            "resources.log_auto_release" => {
                self.resources.log_auto_release = value.parse().map_err(|_| {
                    Error::ConfigError(format!("Invalid log_auto_release value: {}", value))
                })?;
            }
            "logging.filter" => {
                if value.trim().is_empty() {
                    return Err(Error::ConfigError("logging.filter must not be empty".to_string()));
                }
                self.logging.filter = value.to_string();
            }
            _ => {
                return Err(Error::ConfigError(format!(
                    "Unknown configuration key: {}. Use `hostagent config show` to see available keys.",
                    key
                )));
            }
        }
        Ok(())
    }

    /// All keys accepted by `get` and `set`
    pub fn keys() -> &'static [&'static str] {
        &[
            "resources.default_timeout_secs",
            "resources.log_auto_release",
            "logging.filter",
        ]
    }
}
