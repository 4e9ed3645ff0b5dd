//! Configuration management
//!
//! Handles loading, validation, and merging of configuration from:
//! - TOML files
//! - CLI arguments

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub mod types;

pub use types::{
    EngineConfig, LoggingConfig, PermissionConfig, PermissionMode, ReconnectConfig, StoreConfig,
    TimerConfig,
};

use crate::session::ControllerOptions;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Tunnel engine configuration
    #[serde(default)]
    pub engine: EngineConfig,
    /// Session timer configuration
    #[serde(default)]
    pub timer: TimerConfig,
    /// Auto-reconnect configuration
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Persistent store configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Consent configuration
    #[serde(default)]
    pub permission: PermissionConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Create default configuration
    pub fn default_config() -> Result<Self> {
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.engine.binary.as_os_str().is_empty() {
            anyhow::bail!("Engine binary must not be empty");
        }

        if self.timer.check_interval_ms == 0 {
            anyhow::bail!("Timer check interval must be greater than zero");
        }

        if self.store.path.as_os_str().is_empty() {
            anyhow::bail!("Store path must not be empty");
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!("Invalid log level: {}", self.logging.level),
        }

        Ok(())
    }

    /// Override config with CLI arguments
    pub fn with_overrides(mut self, store: Option<PathBuf>, engine_binary: Option<PathBuf>) -> Self {
        if let Some(path) = store {
            self.store.path = path;
        }
        if let Some(binary) = engine_binary {
            self.engine.binary = binary;
        }
        self
    }

    /// Controller options derived from the timer and reconnect sections
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            check_interval: Duration::from_millis(self.timer.check_interval_ms),
            auto_reconnect: self.reconnect.enabled,
            reconnect_delay: Duration::from_millis(self.reconnect.delay_ms),
        }
    }
}
