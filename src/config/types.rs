//! Configuration type definitions

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::store::FileStore;

/// Tunnel engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// OpenVPN-compatible binary (looked up on PATH when relative)
    pub binary: PathBuf,

    /// Extra arguments appended to every engine invocation
    pub extra_args: Vec<String>,

    /// Directory for per-session config and credential files
    /// (None = system temp dir)
    pub runtime_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("openvpn"),
            extra_args: Vec::new(),
            runtime_dir: None,
        }
    }
}

fn default_check_interval_ms() -> u64 {
    1000
}

/// Session timer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Deadline check interval in milliseconds
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

fn default_reconnect_delay_ms() -> u64 {
    2000
}

/// Auto-reconnect configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Re-establish tunnels the engine dropped
    #[serde(default)]
    pub enabled: bool,

    /// Delay before a reconnect attempt in milliseconds
    #[serde(default = "default_reconnect_delay_ms")]
    pub delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_ms: default_reconnect_delay_ms(),
        }
    }
}

/// Persistent store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON state file
    #[serde(default = "FileStore::default_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: FileStore::default_path(),
        }
    }
}

/// How VPN consent is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    /// Ask the host once and remember the grant
    #[default]
    Prompt,
    /// Consent is implied
    Granted,
}

/// Permission configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionConfig {
    /// Consent mode ("prompt", "granted")
    #[serde(default)]
    pub mode: PermissionMode,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level ("trace", "debug", "info", "warn", "error")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily-rolling log files (None = console only)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: None,
        }
    }
}
