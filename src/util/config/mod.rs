//! tessera configuration system
//!
//! # Configuration hierarchy
//!
//! ```text
//! Priority (high → low):
//! 1. CLI arguments
//! 2. Environment variables (TESSERA_WORKERS, TESSERA_LIFO, TESSERA_LOG)
//! 3. Configuration file (tessera.toml)
//! 4. Default values
//! ```
//!
//! # Usage
//!
//! ```rust
//! use tessera::util::config::load_config;
//!
//! let mut config = load_config(None).unwrap();
//! config.apply_env().unwrap();
//! config.validate().unwrap();
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::runtime::device::{DeviceKind, MAX_DEVICES};
use crate::runtime::scheduler::SchedulerConfig;
use crate::util::logger::LogLevel;

pub const ENV_WORKERS: &str = "TESSERA_WORKERS";
pub const ENV_LIFO: &str = "TESSERA_LIFO";
pub const ENV_LOG: &str = "TESSERA_LOG";

/// Whole-runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Worker pool settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Task slab settings
    #[serde(default)]
    pub arena: ArenaConfig,
    /// Device table, in registration order
    #[serde(default = "default_devices")]
    pub devices: Vec<DeviceConfig>,
    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            arena: ArenaConfig::default(),
            devices: default_devices(),
            log: LogConfig::default(),
        }
    }
}

/// Node arena configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaConfig {
    /// Slots for tasks in flight, ghost sentinels included
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    64 * 1024
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

/// One entry of the device table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub kind: DeviceKind,
    /// Memory budget; required for accelerators, unbounded host when absent
    #[serde(default)]
    pub memory_bytes: Option<usize>,
}

fn default_devices() -> Vec<DeviceConfig> {
    vec![
        DeviceConfig {
            name: "host".to_string(),
            kind: DeviceKind::Cpu,
            memory_bytes: None,
        },
        DeviceConfig {
            name: "accel0".to_string(),
            kind: DeviceKind::Accelerator,
            memory_bytes: Some(64 * 1024 * 1024),
        },
    ]
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,
}

impl RuntimeConfig {
    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::ParseError)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeError)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides looked up through `lookup` (the environment, or a
    /// map in tests).
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let invalid = |var: &str, value: String| ConfigError::EnvError {
            var: var.to_string(),
            value,
        };

        if let Some(value) = lookup(ENV_WORKERS) {
            self.scheduler.num_workers = value
                .trim()
                .parse()
                .map_err(|_| invalid(ENV_WORKERS, value.clone()))?;
        }
        if let Some(value) = lookup(ENV_LIFO) {
            self.scheduler.lifo = value.parse().map_err(|_| invalid(ENV_LIFO, value.clone()))?;
        }
        if let Some(value) = lookup(ENV_LOG) {
            self.log.level = value.parse().map_err(|_| invalid(ENV_LOG, value.clone()))?;
        }
        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.num_workers == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.num_workers must be at least 1".to_string(),
            ));
        }
        // Each worker stack takes one ghost slot.
        if self.arena.capacity <= self.scheduler.num_workers {
            return Err(ConfigError::Invalid(format!(
                "arena.capacity ({}) must exceed scheduler.num_workers ({})",
                self.arena.capacity, self.scheduler.num_workers
            )));
        }
        if self.devices.is_empty() {
            return Err(ConfigError::Invalid("at least one device is required".to_string()));
        }
        if self.devices.len() > MAX_DEVICES {
            return Err(ConfigError::Invalid(format!(
                "at most {MAX_DEVICES} devices are supported"
            )));
        }
        let mut names = HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device name `{}`",
                    device.name
                )));
            }
            if device.kind == DeviceKind::Accelerator && device.memory_bytes.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "accelerator `{}` needs memory_bytes",
                    device.name
                )));
            }
        }
        Ok(())
    }
}

/// Load configuration from `path`, or defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> Result<RuntimeConfig, ConfigError> {
    let Some(path) = path else {
        return Ok(RuntimeConfig::default());
    };
    let content = fs::read_to_string(path).map_err(|source| ConfigError::IoError {
        path: path.to_path_buf(),
        source,
    })?;
    RuntimeConfig::from_toml(&content)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {}: {source}", path.display())]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Config parse error: {0}")]
    ParseError(toml::de::Error),
    #[error("Config serialize error: {0}")]
    SerializeError(toml::ser::Error),
    #[error("invalid value `{value}` for {var}")]
    EnvError { var: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
