//! Configuration loading traits and types.
//!
//! This module provides a standardized way to load TOML configuration files
//! across all reservation workspace applications.
//!
//! # Usage
//!
//! ```rust,no_run
//! use resv_common::config::{ConfigLoader, ResvConfig, SharedConfig, ConfigError};
//! use serde::Deserialize;
//! use std::path::Path;
//!
//! #[derive(Debug, Deserialize)]
//! struct MyAppConfig {
//!     shared: SharedConfig,
//!     #[serde(default)]
//!     reservation: ResvConfig,
//! }
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = MyAppConfig::load(Path::new("config.toml"))?;
//!     println!("Service: {}", config.shared.service_name);
//!     Ok(())
//! }
//! ```

use crate::consts::{DEFAULT_READ_RETRIES, MAX_LAYERS_PER_INSERT};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, per-fence tracing information.
    Trace,
    /// Debug information such as trie growth and reclamation.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Common configuration fields shared across all applications.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "resv-stress-01"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tuning knobs of a reservation object.
///
/// # TOML Example
///
/// ```toml
/// [reservation]
/// layer_limit = 4096
/// max_read_retries = 64
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResvConfig {
    /// Upper bound on trie layers one object may hold (live plus spare).
    /// Allocations past it fail with out-of-memory. `None` means unbounded.
    #[serde(default)]
    pub layer_limit: Option<usize>,

    /// Optimistic read attempts before a lock-free reader yields the CPU
    /// between attempts.
    #[serde(default = "default_read_retries")]
    pub max_read_retries: u32,
}

fn default_read_retries() -> u32 {
    DEFAULT_READ_RETRIES
}

impl Default for ResvConfig {
    fn default() -> Self {
        Self {
            layer_limit: None,
            max_read_retries: DEFAULT_READ_RETRIES,
        }
    }
}

impl ResvConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `layer_limit` is too small to ever complete one insert
    /// - `max_read_retries` is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(limit) = self.layer_limit {
            if limit == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "layer_limit must be at least 1 (one insert may need up to {MAX_LAYERS_PER_INSERT})"
                )));
            }
        }
        if self.max_read_retries == 0 {
            return Err(ConfigError::ValidationError(
                "max_read_retries cannot be zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Any serde-deserializable struct can use ConfigLoader.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
