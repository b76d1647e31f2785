//! Stress run configuration.
//!
//! # TOML Example
//!
//! ```toml
//! [shared]
//! log_level = "info"
//! service_name = "resv-stress"
//!
//! [reservation]
//! max_read_retries = 64
//!
//! [run]
//! fences = 4096
//! order = "random"
//! readers = 4
//! rounds = 8
//! seed = 1
//! ```

use clap::ValueEnum;
use resv_common::config::{ConfigError, LogLevel, ResvConfig, SharedConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Order in which a round's fences are inserted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InsertOrder {
    /// Ascending sequence numbers
    Forward,
    /// Descending sequence numbers
    Backward,
    /// Seeded shuffle
    #[default]
    Random,
}

impl fmt::Display for InsertOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InsertOrder::Forward => "forward",
            InsertOrder::Backward => "backward",
            InsertOrder::Random => "random",
        };
        f.write_str(name)
    }
}

/// Shape of one stress run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Shared fences added per round
    #[serde(default = "default_fences")]
    pub fences: u64,

    /// Insertion order of each round
    #[serde(default)]
    pub order: InsertOrder,

    /// Lock-free reader threads running for the whole test
    #[serde(default = "default_readers")]
    pub readers: usize,

    /// Rounds; each starts with a new exclusive fence
    #[serde(default = "default_rounds")]
    pub rounds: u64,

    /// Seed for random orders
    #[serde(default)]
    pub seed: u64,

    /// Run the structural validator every this many inserts (0 = only at
    /// round end)
    #[serde(default = "default_validate_every")]
    pub validate_every: u64,

    /// Deadline for the end-of-round wait, in milliseconds
    #[serde(default = "default_wait_ms")]
    pub wait_ms: u64,
}

fn default_fences() -> u64 {
    4096
}

fn default_readers() -> usize {
    4
}

fn default_rounds() -> u64 {
    8
}

fn default_validate_every() -> u64 {
    1024
}

fn default_wait_ms() -> u64 {
    1000
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            fences: default_fences(),
            order: InsertOrder::default(),
            readers: default_readers(),
            rounds: default_rounds(),
            seed: 0,
            validate_every: default_validate_every(),
            wait_ms: default_wait_ms(),
        }
    }
}

impl RunConfig {
    /// End-of-round wait deadline
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

/// Complete stress driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StressConfig {
    /// Common application settings
    pub shared: SharedConfig,

    /// Reservation object tuning
    #[serde(default)]
    pub reservation: ResvConfig,

    /// Run shape
    #[serde(default)]
    pub run: RunConfig,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            shared: SharedConfig {
                log_level: LogLevel::Info,
                service_name: "resv-stress".to_string(),
            },
            reservation: ResvConfig::default(),
            run: RunConfig::default(),
        }
    }
}

impl StressConfig {
    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if any section is invalid, or
    /// if `run.rounds` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.reservation.validate()?;
        if self.run.rounds == 0 {
            return Err(ConfigError::ValidationError(
                "run.rounds cannot be zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resv_common::config::ConfigLoader;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = StressConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.run.order, InsertOrder::Random);
        assert_eq!(config.run.fences, 4096);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[shared]
service_name = "soak-a"

[run]
order = "backward"
fences = 300
"#
        )
        .unwrap();

        let config = StressConfig::load(file.path()).unwrap();
        assert_eq!(config.shared.service_name, "soak-a");
        assert_eq!(config.run.order, InsertOrder::Backward);
        assert_eq!(config.run.fences, 300);
        assert_eq!(config.run.readers, 4);
        assert_eq!(config.reservation, ResvConfig::default());
    }

    #[test]
    fn test_unknown_run_key_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[shared]\nservice_name = \"x\"\n\n[run]\nthreads = 3\n"
        )
        .unwrap();
        assert!(matches!(
            StressConfig::load(file.path()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_zero_rounds_rejected() {
        let mut config = StressConfig::default();
        config.run.rounds = 0;
        assert!(config.validate().is_err());
    }
}
