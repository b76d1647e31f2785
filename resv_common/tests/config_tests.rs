//! Config loading tests.
//!
//! Tests for loading an application config that embeds `SharedConfig` and
//! `ResvConfig`: defaults, unknown fields rejection, validation.

use resv_common::config::{ConfigError, ConfigLoader, LogLevel, ResvConfig, SharedConfig};
use serde::Deserialize;
use std::fs;
use tempfile::TempDir;

#[derive(Debug, Deserialize)]
struct AppConfig {
    shared: SharedConfig,
    #[serde(default)]
    reservation: ResvConfig,
}

fn write_config(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    fs::write(&path, body).unwrap();
    path
}

#[test]
fn missing_reservation_section_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[shared]
service_name = "resv-test"
"#,
    );

    let config = AppConfig::load(&path).unwrap();
    assert_eq!(config.shared.log_level, LogLevel::Info);
    assert_eq!(config.reservation, ResvConfig::default());
    assert!(config.shared.validate().is_ok());
    assert!(config.reservation.validate().is_ok());
}

#[test]
fn unknown_reservation_field_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[shared]
service_name = "resv-test"

[reservation]
branching = 32
"#,
    );

    assert!(matches!(
        AppConfig::load(&path),
        Err(ConfigError::ParseError(_))
    ));
}

#[test]
fn zero_retries_fail_validation() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[shared]
service_name = "resv-test"

[reservation]
max_read_retries = 0
"#,
    );

    let config = AppConfig::load(&path).unwrap();
    assert!(matches!(
        config.reservation.validate(),
        Err(ConfigError::ValidationError(_))
    ));
}
