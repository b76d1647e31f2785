//! Reservation Common Library
//!
//! Shared constants, configuration loading and logging setup used by every
//! crate of the reservation workspace.
//!
//! # Module Structure
//!
//! - [`consts`] - Trie geometry and wait defaults
//! - [`config`] - Configuration loading traits and types
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use resv_common::config::{ConfigLoader, ResvConfig, SharedConfig};
//! use resv_common::consts::SHARED_FANOUT;
//!
//! assert_eq!(SHARED_FANOUT, 16);
//! assert!(ResvConfig::default().validate().is_ok());
//! ```

pub mod config;
pub mod consts;
pub mod prelude;

use config::LogLevel;

/// Initialize a `tracing` subscriber for the given level.
///
/// `RUST_LOG` takes precedence over `level` when set. Calling this more than
/// once is harmless; only the first subscriber is installed.
pub fn init_tracing(level: LogLevel, json: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    let _ = if json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
}
