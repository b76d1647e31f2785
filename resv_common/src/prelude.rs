//! Prelude module for common re-exports.
//!
//! ```rust
//! use resv_common::prelude::*;
//! ```

// ─── Logging ────────────────────────────────────────────────────────
pub use crate::config::LogLevel;
pub use crate::init_tracing;

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, ResvConfig, SharedConfig};

// ─── Trie Geometry ──────────────────────────────────────────────────
pub use crate::consts::{MAX_LEVELS, MAX_WAIT_TIMEOUT, SHARED_BITS, SHARED_FANOUT};
