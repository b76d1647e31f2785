//! Error types for the stress driver

use resv_common::config::ConfigError;
use resv_fence::WaitError;
use resv_object::ResvError;
use thiserror::Error;

/// Errors that end a stress run
#[derive(Error, Debug)]
pub enum StressError {
    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A reservation object operation failed
    #[error("Reservation error: {0}")]
    Resv(#[from] ResvError),

    /// The end-of-round wait did not complete
    #[error("Round wait failed: {0}")]
    Wait(#[from] WaitError),

    /// Enumeration disagreed with what the writer inserted
    #[error("Round {round}: enumerated {found} shared fences, expected {expected} in insertion order")]
    Mismatch {
        /// Round that failed
        round: u64,
        /// Fences inserted
        expected: usize,
        /// Fences enumerated
        found: usize,
    },

    /// Driver bookkeeping went wrong
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

/// Result type for stress runs
pub type StressResult<T> = Result<T, StressError>;
