//! Error types for reservation object operations

use resv_common::config::ConfigError;
use resv_fence::WaitError;
use thiserror::Error;

/// Errors that can occur while tracking fences
#[derive(Error, Debug, Clone)]
pub enum ResvError {
    /// Trie growth could not allocate a layer
    #[error("Out of memory allocating {bytes} bytes for a shared-fence layer")]
    OutOfMemory {
        /// Size of the failed allocation
        bytes: usize,
    },

    /// The validator found a broken trie invariant
    #[error("Shared-fence trie corrupted: {reason}")]
    StructuralCorruption {
        /// Violated invariant
        reason: String,
    },

    /// A wait ended without completion
    #[error("Wait failed: {source}")]
    Wait {
        /// Source wait outcome
        #[from]
        source: WaitError,
    },

    /// Rejected configuration
    #[error("Invalid reservation configuration: {source}")]
    Config {
        /// Validation failure
        #[from]
        source: ConfigError,
    },
}

impl ResvError {
    pub(crate) fn corruption(reason: impl Into<String>) -> Self {
        ResvError::StructuralCorruption {
            reason: reason.into(),
        }
    }
}

/// Result type for reservation object operations
pub type ResvResult<T> = Result<T, ResvError>;
