//! Error types for fence operations

use thiserror::Error;

/// Errors reported by fence state changes
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceError {
    /// The fence had already completed
    #[error("Fence {context}:{seqno} is already signaled")]
    AlreadySignaled {
        /// Fence context
        context: u64,
        /// Fence sequence number
        seqno: u64,
    },
}

/// Outcomes of a wait that did not observe completion
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The timeout elapsed before the fences signaled
    #[error("Wait timed out")]
    TimedOut,

    /// The waiting thread was interrupted
    #[error("Wait interrupted")]
    Interrupted,
}

/// Result type for fence state changes
pub type FenceResult<T> = Result<T, FenceError>;

/// Result type for waits; `Ok` carries the remaining timeout
pub type WaitResult<T> = Result<T, WaitError>;
