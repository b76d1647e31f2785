//! # Completion Fences
//!
//! Reference-counted, one-shot completion tokens used by reservation objects
//! to track outstanding asynchronous work.
//!
//! - [`Fence`] carries a context/sequence identity and a lock-free
//!   `is_signaled` predicate; [`FenceRef`] is its shared owner.
//! - [`Timeline`] hands out fences that complete when its counter passes
//!   their sequence number.
//! - [`wait_any_timeout`] / [`wait_all_timeout`] block on several fences;
//!   [`Interrupt`] ends interruptible waits early.
//!
//! ```rust
//! use resv_fence::{Timeline, WaitError};
//! use std::time::Duration;
//!
//! let timeline = Timeline::new("copy-engine");
//! let fence = timeline.create_fence(1);
//! assert_eq!(
//!     fence.wait_timeout(false, Duration::ZERO),
//!     Err(WaitError::TimedOut)
//! );
//!
//! timeline.signal(1);
//! assert!(fence.is_signaled());
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod fence;
pub mod timeline;
pub mod wait;

pub use error::{FenceError, FenceResult, WaitError, WaitResult};
pub use fence::{Callback, CallbackId, Fence, FenceRef, context_alloc};
pub use timeline::Timeline;
pub use wait::{Interrupt, wait_all_timeout, wait_any_timeout};
