//! # Reservation Objects
//!
//! A reservation object tracks the completion fences guarding one shared
//! resource (typically a buffer touched by several asynchronous engines).
//! It holds at most one **exclusive** fence (a writer) and any number of
//! **shared** fences (readers that run after that writer).
//!
//! ## Architecture Overview
//!
//! ```text
//!              ┌──────────────────────── ReservationObject ───────────────────────┐
//!  writers ───►│ Mutex ─► TrieWriter (hint, spares)    RetireList (deferred frees)│
//!              │                                                                  │
//!              │ ExclusiveSlot: seq ─┬─ fence                                     │
//!              │                     └─ brackets every exclusive change           │
//!              │                                                                  │
//!  readers ───►│ SharedTrie root ─► [16 slots] ─► [16 slots] ─► fences            │
//!   (no lock)  │ GracePeriod (active-reader count)                                │
//!              └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - Writers serialise on the object's mutex ([`ReservationObject::lock`]).
//! - Readers never lock. Single reads of the exclusive fence and whole
//!   snapshots ([`ReservationObject::get_fences`]) are retried until the
//!   sequence counter shows no exclusive change happened meanwhile.
//! - Shared fences live in a 16-ary trie keyed by insertion order. It grows
//!   one level at a time and is emptied only when an exclusive fence is
//!   installed. Unlinked layers and fences are freed once every reader that
//!   could have seen them has left.
//!
//! ## Usage
//!
//! ```rust
//! use resv_fence::Timeline;
//! use resv_object::ReservationObject;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), resv_object::ResvError> {
//! let render = Timeline::new("render");
//! let resv = ReservationObject::new();
//!
//! {
//!     let mut guard = resv.lock();
//!     guard.reserve_shared()?;
//!     guard.add_shared_fence(render.create_fence(1));
//! }
//!
//! assert!(resv.test_signaled(false));
//! assert!(!resv.test_signaled(true));
//!
//! render.signal(1);
//! resv.wait_timeout(true, false, Duration::from_millis(10))?;
//! assert!(resv.test_signaled(true));
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! - **ReservationObject**: `Send + Sync`; share it behind an `Arc`
//! - **ReservationGuard**: one per object at a time, holds the writer lock
//! - **SharedFences**: holds a read section; keep it short-lived, since
//!   retired memory is not reclaimed while one is alive

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod reservation;
pub mod version;

mod excl;
mod grace;
mod iter;
mod layer;
mod trie;

pub use error::{ResvError, ResvResult};
pub use iter::SharedFences;
pub use reservation::{FenceSnapshot, ReservationGuard, ReservationObject};
pub use resv_fence::{Fence, FenceRef, Interrupt, WaitError, WaitResult};
pub use version::VersionCounter;

static_assertions::assert_impl_all!(ReservationObject: Send, Sync);
static_assertions::assert_impl_all!(FenceSnapshot: Send, Sync, Clone);
