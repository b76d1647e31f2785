//! Completion fences

use crate::error::{FenceError, FenceResult, WaitResult};
use crate::wait;
use parking_lot::Mutex;
use resv_common::consts::MAX_WAIT_TIMEOUT;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

static CONTEXT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Allocate `num` consecutive fence contexts and return the first one.
///
/// Each execution context (a ring, an engine, a software timeline) owns its
/// own context so fences can be compared for ordering only within it.
///
/// # Panics
///
/// Panics if `num` is zero.
pub fn context_alloc(num: u64) -> u64 {
    assert!(num > 0, "cannot allocate zero fence contexts");
    CONTEXT_COUNTER.fetch_add(num, Ordering::Relaxed)
}

/// Shared owning handle to a fence.
///
/// Cloning acquires a reference, dropping releases it.
pub type FenceRef = Arc<Fence>;

/// Completion callback, run once when the fence signals
pub type Callback = Box<dyn FnOnce(&Fence) + Send>;

/// Handle returned by [`Fence::add_callback`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

struct Pending {
    callbacks: Vec<(CallbackId, Callback)>,
    next_id: u64,
    timestamp: Option<Instant>,
}

/// One-shot asynchronous completion token
pub struct Fence {
    context: u64,
    seqno: u64,
    signaled: AtomicBool,
    pending: Mutex<Pending>,
}

impl Fence {
    /// Create an unsignaled fence
    pub fn new(context: u64, seqno: u64) -> FenceRef {
        Arc::new(Self {
            context,
            seqno,
            signaled: AtomicBool::new(false),
            pending: Mutex::new(Pending {
                callbacks: Vec::new(),
                next_id: 0,
                timestamp: None,
            }),
        })
    }

    /// Create a fence that is already complete
    pub fn signaled(context: u64, seqno: u64) -> FenceRef {
        let fence = Self::new(context, seqno);
        let _ = fence.signal();
        fence
    }

    /// Execution context this fence belongs to
    pub fn context(&self) -> u64 {
        self.context
    }

    /// Sequence number within the context
    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    /// Whether the fence has completed. Lock-free.
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Time at which the fence signaled
    pub fn timestamp(&self) -> Option<Instant> {
        self.pending.lock().timestamp
    }

    /// True if `self` comes after `other` on the same context.
    ///
    /// Fences of different contexts are unordered and never compare later.
    pub fn is_later(&self, other: &Fence) -> bool {
        self.context == other.context && self.seqno > other.seqno
    }

    /// Signal completion and run every registered callback.
    ///
    /// A fence only moves from unsignaled to signaled once; later calls
    /// return [`FenceError::AlreadySignaled`].
    pub fn signal(&self) -> FenceResult<()> {
        let callbacks = {
            let mut pending = self.pending.lock();
            if self.signaled.swap(true, Ordering::AcqRel) {
                return Err(FenceError::AlreadySignaled {
                    context: self.context,
                    seqno: self.seqno,
                });
            }
            pending.timestamp = Some(Instant::now());
            std::mem::take(&mut pending.callbacks)
        };

        trace!(context = self.context, seqno = self.seqno, "fence signaled");

        // Callbacks may touch the fence again, so they run unlocked.
        for (_, callback) in callbacks {
            callback(self);
        }
        Ok(())
    }

    /// Register `callback` to run when the fence signals.
    ///
    /// Returns [`FenceError::AlreadySignaled`] without running the callback
    /// if the fence has already completed.
    pub fn add_callback<F>(&self, callback: F) -> FenceResult<CallbackId>
    where
        F: FnOnce(&Fence) + Send + 'static,
    {
        let mut pending = self.pending.lock();
        if self.is_signaled() {
            return Err(FenceError::AlreadySignaled {
                context: self.context,
                seqno: self.seqno,
            });
        }
        let id = CallbackId(pending.next_id);
        pending.next_id += 1;
        pending.callbacks.push((id, Box::new(callback)));
        Ok(id)
    }

    /// Remove a callback that has not run yet.
    ///
    /// Returns false if it already ran or was removed.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut pending = self.pending.lock();
        match pending.callbacks.iter().position(|(cb, _)| *cb == id) {
            Some(index) => {
                let (_, callback) = pending.callbacks.swap_remove(index);
                drop(pending);
                drop(callback);
                true
            }
            None => false,
        }
    }

    /// Sleep until the fence signals or `timeout` elapses.
    ///
    /// Returns the remaining timeout on success. A zero timeout only polls.
    /// With `interruptible`, raising the calling thread's
    /// [`Interrupt`](crate::Interrupt) ends the wait early.
    pub fn wait_timeout(&self, interruptible: bool, timeout: Duration) -> WaitResult<Duration> {
        wait::wait_fences(&[self], wait::WaitMode::Any, interruptible, timeout)
    }

    /// Sleep until the fence signals.
    pub fn wait(&self, interruptible: bool) -> WaitResult<()> {
        self.wait_timeout(interruptible, MAX_WAIT_TIMEOUT).map(|_| ())
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("context", &self.context)
            .field("seqno", &self.seqno)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_context_alloc_is_consecutive() {
        let first = context_alloc(3);
        let next = context_alloc(1);
        assert!(next >= first + 3);
    }

    #[test]
    fn test_signal_is_one_shot() {
        let fence = Fence::new(7, 1);
        assert!(!fence.is_signaled());
        assert!(fence.timestamp().is_none());

        fence.signal().unwrap();
        assert!(fence.is_signaled());
        assert!(fence.timestamp().is_some());
        assert_eq!(
            fence.signal(),
            Err(FenceError::AlreadySignaled {
                context: 7,
                seqno: 1
            })
        );
    }

    #[test]
    fn test_callbacks_run_once() {
        let fence = Fence::new(1, 1);
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = hits.clone();
            fence
                .add_callback(move |f| {
                    assert!(f.is_signaled());
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        fence.signal().unwrap();
        let _ = fence.signal();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_add_callback_after_signal_fails() {
        let fence = Fence::signaled(1, 1);
        assert!(fence.add_callback(|_| {}).is_err());
    }

    #[test]
    fn test_removed_callback_does_not_run() {
        let fence = Fence::new(1, 1);
        let hits = Arc::new(AtomicUsize::new(0));
        let id = {
            let hits = hits.clone();
            fence
                .add_callback(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
        };

        assert!(fence.remove_callback(id));
        assert!(!fence.remove_callback(id));
        fence.signal().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_removed_callback_releases_captures() {
        let fence = Fence::new(1, 1);
        let captured = Arc::new(AtomicUsize::new(0));
        let id = {
            let captured = captured.clone();
            fence
                .add_callback(move |_| {
                    captured.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
        };
        assert_eq!(Arc::strong_count(&captured), 2);

        assert!(fence.remove_callback(id));
        assert_eq!(Arc::strong_count(&captured), 1);
        fence.signal().unwrap();
        assert_eq!(captured.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_is_later_only_within_context() {
        let a = Fence::new(1, 5);
        let b = Fence::new(1, 6);
        let c = Fence::new(2, 9);
        assert!(b.is_later(&a));
        assert!(!a.is_later(&b));
        assert!(!c.is_later(&a));
    }
}
