//! Blocking waits on one or more fences
//!
//! A waiter registers a wake-up callback on every fence it sleeps on and
//! parks on a condition variable until a callback fires, the deadline
//! passes, or (for interruptible waits) its thread is interrupted.

use crate::error::{WaitError, WaitResult};
use crate::fence::{Fence, FenceRef};
use parking_lot::{Condvar, Mutex};
use resv_common::consts::MAX_WAIT_TIMEOUT;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitMode {
    /// Finish when any fence signals
    Any,
    /// Finish when every fence has signaled
    All,
}

#[derive(Default)]
struct Waiter {
    woken: Mutex<bool>,
    cond: Condvar,
}

impl Waiter {
    fn wake(&self) {
        *self.woken.lock() = true;
        self.cond.notify_all();
    }

    /// Park until woken or `deadline`. Returns false on timeout.
    fn sleep(&self, deadline: Option<Instant>) -> bool {
        let mut woken = self.woken.lock();
        if !*woken {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut woken, deadline).timed_out() && !*woken {
                        return false;
                    }
                }
                None => self.cond.wait(&mut woken),
            }
        }
        *woken = false;
        true
    }
}

struct InterruptState {
    pending: AtomicBool,
    waiter: Mutex<Option<Arc<Waiter>>>,
}

thread_local! {
    static CURRENT: Arc<InterruptState> = Arc::new(InterruptState {
        pending: AtomicBool::new(false),
        waiter: Mutex::new(None),
    });
}

/// Interrupt handle of one thread.
///
/// Raising it makes the thread's current or next interruptible wait return
/// [`WaitError::Interrupted`]. The pending interrupt is consumed by the wait
/// that reports it.
#[derive(Clone)]
pub struct Interrupt {
    state: Arc<InterruptState>,
}

impl Interrupt {
    /// Handle for the calling thread
    pub fn current() -> Self {
        Self {
            state: CURRENT.with(Arc::clone),
        }
    }

    /// Interrupt the thread, waking it if it is blocked in an
    /// interruptible wait
    pub fn raise(&self) {
        self.state.pending.store(true, Ordering::SeqCst);
        if let Some(waiter) = self.state.waiter.lock().as_ref() {
            waiter.wake();
        }
    }

    /// Whether an interrupt is waiting to be reported
    pub fn is_pending(&self) -> bool {
        self.state.pending.load(Ordering::SeqCst)
    }

    /// Drop a pending interrupt without reporting it
    pub fn clear(&self) {
        self.state.pending.store(false, Ordering::SeqCst);
    }

    fn take_pending(&self) -> bool {
        self.state.pending.swap(false, Ordering::SeqCst)
    }

    fn arm(&self, waiter: &Arc<Waiter>) -> Armed<'_> {
        *self.state.waiter.lock() = Some(waiter.clone());
        Armed { interrupt: self }
    }
}

/// Clears the waiter registration when the wait ends
struct Armed<'a> {
    interrupt: &'a Interrupt,
}

impl Drop for Armed<'_> {
    fn drop(&mut self) {
        *self.interrupt.state.waiter.lock() = None;
    }
}

fn remaining(deadline: Option<Instant>) -> Duration {
    match deadline {
        Some(deadline) => deadline.saturating_duration_since(Instant::now()),
        None => MAX_WAIT_TIMEOUT,
    }
}

fn done(fences: &[&Fence], mode: WaitMode) -> bool {
    match mode {
        WaitMode::Any => fences.iter().any(|f| f.is_signaled()),
        WaitMode::All => fences.iter().all(|f| f.is_signaled()),
    }
}

pub(crate) fn wait_fences(
    fences: &[&Fence],
    mode: WaitMode,
    interruptible: bool,
    timeout: Duration,
) -> WaitResult<Duration> {
    if done(fences, mode) {
        return Ok(timeout);
    }
    // Nothing can ever wake an empty `Any` wait.
    if timeout.is_zero() || fences.is_empty() {
        return Err(WaitError::TimedOut);
    }

    let deadline = Instant::now().checked_add(timeout);
    let waiter = Arc::new(Waiter::default());

    let mut registered = Vec::with_capacity(fences.len());
    for fence in fences {
        let wake = waiter.clone();
        // An already signaled fence is caught by the `done` check below.
        if let Ok(id) = fence.add_callback(move |_| wake.wake()) {
            registered.push((*fence, id));
        }
    }

    let interrupt = interruptible.then(Interrupt::current);
    let _armed = interrupt.as_ref().map(|i| i.arm(&waiter));

    let result = loop {
        if done(fences, mode) {
            break Ok(remaining(deadline));
        }
        if interrupt.as_ref().is_some_and(Interrupt::take_pending) {
            break Err(WaitError::Interrupted);
        }
        if !waiter.sleep(deadline) && !done(fences, mode) {
            break Err(WaitError::TimedOut);
        }
    };

    for (fence, id) in registered {
        fence.remove_callback(id);
    }

    trace!(count = fences.len(), ?mode, ?result, "fence wait finished");
    result
}

/// Sleep until any of `fences` signals or `timeout` elapses.
///
/// Returns the remaining timeout. An empty slice times out immediately.
pub fn wait_any_timeout(
    fences: &[FenceRef],
    interruptible: bool,
    timeout: Duration,
) -> WaitResult<Duration> {
    let fences: Vec<&Fence> = fences.iter().map(|f| f.as_ref()).collect();
    wait_fences(&fences, WaitMode::Any, interruptible, timeout)
}

/// Sleep until every one of `fences` has signaled or `timeout` elapses.
///
/// Returns the remaining timeout. An empty slice completes immediately.
pub fn wait_all_timeout(
    fences: &[FenceRef],
    interruptible: bool,
    timeout: Duration,
) -> WaitResult<Duration> {
    let fences: Vec<&Fence> = fences.iter().map(|f| f.as_ref()).collect();
    wait_fences(&fences, WaitMode::All, interruptible, timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_zero_timeout_polls() {
        let fence = Fence::new(1, 1);
        assert_eq!(
            fence.wait_timeout(false, Duration::ZERO),
            Err(WaitError::TimedOut)
        );
        fence.signal().unwrap();
        assert_eq!(fence.wait_timeout(false, Duration::ZERO), Ok(Duration::ZERO));
    }

    #[test]
    fn test_wait_times_out() {
        let fence = Fence::new(1, 1);
        let start = Instant::now();
        assert_eq!(
            fence.wait_timeout(false, Duration::from_millis(20)),
            Err(WaitError::TimedOut)
        );
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_wakes_on_signal() {
        let fence = Fence::new(1, 1);
        let signaller = {
            let fence = fence.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                fence.signal().unwrap();
            })
        };

        let left = fence.wait_timeout(false, Duration::from_secs(10)).unwrap();
        assert!(left < Duration::from_secs(10));
        assert!(fence.is_signaled());
        signaller.join().unwrap();
    }

    #[test]
    fn test_pending_interrupt_ends_interruptible_wait() {
        let fence = Fence::new(1, 1);
        let interrupt = Interrupt::current();
        interrupt.raise();
        assert!(interrupt.is_pending());

        assert_eq!(
            fence.wait_timeout(true, Duration::from_secs(10)),
            Err(WaitError::Interrupted)
        );
        // Consumed by the wait that reported it.
        assert!(!interrupt.is_pending());
    }

    #[test]
    fn test_uninterruptible_wait_ignores_interrupt() {
        let fence = Fence::new(1, 1);
        let interrupt = Interrupt::current();
        interrupt.raise();

        assert_eq!(
            fence.wait_timeout(false, Duration::from_millis(5)),
            Err(WaitError::TimedOut)
        );
        assert!(interrupt.is_pending());
        interrupt.clear();
    }

    #[test]
    fn test_interrupt_from_other_thread() {
        let fence = Fence::new(1, 1);
        let (tx, rx) = std::sync::mpsc::channel();

        let waiter = {
            let fence = fence.clone();
            thread::spawn(move || {
                tx.send(Interrupt::current()).unwrap();
                fence.wait_timeout(true, Duration::from_secs(30))
            })
        };

        let interrupt = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(10));
        interrupt.raise();
        assert_eq!(waiter.join().unwrap(), Err(WaitError::Interrupted));
    }

    #[test]
    fn test_wait_any_and_all() {
        let a = Fence::new(1, 1);
        let b = Fence::new(2, 1);
        let fences = vec![a.clone(), b.clone()];

        assert_eq!(
            wait_any_timeout(&fences, false, Duration::from_millis(1)),
            Err(WaitError::TimedOut)
        );

        b.signal().unwrap();
        assert!(wait_any_timeout(&fences, false, Duration::from_secs(1)).is_ok());
        assert_eq!(
            wait_all_timeout(&fences, false, Duration::from_millis(1)),
            Err(WaitError::TimedOut)
        );

        a.signal().unwrap();
        assert!(wait_all_timeout(&fences, false, Duration::from_secs(1)).is_ok());
        assert!(wait_all_timeout(&[], false, Duration::ZERO).is_ok());
        assert_eq!(
            wait_any_timeout(&[], false, Duration::ZERO),
            Err(WaitError::TimedOut)
        );
    }
}
