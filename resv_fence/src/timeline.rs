//! Software timelines
//!
//! A timeline is a monotonically advancing counter with its own fence
//! context. Fences created on it complete once the counter reaches their
//! sequence number.

use crate::fence::{Fence, FenceRef, context_alloc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Counter-driven source of fences
pub struct Timeline {
    context: u64,
    name: String,
    value: AtomicU64,
    active: Mutex<Vec<FenceRef>>,
}

impl Timeline {
    /// Create a timeline with a freshly allocated context
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            context: context_alloc(1),
            name: name.into(),
            value: AtomicU64::new(0),
            active: Mutex::new(Vec::new()),
        }
    }

    /// Fence context of every fence created here
    pub fn context(&self) -> u64 {
        self.context
    }

    /// Timeline name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current counter value
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Number of created fences that have not signaled yet
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Create a fence that signals once the counter reaches `seqno`.
    ///
    /// A `seqno` the counter has already passed yields a signaled fence.
    pub fn create_fence(&self, seqno: u64) -> FenceRef {
        let fence = Fence::new(self.context, seqno);
        let mut active = self.active.lock();
        if seqno <= self.value() {
            drop(active);
            let _ = fence.signal();
        } else {
            active.push(fence.clone());
        }
        fence
    }

    /// Advance the counter by `inc` and signal every fence it reached.
    pub fn signal(&self, inc: u64) {
        let ready: Vec<FenceRef> = {
            let mut active = self.active.lock();
            let value = self.value.fetch_add(inc, Ordering::AcqRel) + inc;
            let (ready, pending): (Vec<FenceRef>, Vec<FenceRef>) =
                active.drain(..).partition(|f| f.seqno() <= value);
            *active = pending;
            ready
        };

        debug!(
            timeline = %self.name,
            value = self.value(),
            signaled = ready.len(),
            "timeline advanced"
        );

        for fence in ready {
            let _ = fence.signal();
        }
    }
}

impl Drop for Timeline {
    /// Outstanding fences are signaled so nobody waits on a dead timeline.
    fn drop(&mut self) {
        for fence in self.active.get_mut().drain(..) {
            let _ = fence.signal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fences_signal_in_order() {
        let timeline = Timeline::new("ring0");
        let f1 = timeline.create_fence(1);
        let f3 = timeline.create_fence(3);
        assert_eq!(f1.context(), timeline.context());
        assert_eq!(timeline.active_count(), 2);

        timeline.signal(1);
        assert!(f1.is_signaled());
        assert!(!f3.is_signaled());
        assert_eq!(timeline.active_count(), 1);

        timeline.signal(2);
        assert!(f3.is_signaled());
        assert_eq!(timeline.value(), 3);
        assert_eq!(timeline.active_count(), 0);
    }

    #[test]
    fn test_past_seqno_is_signaled() {
        let timeline = Timeline::new("ring1");
        timeline.signal(5);
        assert!(timeline.create_fence(4).is_signaled());
        assert!(timeline.create_fence(5).is_signaled());
        assert!(!timeline.create_fence(6).is_signaled());
    }

    #[test]
    fn test_drop_signals_outstanding() {
        let fence = {
            let timeline = Timeline::new("doomed");
            timeline.create_fence(100)
        };
        assert!(fence.is_signaled());
    }

    #[test]
    fn test_distinct_contexts() {
        let a = Timeline::new("a");
        let b = Timeline::new("b");
        assert_ne!(a.context(), b.context());
        assert_eq!(a.name(), "a");
    }
}
