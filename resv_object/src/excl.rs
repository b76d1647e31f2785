//! Exclusive fence slot

use crate::grace::ReadSection;
use crate::layer::acquire_raw;
use crate::version::{ReadBackoff, VersionCounter};
use resv_fence::{Fence, FenceRef};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

/// One fence reference published under a sequence counter
#[derive(Debug, Default)]
pub(crate) struct ExclusiveSlot {
    fence: AtomicPtr<Fence>,
    seq: VersionCounter,
}

impl ExclusiveSlot {
    pub(crate) fn seq(&self) -> &VersionCounter {
        &self.seq
    }

    /// Acquire the current fence inside a read section, without retry
    pub(crate) fn load(&self, _section: &ReadSection<'_>) -> Option<FenceRef> {
        let fence = self.fence.load(Ordering::SeqCst);
        // SAFETY: a replaced fence is retired, not released, while the
        // caller's section is live.
        (!fence.is_null()).then(|| unsafe { acquire_raw(fence) })
    }

    /// Optimistic lock-free read: sample, acquire, re-sample, retry
    pub(crate) fn get(&self, section: &ReadSection<'_>, backoff: &mut ReadBackoff) -> Option<FenceRef> {
        loop {
            let start = self.seq.load();
            if VersionCounter::is_writing(start) {
                backoff.snooze();
                continue;
            }
            let fence = self.load(section);
            if !self.seq.changed_since(start) {
                return fence;
            }
            drop(fence);
            backoff.snooze();
        }
    }

    /// Direct read. Writer lock held, so the fence cannot be replaced.
    pub(crate) fn get_locked(&self) -> Option<FenceRef> {
        let fence = self.fence.load(Ordering::Relaxed);
        // SAFETY: only the lock holder replaces the slot.
        (!fence.is_null()).then(|| unsafe { acquire_raw(fence) })
    }

    /// Publish `fence` inside one write section, running `within` before
    /// the section closes. Writer lock held.
    ///
    /// Returns the previous fence, which the caller must retire rather than
    /// drop: readers may still be acquiring it.
    pub(crate) fn set(&self, fence: Option<FenceRef>, within: impl FnOnce()) -> Option<FenceRef> {
        let new = fence.map_or(ptr::null_mut(), |f| Arc::into_raw(f).cast_mut());
        self.seq.begin_write();
        let old = self.fence.swap(new, Ordering::SeqCst);
        within();
        self.seq.end_write();
        // SAFETY: the slot owned this reference; ownership moves to the caller.
        (!old.is_null()).then(|| unsafe { Arc::from_raw(old.cast_const()) })
    }
}

impl Drop for ExclusiveSlot {
    fn drop(&mut self) {
        let fence = std::mem::replace(self.fence.get_mut(), ptr::null_mut());
        if !fence.is_null() {
            // SAFETY: owned reference stored by `set`.
            drop(unsafe { Arc::from_raw(fence.cast_const()) });
        }
    }
}
