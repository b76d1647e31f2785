//! Grace periods for lock-free readers
//!
//! The object keeps an epoch counter that only the writer advances. A reader
//! samples the epoch on entry and announces itself in the reader bucket of
//! that epoch's parity for as long as it may dereference trie layers or the
//! exclusive fence. Writers unlink objects first and park them on a
//! [`RetireList`] tagged with the epoch current at the unlink.
//!
//! The epoch moves from `e` to `e + 1` only when the bucket of `e + 1`'s
//! parity is empty, so live readers always belong to the current epoch or
//! the one before it. An object retired at epoch `t` is released once the
//! epoch has reached `t + 2`: the step to `t + 1` drained every reader that
//! entered before `t` and the step to `t + 2` drained every reader of `t`.
//! Readers that enter later sit in newer buckets and never hold it back.
//!
//! Both sides pair a `SeqCst` store with a `SeqCst` load: the writer
//! publishes the unlink then samples the buckets, the reader joins its
//! bucket then loads the pointer. Either the writer sees the reader, or
//! the reader sees the unlinked state.

use crate::layer::Layer;
use resv_fence::FenceRef;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, trace};

/// Epoch and per-parity reader counts of one reservation object
#[derive(Debug, Default)]
pub(crate) struct GracePeriod {
    epoch: AtomicU64,
    readers: [AtomicUsize; 2],
}

fn bucket(epoch: u64) -> usize {
    (epoch & 1) as usize
}

impl GracePeriod {
    pub(crate) fn enter(&self) -> ReadSection<'_> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.readers[bucket(epoch)].fetch_add(1, Ordering::SeqCst);
        ReadSection { grace: self, epoch }
    }

    /// True if no reader is inside a read section right now
    #[cfg(test)]
    pub(crate) fn is_quiescent(&self) -> bool {
        self.active_readers() == 0
    }

    pub(crate) fn active_readers(&self) -> usize {
        self.readers
            .iter()
            .map(|readers| readers.load(Ordering::SeqCst))
            .sum()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Move to the next epoch if no reader of the previous one is left.
    ///
    /// Writer lock held. Returns the epoch now current.
    fn try_advance(&self) -> u64 {
        let epoch = self.epoch.load(Ordering::SeqCst);
        if self.readers[bucket(epoch + 1)].load(Ordering::SeqCst) != 0 {
            return epoch;
        }
        self.epoch.store(epoch + 1, Ordering::SeqCst);
        trace!(epoch = epoch + 1, "epoch advanced");
        epoch + 1
    }
}

/// Read-side critical section; retired objects outlive every live section
#[derive(Debug)]
pub(crate) struct ReadSection<'a> {
    grace: &'a GracePeriod,
    epoch: u64,
}

impl Drop for ReadSection<'_> {
    fn drop(&mut self) {
        self.grace.readers[bucket(self.epoch)].fetch_sub(1, Ordering::SeqCst);
    }
}

enum Retired {
    /// Unlinked trie, freed postorder with its fences
    Tree(NonNull<Layer>),
    /// Replaced exclusive fence
    Fence(FenceRef),
}

impl Retired {
    fn release(self) {
        match self {
            // SAFETY: the tree was unlinked before it was retired and no
            // reader that saw it is still active.
            Retired::Tree(root) => unsafe { Layer::free_tree(root) },
            Retired::Fence(fence) => drop(fence),
        }
    }
}

/// Objects unlinked by the writer and awaiting the end of a grace period.
///
/// New entries are tagged with the epoch on the next [`reclaim`]. The epoch
/// only moves inside `reclaim`, so the tag is the epoch of the unlink.
/// Tagged entries are kept in retire order and their epochs never decrease.
/// Only touched with the writer lock held.
///
/// [`reclaim`]: RetireList::reclaim
#[derive(Default)]
pub(crate) struct RetireList {
    untagged: Vec<Retired>,
    retired: Vec<(u64, Retired)>,
}

// SAFETY: retired trees are owned exclusively by the list once unlinked.
unsafe impl Send for RetireList {}

impl RetireList {
    pub(crate) fn retire_tree(&mut self, root: NonNull<Layer>) {
        self.untagged.push(Retired::Tree(root));
    }

    pub(crate) fn retire_fence(&mut self, fence: FenceRef) {
        self.untagged.push(Retired::Fence(fence));
    }

    pub(crate) fn len(&self) -> usize {
        self.untagged.len() + self.retired.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.untagged.is_empty() && self.retired.is_empty()
    }

    /// Free every object whose grace period has ended. Returns the number
    /// of objects released.
    pub(crate) fn reclaim(&mut self, grace: &GracePeriod) -> usize {
        let current = grace.epoch();
        self.retired
            .extend(self.untagged.drain(..).map(|retired| (current, retired)));
        let Some(&(newest, _)) = self.retired.last() else {
            return 0;
        };
        // Two steps are enough to release everything retired so far.
        let mut epoch = current;
        while epoch < newest + 2 {
            let next = grace.try_advance();
            if next == epoch {
                break;
            }
            epoch = next;
        }

        let expired = self
            .retired
            .partition_point(|&(retired_at, _)| retired_at + 2 <= epoch);
        for (_, retired) in self.retired.drain(..expired) {
            retired.release();
        }
        if expired > 0 {
            debug!(released = expired, epoch, pending = self.retired.len(), "grace period ended");
        }
        expired
    }

    /// Free everything unconditionally.
    ///
    /// Callers guarantee no reader exists, e.g. while the object is being
    /// destroyed.
    pub(crate) fn release_all(&mut self) -> usize {
        let count = self.len();
        for retired in self.untagged.drain(..) {
            retired.release();
        }
        for (_, retired) in self.retired.drain(..) {
            retired.release();
        }
        if count > 0 {
            debug!(released = count, "retire list drained");
        }
        count
    }
}

impl Drop for RetireList {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resv_fence::Fence;
    use std::sync::Arc;

    #[test]
    fn test_sections_nest() {
        let grace = GracePeriod::default();
        assert!(grace.is_quiescent());
        {
            let _outer = grace.enter();
            let _inner = grace.enter();
            assert_eq!(grace.active_readers(), 2);
        }
        assert!(grace.is_quiescent());
    }

    #[test]
    fn test_reclaim_waits_for_readers() {
        let grace = GracePeriod::default();
        let mut list = RetireList::default();
        let fence = Fence::new(1, 1);

        let section = grace.enter();
        list.retire_fence(fence.clone());
        assert_eq!(list.reclaim(&grace), 0);
        assert_eq!(Arc::strong_count(&fence), 2);

        drop(section);
        assert_eq!(list.reclaim(&grace), 1);
        assert_eq!(list.len(), 0);
        assert_eq!(Arc::strong_count(&fence), 1);
    }

    #[test]
    fn test_later_reader_does_not_block_reclaim() {
        let grace = GracePeriod::default();
        let mut list = RetireList::default();
        let fence = Fence::new(1, 1);

        let before = grace.enter();
        list.retire_fence(fence.clone());
        assert_eq!(list.reclaim(&grace), 0);

        let after = grace.enter();
        assert!(after.epoch > before.epoch);
        drop(before);
        assert_eq!(list.reclaim(&grace), 1);
        assert_eq!(Arc::strong_count(&fence), 1);
        drop(after);
    }

    #[test]
    fn test_overlapping_readers_keep_list_bounded() {
        let grace = GracePeriod::default();
        let mut list = RetireList::default();
        let fences: Vec<_> = (0..1000).map(|seqno| Fence::new(1, seqno)).collect();

        let mut reader = grace.enter();
        for fence in &fences {
            list.retire_fence(fence.clone());
            list.reclaim(&grace);
            // The next reader starts before the current one ends.
            let next = grace.enter();
            drop(std::mem::replace(&mut reader, next));
            assert!(list.len() <= 1, "{} objects pending", list.len());
        }
        drop(reader);
        list.reclaim(&grace);
        assert_eq!(list.len(), 0);
        assert!(fences.iter().all(|fence| Arc::strong_count(fence) == 1));
    }

    #[test]
    fn test_reclaim_keeps_newer_entries() {
        let grace = GracePeriod::default();
        let mut list = RetireList::default();
        let old = Fence::new(1, 1);
        let new = Fence::new(1, 2);

        let section = grace.enter();
        list.retire_fence(old.clone());
        list.reclaim(&grace);
        let pinned = grace.enter();
        list.retire_fence(new.clone());
        drop(section);

        // Only the reader that entered before `new` was retired holds it.
        assert_eq!(list.reclaim(&grace), 1);
        assert_eq!(Arc::strong_count(&old), 1);
        assert_eq!(Arc::strong_count(&new), 2);
        drop(pinned);
        assert_eq!(list.reclaim(&grace), 1);
        assert_eq!(Arc::strong_count(&new), 1);
    }
}
