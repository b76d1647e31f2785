//! Lock-free iteration over shared fences

use crate::grace::{GracePeriod, ReadSection};
use crate::layer::{Entry, Layer, acquire_raw};
use crate::trie::SharedTrie;
use heapless::Vec as FixedVec;
use resv_common::consts::MAX_LEVELS;
use resv_fence::FenceRef;
use std::iter::FusedIterator;

/// Iterator over the shared fences of a reservation object, in slot order.
///
/// Created by [`ReservationObject::for_each_shared`](crate::ReservationObject::for_each_shared).
/// It holds a read-side critical section open until dropped: it never sees a
/// half-built or freed layer, but may miss fences added after it started.
/// Retired layers are not reclaimed while any iterator is alive.
pub struct SharedFences<'a> {
    /// Per level: the layer being scanned and the next bit to look at.
    stack: FixedVec<(&'a Layer, u32), MAX_LEVELS>,
    _section: ReadSection<'a>,
}

impl<'a> SharedFences<'a> {
    pub(crate) fn new(trie: &'a SharedTrie, grace: &'a GracePeriod) -> Self {
        let section = grace.enter();
        let mut stack = FixedVec::new();
        // SAFETY: the section lives in the iterator next to every reference
        // taken from the trie.
        if let Some(root) = unsafe { trie.load_root() } {
            let _ = stack.push((root, 0));
        }
        Self {
            stack,
            _section: section,
        }
    }
}

impl Iterator for SharedFences<'_> {
    type Item = FenceRef;

    fn next(&mut self) -> Option<FenceRef> {
        loop {
            let (layer, next_bit) = self.stack.last_mut()?;
            let layer = *layer;
            let pending = u32::from(layer.bitmap()) & (u32::MAX << *next_bit);
            if pending == 0 {
                self.stack.pop();
                continue;
            }

            let index = pending.trailing_zeros();
            *next_bit = index + 1;
            match layer.entry(index as usize) {
                // Bit published before this load but slot read stale: skip.
                Entry::Empty => {}
                // SAFETY: the section keeps the owning leaf, and therefore
                // the fence, alive.
                Entry::Fence(fence) => return Some(unsafe { acquire_raw(fence) }),
                Entry::Child(child) => {
                    let pushed = self.stack.push((child, 0));
                    debug_assert!(pushed.is_ok(), "trie deeper than MAX_LEVELS");
                }
            }
        }
    }
}

impl FusedIterator for SharedFences<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trie::TrieWriter;
    use resv_fence::Fence;

    #[test]
    fn test_empty_trie_yields_nothing() {
        let grace = GracePeriod::default();
        let trie = SharedTrie::new();
        assert_eq!(SharedFences::new(&trie, &grace).count(), 0);
        assert!(grace.is_quiescent());
    }

    #[test]
    fn test_slot_order_across_levels() {
        let grace = GracePeriod::default();
        let trie = SharedTrie::new();
        let mut writer = TrieWriter::new(None);
        for seqno in 0..300 {
            trie.reserve(&mut writer).unwrap();
            trie.insert(&mut writer, Fence::new(9, seqno));
        }

        let seqnos: Vec<u64> = SharedFences::new(&trie, &grace)
            .map(|f| f.seqno())
            .collect();
        assert_eq!(seqnos, (0..300).collect::<Vec<_>>());
    }

    #[test]
    fn test_iterator_holds_read_section() {
        let grace = GracePeriod::default();
        let trie = SharedTrie::new();
        let iter = SharedFences::new(&trie, &grace);
        assert_eq!(grace.active_readers(), 1);
        drop(iter);
        assert!(grace.is_quiescent());
    }
}
