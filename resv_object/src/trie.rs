//! Shared-fence trie
//!
//! Fences are stored at dense keys `0, 1, 2, ...` in insertion order. The
//! root grows one level at a time as keys outrun its capacity; nothing is
//! removed until [`SharedTrie::reset`] unlinks the whole tree.
//!
//! Mutation happens only under the reservation object's writer lock, which
//! is represented by `&mut TrieWriter`. Readers walk the tree lock-free
//! inside a read section: every layer is fully initialised before it is
//! linked, and unlinked layers are freed only after the grace period.

use crate::error::{ResvError, ResvResult};
use crate::grace::{ReadSection, RetireList};
use crate::layer::{Entry, Layer, SpareLayer, digit};
use heapless::Vec as FixedVec;
use resv_common::consts::{MAX_LAYERS_PER_INSERT, SHARED_BITS, SHARED_DIGIT_MASK, SHARED_FANOUT};
use resv_fence::FenceRef;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};
use tracing::{debug, trace, warn};

/// Writer-side state, reachable only through the writer lock
pub(crate) struct TrieWriter {
    /// Leaf that received the last insert
    hint: Option<NonNull<Layer>>,
    len: usize,
    layers: usize,
    spare: FixedVec<SpareLayer, MAX_LAYERS_PER_INSERT>,
    layer_limit: Option<usize>,
}

// SAFETY: the hint points into a trie owned by the same reservation object
// and is only dereferenced with the writer lock held.
unsafe impl Send for TrieWriter {}

impl TrieWriter {
    pub(crate) fn new(layer_limit: Option<usize>) -> Self {
        Self {
            hint: None,
            len: 0,
            layers: 0,
            spare: FixedVec::new(),
            layer_limit,
        }
    }

    /// Fences currently linked
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Layers currently linked
    pub(crate) fn layers(&self) -> usize {
        self.layers
    }

    fn take_layer(
        &mut self,
        prefix: u64,
        height: u8,
        parent: Option<NonNull<Layer>>,
    ) -> NonNull<Layer> {
        let spare = self.spare.pop().unwrap_or_else(|| {
            warn!(prefix, height, "trie layer allocated without a reservation");
            SpareLayer::alloc_or_abort()
        });
        self.layers += 1;
        spare.init(prefix, height, parent)
    }
}

/// Root of the shared-fence trie
pub(crate) struct SharedTrie {
    root: AtomicPtr<Layer>,
}

impl SharedTrie {
    pub(crate) fn new() -> Self {
        Self {
            root: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Root as seen by a reader.
    ///
    /// # Safety
    ///
    /// The caller must hold a [`ReadSection`] of the owning object for all of
    /// `'a`.
    pub(crate) unsafe fn load_root<'a>(&'a self) -> Option<&'a Layer> {
        // SAFETY: pairs with the SeqCst store in `reset` and the grace period
        // check; the caller's read section keeps the layer alive.
        unsafe { self.root.load(Ordering::SeqCst).as_ref() }
    }

    fn writer_root(&self, _writer: &TrieWriter) -> Option<NonNull<Layer>> {
        NonNull::new(self.root.load(Ordering::Relaxed))
    }

    /// Keys the current root spans; 0 when empty
    pub(crate) fn capacity(&self, writer: &TrieWriter) -> usize {
        // SAFETY: the writer lock keeps the root alive.
        self.writer_root(writer)
            .map_or(0, |root| unsafe { root.as_ref() }.capacity())
    }

    /// Layers the next insert will have to create
    pub(crate) fn layers_needed(&self, writer: &TrieWriter) -> usize {
        let Some(root) = self.writer_root(writer) else {
            return 1;
        };
        // SAFETY: the writer lock keeps the root alive.
        let root = unsafe { root.as_ref() };
        let key = writer.len as u64;

        let mut height = u32::from(root.height());
        let mut needed = 0;
        if !root.covers(key) {
            height += 1;
            needed += 1;
        }
        // With dense keys, the level-`l` layer holding `key` is missing
        // exactly when `key` starts that layer's range.
        needed
            + (0..height)
                .filter(|level| key & ((1u64 << (SHARED_BITS * (level + 1))) - 1) == 0)
                .count()
    }

    /// Pre-allocate every layer the next insert needs.
    ///
    /// On failure the trie is untouched; spare layers already obtained stay
    /// pooled for a later attempt.
    pub(crate) fn reserve(&self, writer: &mut TrieWriter) -> ResvResult<()> {
        let needed = self.layers_needed(writer);
        while writer.spare.len() < needed {
            if let Some(limit) = writer.layer_limit {
                if writer.layers + writer.spare.len() >= limit {
                    return Err(ResvError::OutOfMemory {
                        bytes: std::mem::size_of::<Layer>(),
                    });
                }
            }
            let spare = SpareLayer::try_alloc()?;
            if writer.spare.push(spare).is_err() {
                break;
            }
        }
        trace!(needed, pooled = writer.spare.len(), "shared slot reserved");
        Ok(())
    }

    /// Append `fence` at the next key. Writer lock held.
    pub(crate) fn insert(&self, writer: &mut TrieWriter, fence: FenceRef) {
        let key = writer.len as u64;
        // SAFETY: the hint is a live layer of this trie; `reset` clears it.
        let leaf = match writer.hint {
            Some(hint) if unsafe { hint.as_ref() }.covers(key) => hint,
            _ => self.locate(writer, key),
        };

        // SAFETY: `leaf` is linked into this trie and the writer lock is held.
        let leaf_ref = unsafe { leaf.as_ref() };
        leaf_ref.publish_fence(digit(key, 0), fence);
        writer.len += 1;
        writer.hint = Some(leaf);
    }

    /// Find or build the leaf for `key`, growing the root if needed
    fn locate(&self, writer: &mut TrieWriter, key: u64) -> NonNull<Layer> {
        let Some(mut root) = self.writer_root(writer) else {
            let leaf = writer.take_layer(key >> SHARED_BITS, 0, None);
            self.root.store(leaf.as_ptr(), Ordering::SeqCst);
            debug!(capacity = SHARED_FANOUT, "shared trie rooted");
            return leaf;
        };

        // SAFETY: every pointer below is a live layer of this trie and the
        // writer lock is held.
        unsafe {
            while !root.as_ref().covers(key) {
                root = self.grow(writer, root);
            }

            // Climb from the last leaf to the lowest ancestor covering `key`.
            let mut layer = writer.hint.unwrap_or(root);
            while !layer.as_ref().covers(key) {
                layer = layer.as_ref().parent().unwrap_or(root);
            }

            while layer.as_ref().height() > 0 {
                let parent = layer.as_ref();
                let index = digit(key, parent.height());
                layer = match parent.entry(index) {
                    Entry::Child(child) => NonNull::from(child),
                    _ => {
                        let prefix = key >> (SHARED_BITS * u32::from(parent.height()));
                        let child = writer.take_layer(prefix, parent.height() - 1, Some(layer));
                        parent.publish_child(index, child);
                        child
                    }
                };
            }
            layer
        }
    }

    /// Put a root one level taller above `old`
    fn grow(&self, writer: &mut TrieWriter, old: NonNull<Layer>) -> NonNull<Layer> {
        // SAFETY: `old` is the live root and the writer lock is held.
        let old_ref = unsafe { old.as_ref() };
        let root = writer.take_layer(old_ref.prefix() >> SHARED_BITS, old_ref.height() + 1, None);
        // SAFETY: `root` is fresh and owned by the writer until published.
        let root_ref = unsafe { root.as_ref() };
        root_ref.publish_child((old_ref.prefix() & SHARED_DIGIT_MASK) as usize, old);
        self.root.store(root.as_ptr(), Ordering::SeqCst);
        debug!(
            height = root_ref.height(),
            capacity = root_ref.capacity(),
            "shared trie grew"
        );
        root
    }

    /// Unlink every fence. The old tree is retired, not freed.
    pub(crate) fn reset(&self, writer: &mut TrieWriter, retired: &mut RetireList) {
        let old = self.root.swap(ptr::null_mut(), Ordering::SeqCst);
        if let Some(old) = NonNull::new(old) {
            debug!(
                fences = writer.len,
                layers = writer.layers,
                "shared trie reset"
            );
            retired.retire_tree(old);
        }
        writer.hint = None;
        writer.len = 0;
        writer.layers = 0;
    }

    /// Replace the contents with a tree built offline in `staged`.
    pub(crate) fn adopt(
        &self,
        writer: &mut TrieWriter,
        retired: &mut RetireList,
        staged: SharedTrie,
        staged_writer: TrieWriter,
    ) {
        self.reset(writer, retired);
        let root = staged.root.swap(ptr::null_mut(), Ordering::Relaxed);
        writer.hint = staged_writer.hint;
        writer.len = staged_writer.len;
        writer.layers = staged_writer.layers;
        self.root.store(root, Ordering::SeqCst);
    }

    /// Check every structural invariant; returns the number of fences.
    pub(crate) fn validate(&self, _section: &ReadSection<'_>) -> ResvResult<usize> {
        // SAFETY: `_section` is held for the whole walk.
        let Some(root) = (unsafe { self.load_root() }) else {
            return Ok(0);
        };
        if root.parent().is_some() {
            return Err(ResvError::corruption("root has a parent"));
        }
        validate_layer(root, None, None)
    }
}

fn validate_layer(
    layer: &Layer,
    parent: Option<&Layer>,
    expected_digit: Option<usize>,
) -> ResvResult<usize> {
    if let (Some(parent), Some(expected)) = (parent, expected_digit) {
        if layer.height() >= parent.height() {
            return Err(ResvError::corruption(format!(
                "child height {} not below parent height {}",
                layer.height(),
                parent.height()
            )));
        }
        let gap = SHARED_BITS * u32::from(parent.height() - layer.height());
        if layer.prefix() >> gap != parent.prefix() {
            return Err(ResvError::corruption(format!(
                "prefix {:#x} outside parent prefix {:#x}",
                layer.prefix(),
                parent.prefix()
            )));
        }
        let found = ((layer.prefix() >> (gap - SHARED_BITS)) & SHARED_DIGIT_MASK) as usize;
        if found != expected {
            return Err(ResvError::corruption(format!(
                "layer {:#x} linked at slot {expected}, expected slot {found}",
                layer.prefix()
            )));
        }
        if layer.parent() != Some(NonNull::from(parent)) {
            return Err(ResvError::corruption(format!(
                "layer {:#x} has a stale parent link",
                layer.prefix()
            )));
        }
    }

    if layer.is_leaf() != (layer.height() == 0) {
        return Err(ResvError::corruption(format!(
            "layer {:#x} at height {} holds the wrong slot kind",
            layer.prefix(),
            layer.height()
        )));
    }

    let bitmap = layer.bitmap();
    let mut fences = 0;
    for index in 0..SHARED_FANOUT {
        let bit = bitmap & (1 << index) != 0;
        let entry = layer.entry(index);
        if bit == matches!(entry, Entry::Empty) {
            return Err(ResvError::corruption(format!(
                "layer {:#x} slot {index} disagrees with its bitmap bit",
                layer.prefix()
            )));
        }
        match entry {
            Entry::Empty => {}
            Entry::Fence(_) => fences += 1,
            Entry::Child(child) => fences += validate_layer(child, Some(layer), Some(index))?,
        }
    }
    Ok(fences)
}

impl Drop for SharedTrie {
    fn drop(&mut self) {
        if let Some(root) = NonNull::new(*self.root.get_mut()) {
            // SAFETY: `&mut self` proves no reader is left.
            unsafe { Layer::free_tree(root) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grace::GracePeriod;
    use resv_fence::Fence;
    use std::sync::Arc;

    fn fill(trie: &SharedTrie, writer: &mut TrieWriter, count: u64) -> Vec<FenceRef> {
        (0..count)
            .map(|seqno| {
                let fence = Fence::new(1, seqno);
                trie.reserve(writer).unwrap();
                trie.insert(writer, fence.clone());
                fence
            })
            .collect()
    }

    #[test]
    fn test_layers_needed_follows_geometry() {
        let trie = SharedTrie::new();
        let mut writer = TrieWriter::new(None);
        assert_eq!(trie.layers_needed(&writer), 1);

        fill(&trie, &mut writer, 1);
        assert_eq!(trie.layers_needed(&writer), 0);

        fill(&trie, &mut writer, 15);
        // Key 16: new root + new leaf.
        assert_eq!(trie.layers_needed(&writer), 2);

        fill(&trie, &mut writer, 256 - 16);
        // Key 256: new root + two-level path.
        assert_eq!(trie.layers_needed(&writer), 3);
    }

    #[test]
    fn test_growth_capacities() {
        let trie = SharedTrie::new();
        let mut writer = TrieWriter::new(None);
        assert_eq!(trie.capacity(&writer), 0);

        fill(&trie, &mut writer, 16);
        assert_eq!(trie.capacity(&writer), 16);
        assert_eq!(writer.layers(), 1);

        fill(&trie, &mut writer, 1);
        assert_eq!(trie.capacity(&writer), 256);
        assert_eq!(writer.layers(), 3);

        fill(&trie, &mut writer, 256 - 17 + 1);
        assert_eq!(trie.capacity(&writer), 4096);
        assert_eq!(writer.len(), 257);
    }

    #[test]
    fn test_validate_counts_fences() {
        let grace = GracePeriod::default();
        let trie = SharedTrie::new();
        let mut writer = TrieWriter::new(None);

        for count in [0u64, 1, 15, 1, 200, 40] {
            fill(&trie, &mut writer, count);
            let section = grace.enter();
            assert_eq!(trie.validate(&section).unwrap(), writer.len());
        }
    }

    #[test]
    fn test_layer_limit_reports_oom_without_mutation() {
        let trie = SharedTrie::new();
        let mut writer = TrieWriter::new(Some(1));
        fill(&trie, &mut writer, 16);

        // Key 16 needs two more layers than the limit allows.
        assert!(matches!(
            trie.reserve(&mut writer),
            Err(ResvError::OutOfMemory { .. })
        ));
        assert_eq!(writer.len(), 16);
        assert_eq!(trie.capacity(&writer), 16);
    }

    #[test]
    fn test_reset_retires_tree() {
        let grace = GracePeriod::default();
        let mut retired = RetireList::default();
        let trie = SharedTrie::new();
        let mut writer = TrieWriter::new(None);
        let fences = fill(&trie, &mut writer, 40);
        assert!(fences.iter().all(|f| Arc::strong_count(f) == 2));

        trie.reset(&mut writer, &mut retired);
        assert_eq!(writer.len(), 0);
        assert_eq!(trie.capacity(&writer), 0);
        assert_eq!(retired.len(), 1);

        assert_eq!(retired.reclaim(&grace), 1);
        assert!(fences.iter().all(|f| Arc::strong_count(f) == 1));
    }
}
