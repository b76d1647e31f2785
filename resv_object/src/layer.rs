//! Shared-fence trie layers
//!
//! A layer covers a contiguous range of keys. At height 0 its slots hold
//! fences; above that they hold child layers one level lower. Keys consume
//! `SHARED_BITS` bits per level, so a layer of height `h` covers every key
//! whose bits above `SHARED_BITS * (h + 1)` equal its prefix.

use crate::error::{ResvError, ResvResult};
use resv_common::consts::{SHARED_BITS, SHARED_DIGIT_MASK, SHARED_FANOUT};
use resv_fence::{Fence, FenceRef};
use std::alloc::{self, Layout};
use std::mem::{self, MaybeUninit};
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU16, Ordering};

/// Slot contents, decided by the layer height
pub(crate) enum Slots {
    /// Height 0: owned fence references (`Arc::into_raw`)
    Fences([AtomicPtr<Fence>; SHARED_FANOUT]),
    /// Height > 0: owned child layers
    Layers([AtomicPtr<Layer>; SHARED_FANOUT]),
}

/// One trie node
pub(crate) struct Layer {
    prefix: u64,
    height: u8,
    bitmap: AtomicU16,
    /// Navigational only, never used for lifetime decisions.
    parent: AtomicPtr<Layer>,
    slots: Slots,
}

/// What a reader finds in one slot
pub(crate) enum Entry<'a> {
    Empty,
    Fence(&'a Fence),
    Child(&'a Layer),
}

/// Digit of `key` selecting the slot in a layer of `height`
pub(crate) fn digit(key: u64, height: u8) -> usize {
    ((key >> (SHARED_BITS * u32::from(height))) & SHARED_DIGIT_MASK) as usize
}

/// Acquire a new reference to a fence owned by a trie or exclusive slot.
///
/// # Safety
///
/// `fence` must come from `Arc::into_raw` and its owning slot must stay
/// alive for the duration of the call (e.g. under a read section).
pub(crate) unsafe fn acquire_raw(fence: *const Fence) -> FenceRef {
    unsafe {
        Arc::increment_strong_count(fence);
        Arc::from_raw(fence)
    }
}

impl Layer {
    fn new(prefix: u64, height: u8, parent: Option<NonNull<Layer>>) -> Self {
        let slots = if height == 0 {
            Slots::Fences(std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())))
        } else {
            Slots::Layers(std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())))
        };
        Self {
            prefix,
            height,
            bitmap: AtomicU16::new(0),
            parent: AtomicPtr::new(parent.map_or(ptr::null_mut(), NonNull::as_ptr)),
            slots,
        }
    }

    pub(crate) fn prefix(&self) -> u64 {
        self.prefix
    }

    pub(crate) fn height(&self) -> u8 {
        self.height
    }

    pub(crate) fn bitmap(&self) -> u16 {
        self.bitmap.load(Ordering::Acquire)
    }

    pub(crate) fn is_leaf(&self) -> bool {
        matches!(self.slots, Slots::Fences(_))
    }

    pub(crate) fn parent(&self) -> Option<NonNull<Layer>> {
        NonNull::new(self.parent.load(Ordering::Relaxed))
    }

    /// True if `key` falls inside this layer's range
    pub(crate) fn covers(&self, key: u64) -> bool {
        let span = SHARED_BITS * (u32::from(self.height) + 1);
        key.checked_shr(span).unwrap_or(0) == self.prefix
    }

    /// Number of keys this layer spans
    pub(crate) fn capacity(&self) -> usize {
        SHARED_FANOUT
            .checked_pow(u32::from(self.height) + 1)
            .unwrap_or(usize::MAX)
    }

    pub(crate) fn entry(&self, index: usize) -> Entry<'_> {
        match &self.slots {
            Slots::Fences(slots) => {
                let fence = slots[index].load(Ordering::Acquire);
                // SAFETY: a linked fence is owned by this layer, which the
                // caller keeps alive.
                unsafe { fence.as_ref() }.map_or(Entry::Empty, Entry::Fence)
            }
            Slots::Layers(slots) => {
                let child = slots[index].load(Ordering::Acquire);
                // SAFETY: children are fully initialised before being linked
                // and are freed only together with their parent.
                unsafe { child.as_ref() }.map_or(Entry::Empty, Entry::Child)
            }
        }
    }

    /// Link `fence` into an empty leaf slot. Writer lock held.
    pub(crate) fn publish_fence(&self, index: usize, fence: FenceRef) {
        let Slots::Fences(slots) = &self.slots else {
            unreachable!("fence published into an internal layer");
        };
        debug_assert!(slots[index].load(Ordering::Relaxed).is_null());
        slots[index].store(Arc::into_raw(fence).cast_mut(), Ordering::Release);
        self.bitmap.fetch_or(1 << index, Ordering::Release);
    }

    /// Link a fully initialised `child` into an empty slot. Writer lock held.
    pub(crate) fn publish_child(&self, index: usize, child: NonNull<Layer>) {
        let Slots::Layers(slots) = &self.slots else {
            unreachable!("layer published into a leaf");
        };
        debug_assert!(slots[index].load(Ordering::Relaxed).is_null());
        // SAFETY: the writer owns `child` and nobody else mutates it.
        unsafe { child.as_ref() }
            .parent
            .store(ptr::from_ref(self).cast_mut(), Ordering::Relaxed);
        slots[index].store(child.as_ptr(), Ordering::Release);
        self.bitmap.fetch_or(1 << index, Ordering::Release);
    }

    /// Free a whole unlinked tree, releasing its fences.
    ///
    /// # Safety
    ///
    /// `root` must have been produced by [`SpareLayer::init`], be unlinked
    /// from any live trie, and no reader may still reference it.
    pub(crate) unsafe fn free_tree(root: NonNull<Layer>) {
        // The allocation matches `Layout::new::<Layer>()`, which is what
        // `Box` uses, so the box may free it.
        drop(unsafe { Box::from_raw(root.as_ptr()) });
    }
}

impl Drop for Layer {
    /// Postorder: every slot is cleared, children freed and fences
    /// released before this layer's memory goes.
    fn drop(&mut self) {
        *self.bitmap.get_mut() = 0;
        match &mut self.slots {
            Slots::Fences(slots) => {
                for slot in slots.iter_mut() {
                    let fence = mem::replace(slot.get_mut(), ptr::null_mut());
                    if !fence.is_null() {
                        // SAFETY: stored by `publish_fence` from `Arc::into_raw`.
                        drop(unsafe { Arc::from_raw(fence.cast_const()) });
                    }
                }
            }
            Slots::Layers(slots) => {
                for slot in slots.iter_mut() {
                    let child = mem::replace(slot.get_mut(), ptr::null_mut());
                    if let Some(child) = NonNull::new(child) {
                        // SAFETY: children are exclusively owned by this layer.
                        unsafe { Layer::free_tree(child) };
                    }
                }
            }
        }
    }
}

/// Uninitialised layer memory set aside by a reservation
pub(crate) struct SpareLayer(NonNull<MaybeUninit<Layer>>);

// SAFETY: plain uninitialised memory owned by the writer.
unsafe impl Send for SpareLayer {}

impl SpareLayer {
    fn layout() -> Layout {
        Layout::new::<Layer>()
    }

    /// Allocate, reporting failure instead of aborting
    pub(crate) fn try_alloc() -> ResvResult<Self> {
        let layout = Self::layout();
        // SAFETY: `Layer` is not zero-sized.
        let raw = unsafe { alloc::alloc(layout) };
        NonNull::new(raw.cast::<MaybeUninit<Layer>>())
            .map(SpareLayer)
            .ok_or(ResvError::OutOfMemory {
                bytes: layout.size(),
            })
    }

    /// Allocate on a path that cannot report failure
    pub(crate) fn alloc_or_abort() -> Self {
        match Self::try_alloc() {
            Ok(spare) => spare,
            Err(_) => alloc::handle_alloc_error(Self::layout()),
        }
    }

    /// Turn the memory into an empty layer
    pub(crate) fn init(
        self,
        prefix: u64,
        height: u8,
        parent: Option<NonNull<Layer>>,
    ) -> NonNull<Layer> {
        let raw = self.0;
        mem::forget(self);
        // SAFETY: `raw` is a live, exclusively owned allocation for a Layer.
        unsafe { raw.as_ptr().write(MaybeUninit::new(Layer::new(prefix, height, parent))) };
        raw.cast()
    }
}

impl Drop for SpareLayer {
    fn drop(&mut self) {
        // SAFETY: allocated by `try_alloc` with this layout, never initialised.
        unsafe { alloc::dealloc(self.0.as_ptr().cast(), Self::layout()) };
    }
}
