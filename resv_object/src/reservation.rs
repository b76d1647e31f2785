//! Reservation object facade
//!
//! Writers take the object's mutex through [`ReservationObject::lock`] and
//! mutate through the returned [`ReservationGuard`]. Everything else on
//! [`ReservationObject`] is a lock-free read.

use crate::error::{ResvError, ResvResult};
use crate::excl::ExclusiveSlot;
use crate::grace::{GracePeriod, RetireList};
use crate::iter::SharedFences;
use crate::trie::{SharedTrie, TrieWriter};
use crate::version::{ReadBackoff, VersionCounter};
use parking_lot::{Mutex, MutexGuard};
use resv_common::config::ResvConfig;
use resv_fence::{FenceRef, WaitResult};
use std::fmt;
use std::time::Duration;
use tracing::{debug, trace, warn};

struct WriterState {
    trie: TrieWriter,
    retired: RetireList,
    /// Set by `reserve_shared`, consumed by `add_shared_fence`
    reserved: bool,
}

/// Fences that must complete before the guarded resource is reused
pub struct ReservationObject {
    lock: Mutex<WriterState>,
    excl: ExclusiveSlot,
    trie: SharedTrie,
    grace: GracePeriod,
    config: ResvConfig,
}

/// Point-in-time copy of an object's fences
#[derive(Debug, Clone, Default)]
pub struct FenceSnapshot {
    /// Exclusive fence, if any
    pub exclusive: Option<FenceRef>,
    /// Shared fences in slot order
    pub shared: Vec<FenceRef>,
}

impl FenceSnapshot {
    /// True if every fence in the snapshot has signaled
    pub fn all_signaled(&self) -> bool {
        self.exclusive.iter().chain(&self.shared).all(|f| f.is_signaled())
    }
}

impl ReservationObject {
    /// Create an empty object with the default configuration
    pub fn new() -> Self {
        Self::build(ResvConfig::default())
    }

    /// Create an empty object with a validated configuration
    pub fn with_config(config: ResvConfig) -> ResvResult<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: ResvConfig) -> Self {
        Self {
            lock: Mutex::new(WriterState {
                trie: TrieWriter::new(config.layer_limit),
                retired: RetireList::default(),
                reserved: false,
            }),
            excl: ExclusiveSlot::default(),
            trie: SharedTrie::new(),
            grace: GracePeriod::default(),
            config,
        }
    }

    /// Tear the object down, releasing every fence immediately
    pub fn fini(self) {
        drop(self);
    }

    /// Configuration in effect
    pub fn config(&self) -> &ResvConfig {
        &self.config
    }

    /// Take the writer lock
    pub fn lock(&self) -> ReservationGuard<'_> {
        ReservationGuard::new(self, self.lock.lock())
    }

    /// Take the writer lock if it is free
    pub fn try_lock(&self) -> Option<ReservationGuard<'_>> {
        self.lock
            .try_lock()
            .map(|state| ReservationGuard::new(self, state))
    }

    /// Lock several objects without risking a lock-order deadlock.
    ///
    /// Locks are taken in address order; duplicates are locked once. Guards
    /// come back in that order, not in the order of `objects`.
    pub fn lock_all<'a>(objects: &[&'a ReservationObject]) -> Vec<ReservationGuard<'a>> {
        let mut ordered = objects.to_vec();
        ordered.sort_by_key(|obj| *obj as *const ReservationObject);
        ordered.dedup_by(|a, b| std::ptr::eq(*a, *b));
        ordered.into_iter().map(ReservationObject::lock).collect()
    }

    fn backoff(&self) -> ReadBackoff {
        ReadBackoff::new(self.config.max_read_retries)
    }

    /// Current exclusive fence. Lock-free.
    pub fn get_excl(&self) -> Option<FenceRef> {
        let section = self.grace.enter();
        self.excl.get(&section, &mut self.backoff())
    }

    /// Shared fences in slot order. Lock-free.
    pub fn for_each_shared(&self) -> SharedFences<'_> {
        SharedFences::new(&self.trie, &self.grace)
    }

    /// True if the exclusive fence (if any) has signaled and, with `all`,
    /// every shared fence too. Lock-free.
    pub fn test_signaled(&self, all: bool) -> bool {
        let section = self.grace.enter();
        let mut backoff = self.backoff();
        loop {
            let start = self.excl.seq().load();
            if VersionCounter::is_writing(start) {
                backoff.snooze();
                continue;
            }

            let mut signaled = self
                .excl
                .load(&section)
                .is_none_or(|fence| fence.is_signaled());
            if signaled && all {
                signaled = self.for_each_shared().all(|fence| fence.is_signaled());
            }

            if !self.excl.seq().changed_since(start) {
                return signaled;
            }
            backoff.snooze();
        }
    }

    fn first_unsignaled(&self, all: bool) -> Option<FenceRef> {
        if let Some(excl) = self.get_excl().filter(|f| !f.is_signaled()) {
            return Some(excl);
        }
        if all {
            return self.for_each_shared().find(|f| !f.is_signaled());
        }
        None
    }

    /// Block until [`test_signaled(all)`](Self::test_signaled) would be true.
    ///
    /// Returns the remaining timeout. A zero timeout only polls; with
    /// `interruptible`, raising the thread's [`resv_fence::Interrupt`] ends
    /// the wait with `Interrupted`. Fences added during the wait are waited
    /// for as well.
    pub fn wait_timeout(
        &self,
        all: bool,
        interruptible: bool,
        timeout: Duration,
    ) -> WaitResult<Duration> {
        let mut remaining = timeout;
        while let Some(fence) = self.first_unsignaled(all) {
            trace!(
                context = fence.context(),
                seqno = fence.seqno(),
                "waiting on reservation fence"
            );
            remaining = fence.wait_timeout(interruptible, remaining)?;
        }
        Ok(remaining)
    }

    /// Snapshot the exclusive fence and the shared set consistently.
    ///
    /// The snapshot is retried if an exclusive fence was installed while it
    /// was taken. Fences appended concurrently may or may not be included.
    pub fn get_fences(&self) -> FenceSnapshot {
        let section = self.grace.enter();
        let mut backoff = self.backoff();
        loop {
            let start = self.excl.seq().load();
            if VersionCounter::is_writing(start) {
                backoff.snooze();
                continue;
            }

            let exclusive = self.excl.load(&section);
            let shared: Vec<FenceRef> = self.for_each_shared().collect();

            if !self.excl.seq().changed_since(start) {
                if backoff.attempts() > 0 {
                    trace!(retries = backoff.attempts(), "fence snapshot retried");
                }
                return FenceSnapshot { exclusive, shared };
            }
            backoff.snooze();
        }
    }
}

impl Default for ReservationObject {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReservationObject {
    fn drop(&mut self) {
        // `&mut self` rules out readers: free everything now.
        let state = self.lock.get_mut();
        let released = state.retired.release_all();
        debug!(
            shared = state.trie.len(),
            retired = released,
            "reservation object destroyed"
        );
    }
}

impl fmt::Debug for ReservationObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservationObject")
            .field("config", &self.config)
            .field("readers", &self.grace.active_readers())
            .finish_non_exhaustive()
    }
}

/// Writer-side access to a [`ReservationObject`].
///
/// The critical section lasts as long as the guard. A pending
/// [`reserve_shared`](Self::reserve_shared) expires when the guard drops.
pub struct ReservationGuard<'a> {
    obj: &'a ReservationObject,
    state: MutexGuard<'a, WriterState>,
}

impl<'a> ReservationGuard<'a> {
    fn new(obj: &'a ReservationObject, mut state: MutexGuard<'a, WriterState>) -> Self {
        state.retired.reclaim(&obj.grace);
        Self { obj, state }
    }

    /// Object this guard locks
    pub fn object(&self) -> &'a ReservationObject {
        self.obj
    }

    /// Allocate whatever the next [`add_shared_fence`](Self::add_shared_fence)
    /// needs, so that the add itself cannot fail.
    ///
    /// # Errors
    ///
    /// `ResvError::OutOfMemory` if a layer cannot be allocated; the shared
    /// set is left unchanged.
    pub fn reserve_shared(&mut self) -> ResvResult<()> {
        let state = &mut *self.state;
        if let Err(e) = self.obj.trie.reserve(&mut state.trie) {
            warn!(error = %e, shared = state.trie.len(), "shared fence reservation failed");
            return Err(e);
        }
        state.reserved = true;
        Ok(())
    }

    /// Add a shared fence.
    ///
    /// Must follow a successful [`reserve_shared`](Self::reserve_shared) in
    /// the same critical section; each reservation covers one add.
    pub fn add_shared_fence(&mut self, fence: FenceRef) {
        let state = &mut *self.state;
        debug_assert!(
            state.reserved,
            "add_shared_fence called without a successful reserve_shared"
        );
        trace!(
            context = fence.context(),
            seqno = fence.seqno(),
            slot = state.trie.len(),
            "shared fence added"
        );
        self.obj.trie.insert(&mut state.trie, fence);
        state.reserved = false;
    }

    /// Install `fence` as the exclusive fence and drop every shared fence.
    ///
    /// Any pending reservation is cancelled.
    pub fn add_excl_fence(&mut self, fence: Option<FenceRef>) {
        let obj = self.obj;
        let state = &mut *self.state;
        if let Some(fence) = &fence {
            trace!(
                context = fence.context(),
                seqno = fence.seqno(),
                "exclusive fence added"
            );
        }

        let old = obj
            .excl
            .set(fence, || obj.trie.reset(&mut state.trie, &mut state.retired));
        if let Some(old) = old {
            state.retired.retire_fence(old);
        }
        state.reserved = false;
        state.retired.reclaim(&obj.grace);
    }

    /// Current exclusive fence, read under the lock
    pub fn get_excl_locked(&self) -> Option<FenceRef> {
        self.obj.excl.get_locked()
    }

    /// Number of shared fences
    pub fn shared_count(&self) -> usize {
        self.state.trie.len()
    }

    /// Number of shared fences the trie holds before it has to grow again;
    /// 0 while it is empty
    pub fn shared_capacity(&self) -> usize {
        self.obj.trie.capacity(&self.state.trie)
    }

    /// Retired layers and fences still waiting for readers to leave
    pub fn pending_reclaim(&self) -> usize {
        self.state.retired.len()
    }

    /// Replace this object's fences with a snapshot of `src`'s.
    ///
    /// The new shared set is built off to the side, so on `OutOfMemory`
    /// this object is unchanged.
    pub fn copy_fences(&mut self, src: &ReservationObject) -> ResvResult<()> {
        let snapshot = src.get_fences();

        let staged = SharedTrie::new();
        let mut staged_writer = TrieWriter::new(self.obj.config.layer_limit);
        for fence in snapshot.shared {
            staged.reserve(&mut staged_writer)?;
            staged.insert(&mut staged_writer, fence);
        }

        let obj = self.obj;
        let state = &mut *self.state;
        let count = staged_writer.len();
        let old = obj.excl.set(snapshot.exclusive, || {
            obj.trie
                .adopt(&mut state.trie, &mut state.retired, staged, staged_writer)
        });
        if let Some(old) = old {
            state.retired.retire_fence(old);
        }
        state.reserved = false;
        state.retired.reclaim(&obj.grace);
        debug!(shared = count, "fences copied");
        Ok(())
    }

    /// Wait for the readers that may still see retired objects to leave,
    /// then free everything retired.
    ///
    /// Spins while such a read section is open, including live iterators.
    /// Readers that entered after the last unlink do not hold it up.
    pub fn synchronize(&mut self) {
        let mut backoff = self.obj.backoff();
        self.state.retired.reclaim(&self.obj.grace);
        while !self.state.retired.is_empty() {
            backoff.snooze();
            self.state.retired.reclaim(&self.obj.grace);
        }
    }

    /// Check the trie invariants and the shared fence count.
    ///
    /// # Errors
    ///
    /// `ResvError::StructuralCorruption` naming the first violation found.
    pub fn validate(&self) -> ResvResult<()> {
        let section = self.obj.grace.enter();
        let found = self.obj.trie.validate(&section)?;
        if found != self.state.trie.len() {
            return Err(ResvError::corruption(format!(
                "{found} fences linked but {} recorded",
                self.state.trie.len()
            )));
        }
        trace!(fences = found, layers = self.state.trie.layers(), "trie valid");
        Ok(())
    }
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        self.state.reserved = false;
        self.state.retired.reclaim(&self.obj.grace);
    }
}
