//! Atomic sequence counter for optimistic concurrency control

use std::sync::atomic::{AtomicU64, Ordering, fence};

/// Sequence counter using even/odd optimistic versioning
///
/// Writers (serialized by the writer lock) bump the counter to odd before
/// touching the guarded pointers and back to even afterwards. Readers sample
/// the counter before and after their reads and retry on any change.
#[derive(Debug, Default)]
pub struct VersionCounter {
    counter: AtomicU64,
}

impl VersionCounter {
    /// Create a new counter starting at 0 (even)
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Current value with acquire ordering
    pub fn load(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Begin a write section - increment to odd
    pub fn begin_write(&self) -> u64 {
        let next = self.counter.load(Ordering::Relaxed) + 1;
        self.counter.store(next, Ordering::Relaxed);
        // Order the odd value before every store of the section.
        fence(Ordering::Release);
        next
    }

    /// Complete a write section - increment to even
    pub fn end_write(&self) -> u64 {
        let next = self.counter.load(Ordering::Relaxed) + 1;
        self.counter.store(next, Ordering::Release);
        next
    }

    /// True if a write section started or finished since `start` was read
    pub fn changed_since(&self, start: u64) -> bool {
        // Order the section's reads before the second sample.
        fence(Ordering::Acquire);
        self.counter.load(Ordering::Relaxed) != start
    }

    /// Check if version is stable (even)
    pub fn is_stable(version: u64) -> bool {
        version % 2 == 0
    }

    /// Check if version indicates write in progress (odd)
    pub fn is_writing(version: u64) -> bool {
        version % 2 == 1
    }
}

/// Retry pacing for optimistic readers: spin first, then yield the CPU
#[derive(Debug)]
pub(crate) struct ReadBackoff {
    attempt: u32,
    spin_limit: u32,
}

impl ReadBackoff {
    pub(crate) fn new(spin_limit: u32) -> Self {
        Self {
            attempt: 0,
            spin_limit,
        }
    }

    pub(crate) fn snooze(&mut self) {
        if self.attempt < self.spin_limit {
            self.attempt += 1;
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_counter_creation() {
        let counter = VersionCounter::new();
        assert_eq!(counter.load(), 0);
        assert!(VersionCounter::is_stable(counter.load()));
    }

    #[test]
    fn test_write_cycle() {
        let counter = VersionCounter::new();

        let v1 = counter.begin_write();
        assert_eq!(v1, 1);
        assert!(VersionCounter::is_writing(v1));

        let v2 = counter.end_write();
        assert_eq!(v2, 2);
        assert!(VersionCounter::is_stable(v2));
    }

    #[test]
    fn test_changed_since_detects_writes() {
        let counter = VersionCounter::new();
        let start = counter.load();
        assert!(!counter.changed_since(start));

        counter.begin_write();
        assert!(counter.changed_since(start));
        counter.end_write();
        assert!(counter.changed_since(start));
        assert!(!counter.changed_since(counter.load()));
    }

    #[test]
    fn test_backoff_counts_spins() {
        let mut backoff = ReadBackoff::new(2);
        for _ in 0..5 {
            backoff.snooze();
        }
        assert_eq!(backoff.attempts(), 2);
    }
}
