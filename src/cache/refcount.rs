// # Reference Counting with a Deletion Terminal State
//
// A 32-bit signed atomic reference counter. Besides plain acquire/release
// it supports an irreversible transition to a DELETED sentinel that makes
// every subsequent acquire fail, so a page can be claimed for destruction
// exactly once, and only while nobody references it.

use std::sync::atomic::{AtomicI32, Ordering};

/// Sentinel stored in the counter once the page has been claimed for
/// deletion. Any negative value means "not acquirable".
const REFCOUNT_DELETED: i32 = i32::MIN;

/// Atomic reference counter with a terminal DELETED state.
///
/// All successful state changes use `AcqRel` so that a thread that wins
/// `acquire_for_deletion()` observes every prior release, and no thread
/// can observe the page as live afterwards.
pub(crate) struct Refcount(AtomicI32);

impl Refcount {
    #[inline]
    pub fn new(count: i32) -> Self {
        debug_assert!(count >= 0);
        Self(AtomicI32::new(count))
    }

    /// Increment the counter, unless the page is tagged for deletion.
    ///
    /// Returns the new count on success, None when the page is DELETED.
    #[inline]
    pub fn acquire(&self) -> Option<i32> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current < 0 {
                return None;
            }

            match self.0.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current + 1),
                Err(observed) => current = observed,
            }
        }
    }

    /// Decrement the counter, returning the new count.
    ///
    /// Panics on underflow or when the page is already DELETED, both of
    /// which mean a caller released a reference it did not hold.
    #[inline]
    pub fn release(&self) -> i32 {
        let old = self.0.fetch_sub(1, Ordering::AcqRel);
        if old <= 0 {
            panic!("refcount released below zero (old count {old})");
        }
        old - 1
    }

    /// Claim the page for deletion. Succeeds only when the count is zero;
    /// on success the counter becomes DELETED and future acquires fail.
    #[inline]
    pub fn acquire_for_deletion(&self) -> bool {
        self.0
            .compare_exchange(0, REFCOUNT_DELETED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Atomically drop one reference and, if it was the last one,
    /// transition to DELETED. Returns true when the caller now owns the
    /// page for deletion, false when other references remain (the
    /// caller's reference has been released either way).
    #[inline]
    pub fn release_and_acquire_for_deletion(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                panic!("refcount released below zero (old count {current})");
            }

            let desired = if current == 1 { REFCOUNT_DELETED } else { current - 1 };
            match self.0.compare_exchange_weak(
                current,
                desired,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current == 1,
                Err(observed) => current = observed,
            }
        }
    }

    /// Current count. Negative means DELETED. Diagnostic use only.
    #[inline]
    pub fn value(&self) -> i32 {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release() {
        let rc = Refcount::new(1);
        assert_eq!(rc.acquire(), Some(2));
        assert_eq!(rc.release(), 1);
        assert_eq!(rc.release(), 0);
    }

    #[test]
    fn test_acquire_for_deletion_requires_zero() {
        let rc = Refcount::new(1);
        assert!(!rc.acquire_for_deletion());
        rc.release();
        assert!(rc.acquire_for_deletion());

        // once deleted, acquires fail
        assert_eq!(rc.acquire(), None);
    }

    #[test]
    fn test_release_and_acquire_for_deletion() {
        let rc = Refcount::new(2);
        assert!(!rc.release_and_acquire_for_deletion());
        assert!(rc.release_and_acquire_for_deletion());
        assert_eq!(rc.acquire(), None);
    }

    #[test]
    #[should_panic]
    fn test_underflow_panics() {
        let rc = Refcount::new(0);
        rc.release();
    }

    #[test]
    fn test_concurrent_deletion_single_winner() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let rc = Arc::new(Refcount::new(0));
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rc = Arc::clone(&rc);
                let winners = Arc::clone(&winners);
                std::thread::spawn(move || {
                    if rc.acquire_for_deletion() {
                        winners.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::Relaxed), 1);
    }
}
