// # Page Object
//
// A page couples an immutable identity `(section, metric_id, start_time)`
// with mutable state: flags, reference count, timestamps, accounting size
// and the opaque user payload. Identity fields never change after the
// page has been inserted into the index.
//
// The state flags are a small atomic bitfield. Exactly one of HOT, DIRTY
// and CLEAN is set while the page is linked in a queue; the independent
// bits track deletion, migration and access history.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU32, AtomicU8, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::cache::refcount::Refcount;

/// Coarse-grained tenant of the cache. Pages are never shared across
/// sections.
pub type SectionId = u64;

/// Opaque time-series identifier within a section.
pub type MetricId = u64;

// ============================================================================
// Page Flags
// ============================================================================

pub(crate) const PAGE_CLEAN: u8 = 1 << 0;
pub(crate) const PAGE_DIRTY: u8 = 1 << 1;
pub(crate) const PAGE_HOT: u8 = 1 << 2;
pub(crate) const PAGE_BEING_DELETED: u8 = 1 << 3;
pub(crate) const PAGE_BEING_MIGRATED: u8 = 1 << 4;
pub(crate) const PAGE_IGNORE_ACCESSES: u8 = 1 << 5;
pub(crate) const PAGE_HAS_BEEN_ACCESSED: u8 = 1 << 6;

pub(crate) const PAGE_STATE_MASK: u8 = PAGE_HOT | PAGE_DIRTY | PAGE_CLEAN;

/// Atomic page flag bitfield.
pub(crate) struct PageFlags(AtomicU8);

impl PageFlags {
    #[inline]
    pub fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    #[inline(always)]
    pub fn check(&self, mask: u8) -> u8 {
        self.0.load(Ordering::Acquire) & mask
    }

    #[inline(always)]
    pub fn set(&self, mask: u8) {
        self.0.fetch_or(mask, Ordering::Release);
    }

    #[inline(always)]
    pub fn clear(&self, mask: u8) {
        self.0.fetch_and(!mask, Ordering::Release);
    }

    /// The mutually exclusive HOT/DIRTY/CLEAN portion of the bitfield.
    #[inline(always)]
    pub fn state(&self) -> u8 {
        self.check(PAGE_STATE_MASK)
    }
}

// ============================================================================
// Transition Spinlock
// ============================================================================

/// Tiny spinlock taken whenever the page moves between queues.
///
/// Kept manual (no guard) because the flush and migration engines hold it
/// across user callbacks, past the scope where it was taken.
pub(crate) struct TransitionLock(AtomicBool);

impl TransitionLock {
    #[inline]
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub fn lock(&self) {
        let mut spins = 0u32;
        while !self.try_lock() {
            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    #[inline]
    pub fn unlock(&self) {
        debug_assert!(self.0.load(Ordering::Relaxed), "unlocking an unlocked transition lock");
        self.0.store(false, Ordering::Release);
    }
}

// ============================================================================
// Page
// ============================================================================

/// A bounded time range of samples for one metric, plus the cache
/// bookkeeping around it.
///
/// Pages are handed out to callers as [`PageHandle`](crate::cache::PageHandle)s;
/// the accessors here are the read surface available through a handle.
pub struct Page<D> {
    // immutable identity
    section: SectionId,
    metric_id: MetricId,
    start_time_s: i64,

    // mutable state
    end_time_s: AtomicI64,
    update_every_s: AtomicU32,
    assumed_size: AtomicI64,
    accesses: AtomicU16,

    pub(crate) flags: PageFlags,
    pub(crate) refcount: Refcount,
    pub(crate) transition: TransitionLock,

    // position key inside whichever queue map currently links the page
    pub(crate) queue_key: AtomicI64,

    custom_data: RwLock<Box<[u8]>>,
    data: D,
}

impl<D> Page<D> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        section: SectionId,
        metric_id: MetricId,
        start_time_s: i64,
        end_time_s: i64,
        update_every_s: u32,
        assumed_size: i64,
        accesses: u16,
        custom_data: Box<[u8]>,
        data: D,
    ) -> Self {
        Self {
            section,
            metric_id,
            start_time_s,
            end_time_s: AtomicI64::new(end_time_s),
            update_every_s: AtomicU32::new(update_every_s),
            assumed_size: AtomicI64::new(assumed_size),
            accesses: AtomicU16::new(accesses),
            flags: PageFlags::new(),
            refcount: Refcount::new(1),
            transition: TransitionLock::new(),
            queue_key: AtomicI64::new(0),
            custom_data: RwLock::new(custom_data),
            data,
        }
    }

    #[inline]
    pub fn section(&self) -> SectionId {
        self.section
    }

    #[inline]
    pub fn metric_id(&self) -> MetricId {
        self.metric_id
    }

    #[inline]
    pub fn start_time_s(&self) -> i64 {
        self.start_time_s
    }

    /// Monotonically non-decreasing; a reader that found the page through
    /// the index never observes it shrinking.
    #[inline]
    pub fn end_time_s(&self) -> i64 {
        self.end_time_s.load(Ordering::Acquire)
    }

    #[inline]
    pub fn update_every_s(&self) -> u32 {
        self.update_every_s.load(Ordering::Relaxed)
    }

    /// The user payload. The cache treats it opaquely.
    #[inline]
    pub fn data(&self) -> &D {
        &self.data
    }

    /// Read access to the fixed-length custom data tail.
    #[inline]
    pub fn custom_data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.custom_data.read()
    }

    /// In-place write access to the custom data tail.
    #[inline]
    pub fn custom_data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.custom_data.write()
    }

    #[inline]
    pub fn is_hot(&self) -> bool {
        self.flags.state() == PAGE_HOT
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.flags.state() == PAGE_DIRTY
    }

    #[inline]
    pub fn is_clean(&self) -> bool {
        self.flags.state() == PAGE_CLEAN
    }

    /// Set the end time only when it is still unset; returns the value in
    /// effect afterwards.
    #[inline]
    pub fn fix_end_time_s(&self, end_time_s: i64) -> i64 {
        let _ = self.end_time_s.compare_exchange(
            0,
            end_time_s,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.end_time_s()
    }

    /// Set the update-every only if currently zero; returns the value in
    /// effect afterwards.
    #[inline]
    pub fn fix_update_every_s(&self, update_every_s: u32) -> u32 {
        let _ = self.update_every_s.compare_exchange(
            0,
            update_every_s,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        self.update_every_s()
    }

    #[inline]
    pub(crate) fn store_end_time_s(&self, end_time_s: i64) {
        self.end_time_s.store(end_time_s, Ordering::Release);
    }

    #[inline]
    pub(crate) fn assumed_size(&self) -> i64 {
        self.assumed_size.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_assumed_size(&self, size: i64) {
        self.assumed_size.store(size, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn accesses(&self) -> u16 {
        self.accesses.load(Ordering::Relaxed)
    }

    /// Saturating access-counter bump.
    #[inline]
    pub(crate) fn count_access(&self) {
        let _ = self
            .accesses
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |a| {
                a.checked_add(1)
            });
    }

    #[inline]
    pub(crate) fn reset_accesses(&self) {
        self.accesses.store(0, Ordering::Release);
    }

    #[inline]
    pub(crate) fn queue_key(&self) -> i64 {
        self.queue_key.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_queue_key(&self, key: i64) {
        self.queue_key.store(key, Ordering::Relaxed);
    }

    /// Tear the page apart once it is exclusively owned, yielding the
    /// payload and the custom data for the free callback.
    pub(crate) fn into_parts(self) -> (D, Box<[u8]>) {
        (self.data, self.custom_data.into_inner())
    }
}

// ============================================================================
// Entry and Callback Descriptors
// ============================================================================

/// Description of a page to be added to the cache.
pub struct PageEntry<D> {
    pub section: SectionId,
    pub metric_id: MetricId,
    pub start_time_s: i64,
    pub end_time_s: i64,
    pub update_every_s: u32,
    /// Size in bytes of the payload, outside the cache.
    pub size: usize,
    /// True when the page is currently being collected.
    pub hot: bool,
    /// Initial contents for the custom data tail; zero-filled when None.
    pub custom_data: Option<Vec<u8>>,
    pub data: D,
}

/// Owned snapshot of a page's metadata, passed to callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDescriptor {
    pub section: SectionId,
    pub metric_id: MetricId,
    pub start_time_s: i64,
    pub end_time_s: i64,
    pub update_every_s: u32,
    pub size: usize,
    pub hot: bool,
}

/// Everything handed back to the user when a clean page is freed.
pub struct FreedPage<D> {
    pub descriptor: PageDescriptor,
    pub data: D,
    pub custom_data: Box<[u8]>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_page() -> Page<()> {
        Page::new(1, 10, 100, 200, 1, 4096, 1, Box::from([0u8; 4]), ())
    }

    #[test]
    fn test_flags_state_exclusive() {
        let page = test_page();
        assert_eq!(page.flags.state(), 0);

        page.flags.set(PAGE_HOT);
        assert!(page.is_hot());
        assert!(!page.is_dirty());
        assert!(!page.is_clean());

        page.flags.clear(PAGE_HOT);
        page.flags.set(PAGE_CLEAN);
        assert!(page.is_clean());
    }

    #[test]
    fn test_fix_update_every_only_when_zero() {
        let page = Page::new(1, 10, 100, 200, 0, 4096, 1, Box::from([]), ());
        assert_eq!(page.fix_update_every_s(5), 5);
        assert_eq!(page.fix_update_every_s(9), 5);
    }

    #[test]
    fn test_access_counter_saturates() {
        let page = test_page();
        for _ in 0..u16::MAX as u32 + 10 {
            page.count_access();
        }
        assert_eq!(page.accesses(), u16::MAX);
    }

    #[test]
    fn test_custom_data_in_place_overwrite() {
        let page = Page::new(1, 10, 100, 200, 1, 4096, 0, Box::from(*b"0123456789\0"), ());
        assert_eq!(&page.custom_data()[..10], b"0123456789");

        page.custom_data_mut().copy_from_slice(b"ABCDEFGHIJ\0");
        assert_eq!(&page.custom_data()[..10], b"ABCDEFGHIJ");
    }

    #[test]
    fn test_transition_lock() {
        let lock = TransitionLock::new();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        lock.unlock();
        lock.lock();
        lock.unlock();
    }
}
