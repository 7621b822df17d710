// # Page Queues
//
// Two queue shapes back the page lifecycle:
//
// - HOT and DIRTY group pages per section, in insertion order. This is a
//   FIFO of in-flight data, not an LRU.
// - CLEAN is a single cache-wide LRU list. The head holds the next
//   eviction candidates, the tail the most recently used pages.
//
// Both are ordered maps keyed by monotonically assigned positions; a page
// remembers its current key so it can be unlinked in O(log n). Queue
// mutations happen under the queue's wait-priority lock. When two queue
// locks are held at once, they are acquired in the order HOT, DIRTY,
// CLEAN.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use crate::cache::page::{
    Page, SectionId, TransitionLock, PAGE_HAS_BEEN_ACCESSED, PAGE_IGNORE_ACCESSES,
};
use crate::cache::stats::QueueStats;
use crate::cache::waitq::{LockPriority, WaitQueue, WaitQueueGuard};

// ============================================================================
// Section Queues (HOT, DIRTY)
// ============================================================================

/// The pages of one section, in insertion order.
pub(crate) struct SectionPages<D> {
    pub entries: usize,
    pub size: i64,
    pub pages: BTreeMap<i64, Arc<Page<D>>>,
    /// Exclusion between concurrent migration scans of this section.
    pub migration: TransitionLock,
}

impl<D> SectionPages<D> {
    fn new() -> Self {
        Self {
            entries: 0,
            size: 0,
            pages: BTreeMap::new(),
            migration: TransitionLock::new(),
        }
    }
}

pub(crate) struct SectionQueueInner<D> {
    pub sections: BTreeMap<SectionId, SectionPages<D>>,
    pub version: u64,
    pub last_version_checked: u64,
    next_key: i64,
}

impl<D> SectionQueueInner<D> {
    /// First page of `section` with queue key greater than `after`.
    pub fn next_page(
        &self,
        section: SectionId,
        after: Option<i64>,
    ) -> Option<(i64, Arc<Page<D>>)> {
        let sp = self.sections.get(&section)?;
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        sp.pages
            .range((lower, Bound::Unbounded))
            .next()
            .map(|(k, p)| (*k, Arc::clone(p)))
    }

    /// First section id greater than `after` (or the smallest one).
    pub fn next_section(&self, after: Option<SectionId>) -> Option<SectionId> {
        let lower = match after {
            Some(s) => Bound::Excluded(s),
            None => Bound::Unbounded,
        };
        self.sections
            .range((lower, Bound::Unbounded))
            .next()
            .map(|(s, _)| *s)
    }
}

/// A queue of per-section page lists (the HOT and DIRTY shapes).
pub(crate) struct SectionQueue<D> {
    lock: WaitQueue<SectionQueueInner<D>>,
    pub stats: QueueStats,
    state_flag: u8,
    /// Insertions per section between version bumps.
    version_batch: usize,
}

impl<D> SectionQueue<D> {
    pub fn new(state_flag: u8, version_batch: usize) -> Self {
        Self {
            lock: WaitQueue::new(SectionQueueInner {
                sections: BTreeMap::new(),
                version: 0,
                last_version_checked: 0,
                next_key: 0,
            }),
            stats: QueueStats::new(),
            state_flag,
            version_batch: version_batch.max(1),
        }
    }

    #[inline]
    pub fn lock(&self, prio: LockPriority) -> WaitQueueGuard<'_, SectionQueueInner<D>> {
        self.lock.lock(prio)
    }

    #[inline]
    pub fn try_lock(&self, prio: LockPriority) -> Option<WaitQueueGuard<'_, SectionQueueInner<D>>> {
        self.lock.try_lock(prio)
    }

    /// Link a page at the tail of its section. The caller holds the queue
    /// lock; the page must carry no state flag yet.
    pub fn add_locked(
        &self,
        inner: &mut SectionQueueInner<D>,
        page: &Arc<Page<D>>,
        nominal_size: u64,
    ) {
        debug_assert_eq!(
            page.flags.state(),
            0,
            "page already carries a state flag while being queued"
        );

        let key = inner.next_key;
        inner.next_key += 1;

        let sp = inner
            .sections
            .entry(page.section())
            .or_insert_with(SectionPages::new);
        sp.entries += 1;
        sp.size += page.assumed_size();
        sp.pages.insert(key, Arc::clone(page));
        page.set_queue_key(key);

        if sp.entries % self.version_batch == 0 {
            inner.version += 1;
        }

        page.flags.set(self.state_flag);
        self.stats.on_add(page.assumed_size(), nominal_size);
    }

    /// Unlink a page from its section, dropping the section record when it
    /// empties. The caller holds the queue lock.
    pub fn del_locked(
        &self,
        inner: &mut SectionQueueInner<D>,
        page: &Arc<Page<D>>,
        nominal_size: u64,
    ) {
        debug_assert_eq!(
            page.flags.state(),
            self.state_flag,
            "page is not in the queue it is being removed from"
        );

        page.flags.clear(self.state_flag);

        let section = page.section();
        let sp = inner
            .sections
            .get_mut(&section)
            .expect("section of a queued page is missing from its queue");

        let removed = sp.pages.remove(&page.queue_key());
        debug_assert!(
            removed.map_or(false, |p| Arc::ptr_eq(&p, page)),
            "page is not linked where its queue key points"
        );

        sp.entries -= 1;
        sp.size -= page.assumed_size();
        if sp.pages.is_empty() {
            inner.sections.remove(&section);
        }

        self.stats.on_del(page.assumed_size(), nominal_size);
    }
}

// ============================================================================
// Clean Queue (LRU)
// ============================================================================

pub(crate) struct CleanQueueInner<D> {
    pub pages: BTreeMap<i64, Arc<Page<D>>>,
    pub version: u64,
    head_key: i64,
    tail_key: i64,
}

impl<D> CleanQueueInner<D> {
    /// First page with queue key greater than `after`.
    pub fn next_page(&self, after: Option<i64>) -> Option<(i64, Arc<Page<D>>)> {
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        self.pages
            .range((lower, Bound::Unbounded))
            .next()
            .map(|(k, p)| (*k, Arc::clone(p)))
    }

    fn append_key(&mut self) -> i64 {
        self.tail_key += 1;
        self.tail_key
    }

    fn prepend_key(&mut self) -> i64 {
        self.head_key -= 1;
        self.head_key
    }

    /// Relink an already-linked page at the tail, returning its new key.
    /// No-op (returning None) when the page is not linked here, which can
    /// happen when it transitioned away while the caller waited for the
    /// lock.
    pub fn relink_at_tail(&mut self, page: &Arc<Page<D>>) -> Option<i64> {
        let key = page.queue_key();
        match self.pages.get(&key) {
            Some(linked) if Arc::ptr_eq(linked, page) => {}
            _ => return None,
        }

        self.pages.remove(&key);
        let new_key = self.append_key();
        self.pages.insert(new_key, Arc::clone(page));
        page.set_queue_key(new_key);
        self.version += 1;
        Some(new_key)
    }
}

/// The cache-wide LRU of durable pages whose memory may be reclaimed.
pub(crate) struct CleanQueue<D> {
    lock: WaitQueue<CleanQueueInner<D>>,
    pub stats: QueueStats,
    state_flag: u8,
}

impl<D> CleanQueue<D> {
    pub fn new(state_flag: u8) -> Self {
        Self {
            lock: WaitQueue::new(CleanQueueInner {
                pages: BTreeMap::new(),
                version: 0,
                head_key: 0,
                tail_key: 0,
            }),
            stats: QueueStats::new(),
            state_flag,
        }
    }

    #[inline]
    pub fn lock(&self, prio: LockPriority) -> WaitQueueGuard<'_, CleanQueueInner<D>> {
        self.lock.lock(prio)
    }

    #[inline]
    pub fn try_lock(&self, prio: LockPriority) -> Option<WaitQueueGuard<'_, CleanQueueInner<D>>> {
        self.lock.try_lock(prio)
    }

    /// Link a page into the LRU.
    ///
    /// Pages that have been accessed go to the tail (most recently used);
    /// untouched pages are prepended so they become the next eviction
    /// candidates.
    pub fn add_locked(
        &self,
        inner: &mut CleanQueueInner<D>,
        page: &Arc<Page<D>>,
        nominal_size: u64,
    ) {
        debug_assert_eq!(
            page.flags.state(),
            0,
            "page already carries a state flag while being queued"
        );

        let accessed = page.flags.check(PAGE_HAS_BEEN_ACCESSED | PAGE_IGNORE_ACCESSES)
            == PAGE_HAS_BEEN_ACCESSED;

        let key = if page.accesses() > 0 || accessed {
            page.flags.clear(PAGE_HAS_BEEN_ACCESSED);
            inner.append_key()
        } else {
            inner.prepend_key()
        };

        inner.pages.insert(key, Arc::clone(page));
        page.set_queue_key(key);
        inner.version += 1;

        page.flags.set(self.state_flag);
        self.stats.on_add(page.assumed_size(), nominal_size);
    }

    /// Unlink a page from the LRU. The caller holds the queue lock.
    pub fn del_locked(
        &self,
        inner: &mut CleanQueueInner<D>,
        page: &Arc<Page<D>>,
        nominal_size: u64,
    ) {
        debug_assert_eq!(
            page.flags.state(),
            self.state_flag,
            "page is not in the queue it is being removed from"
        );

        page.flags.clear(self.state_flag);

        let removed = inner.pages.remove(&page.queue_key());
        debug_assert!(
            removed.map_or(false, |p| Arc::ptr_eq(&p, page)),
            "page is not linked where its queue key points"
        );
        inner.version += 1;

        self.stats.on_del(page.assumed_size(), nominal_size);
    }
}
