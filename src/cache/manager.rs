// # Page Cache Core
//
// The cache couples the sharded index, the three queues, the statistics
// block and the callback set, and implements the page state machine on
// top of them:
//
// ```text
//   entry      |      entry
//     v               v
//    HOT -> DIRTY --> CLEAN --> evicted
//                 v    |     v
//               flush  |   evict
//                 v    |     v
//               save   |   free
//             callback | callback
// ```
//
// ## Locking discipline
//
// - Queue locks, when two are held at once, are acquired in the order
//   HOT, DIRTY, CLEAN.
// - A thread holding a queue lock never blocks on a page's transition
//   lock; it only try-locks it and backs off (releasing the queue lock)
//   on failure.
// - A thread holding a transition lock may block on queue locks.
//
// Together these rules keep the lock graph acyclic; the flush and
// migration engines rely on the third rule to carry transition locks
// across their callbacks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cache::config::{CacheConfig, PageCacheBuilder};
use crate::cache::evict::evictor_main;
use crate::cache::index::{InsertResult, PageIndex, SearchMethod};
use crate::cache::page::{
    FreedPage, MetricId, Page, PageEntry, SectionId, PAGE_BEING_DELETED, PAGE_BEING_MIGRATED,
    PAGE_CLEAN, PAGE_DIRTY, PAGE_HAS_BEEN_ACCESSED, PAGE_HOT, PAGE_IGNORE_ACCESSES,
};
use crate::cache::queue::{CleanQueue, SectionQueue, SectionQueueInner};
use crate::cache::sizing::UsageTracker;
use crate::cache::stats::{CacheStatistics, CacheStats};
use crate::cache::waitq::LockPriority;
use crate::error::{CacheError, Result};

/// Pause between retries when a page under contention has to settle.
const RETRY_SLEEP: Duration = Duration::from_micros(50);

/// Result of a [`PageCache::migrate_hot_pages`] scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOutcome {
    /// Pages that were tagged and offered to the callback.
    pub pages: usize,
    /// Whether the callback accepted the set (pages became clean).
    pub success: bool,
    /// Another migration scan of the section was already running.
    pub postponed: bool,
}

// ============================================================================
// Shared State
// ============================================================================

pub(crate) struct PageCacheInner<D> {
    pub(crate) config: CacheConfig<D>,
    pub(crate) index: PageIndex<D>,
    pub(crate) hot: SectionQueue<D>,
    pub(crate) dirty: SectionQueue<D>,
    pub(crate) clean: CleanQueue<D>,
    pub(crate) stats: CacheStats,
    pub(crate) usage: UsageTracker,
    pub(crate) save_enabled: AtomicBool,
    pub(crate) evictor_signal: crossbeam::channel::Sender<()>,
    pub(crate) evictor_cancel: AtomicBool,
    destroyed: AtomicBool,
    evictor_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Send + Sync + 'static> PageCacheInner<D> {
    // ------------------------------------------------------------------
    // referencing

    #[inline]
    fn referenced_add(&self, assumed_size: i64) {
        self.stats.referenced_entries.fetch_add(1, Ordering::Relaxed);
        self.stats
            .referenced_size
            .fetch_add(assumed_size, Ordering::Relaxed);
    }

    #[inline]
    fn referenced_sub(&self, assumed_size: i64) {
        self.stats.referenced_entries.fetch_sub(1, Ordering::Relaxed);
        self.stats
            .referenced_size
            .fetch_sub(assumed_size, Ordering::Relaxed);
    }

    /// Take a reference on a page. The caller must either already hold a
    /// reference, or hold the lock of the queue (or index partition) the
    /// page is linked in; nothing else keeps the page from vanishing.
    #[inline]
    pub(crate) fn page_acquire(&self, page: &Arc<Page<D>>) -> bool {
        match page.refcount.acquire() {
            Some(count) => {
                self.stats.acquires.fetch_add(1, Ordering::Relaxed);
                if count == 1 {
                    self.referenced_add(page.assumed_size());
                }
                true
            }
            None => false,
        }
    }

    #[inline]
    pub(crate) fn page_release(&self, page: &Arc<Page<D>>, evict_if_necessary: bool) {
        self.stats.releases.fetch_add(1, Ordering::Relaxed);

        // take the size before dropping the reference
        let assumed_size = page.assumed_size();

        if page.refcount.release() == 0 {
            self.referenced_sub(assumed_size);

            if evict_if_necessary {
                self.evict_inline(true);
            }
        }
    }

    fn page_dup(&self, page: &Arc<Page<D>>) {
        if !self.page_acquire(page) {
            panic!(
                "CACHE {}: tried to dup a page that is not acquired",
                self.config.name
            );
        }
    }

    /// Claim an unreferenced page for deletion. The caller holds the
    /// clean queue lock, which is what makes refcount zero stable.
    pub(crate) fn page_try_deletion_clean_locked(&self, page: &Arc<Page<D>>) -> bool {
        self.stats
            .acquires_for_deletion
            .fetch_add(1, Ordering::Relaxed);

        debug_assert!(page.is_clean(), "only clean pages can be deleted");

        if page.refcount.acquire_for_deletion() {
            debug_assert_eq!(
                page.flags.check(PAGE_BEING_DELETED),
                0,
                "page is already being deleted"
            );
            page.flags.set(PAGE_BEING_DELETED);
            return true;
        }

        false
    }

    /// Drop the caller's reference and, if it was the last one, claim the
    /// page for deletion in the same step.
    fn acquired_page_deletion_or_release(&self, page: &Arc<Page<D>>) -> bool {
        self.stats
            .acquires_for_deletion
            .fetch_add(1, Ordering::Relaxed);
        self.stats.releases.fetch_add(1, Ordering::Relaxed);

        let assumed_size = page.assumed_size();

        if page.refcount.release_and_acquire_for_deletion() {
            self.referenced_sub(assumed_size);

            debug_assert_eq!(
                page.flags.check(PAGE_BEING_DELETED),
                0,
                "page is already being deleted"
            );
            page.flags.set(PAGE_BEING_DELETED);
            return true;
        }

        false
    }

    // ------------------------------------------------------------------
    // state transitions

    /// Link a freshly created page that is in the index but not yet in
    /// any queue.
    fn page_link_initial(&self, page: &Arc<Page<D>>, hot: bool) {
        page.transition.lock();
        if hot {
            let mut hot_guard = self.hot.lock(LockPriority::Collectors);
            self.hot
                .add_locked(&mut hot_guard, page, self.config.nominal_size(page));
        } else {
            let mut clean_guard = self.clean.lock(LockPriority::Evictors);
            self.clean
                .add_locked(&mut clean_guard, page, self.config.nominal_size(page));
        }
        page.transition.unlock();
    }

    /// HOT to DIRTY, standalone entry point.
    ///
    /// The hot queue lock comes first; bulk converters walk entire
    /// sections holding it, so taking the transition lock first would
    /// deadlock against them.
    pub(crate) fn page_set_dirty(&self, page: &Arc<Page<D>>, prio: LockPriority) {
        loop {
            let mut hot_guard = self.hot.lock(prio);
            if page.transition.try_lock() {
                self.page_set_dirty_locked(page, &mut hot_guard, prio);
                return;
            }

            // the transition holder may need the hot lock to finish
            drop(hot_guard);
            std::thread::sleep(RETRY_SLEEP);
        }
    }

    /// HOT to DIRTY with the hot queue lock and the page's transition
    /// lock already held. Releases the transition lock, leaves the hot
    /// lock to the caller.
    pub(crate) fn page_set_dirty_locked(
        &self,
        page: &Arc<Page<D>>,
        hot_inner: &mut SectionQueueInner<D>,
        prio: LockPriority,
    ) {
        let flags = page.flags.state();

        if flags & PAGE_DIRTY != 0 {
            page.transition.unlock();
            return;
        }

        debug_assert_eq!(flags & PAGE_CLEAN, 0, "a clean page cannot become dirty");

        self.stats.hot2dirty_entries.fetch_add(1, Ordering::Relaxed);
        self.stats
            .hot2dirty_size
            .fetch_add(page.assumed_size(), Ordering::Relaxed);

        if flags & PAGE_HOT != 0 {
            self.hot
                .del_locked(hot_inner, page, self.config.nominal_size(page));
        }

        if flags & PAGE_CLEAN != 0 {
            let mut clean_guard = self.clean.lock(prio);
            self.clean
                .del_locked(&mut clean_guard, page, self.config.nominal_size(page));
        }

        {
            let mut dirty_guard = self.dirty.lock(prio);
            self.dirty
                .add_locked(&mut dirty_guard, page, self.config.nominal_size(page));
        }

        self.stats.hot2dirty_entries.fetch_sub(1, Ordering::Relaxed);
        self.stats
            .hot2dirty_size
            .fetch_sub(page.assumed_size(), Ordering::Relaxed);

        page.transition.unlock();
    }

    /// Any state to CLEAN with the page's transition lock already held
    /// (flush and migration carry it across their callbacks). The
    /// transition lock stays held.
    pub(crate) fn page_set_clean(&self, page: &Arc<Page<D>>, prio: LockPriority) {
        let flags = page.flags.state();

        if flags & PAGE_CLEAN != 0 {
            return;
        }

        if flags & PAGE_HOT != 0 {
            let mut hot_guard = self.hot.lock(prio);
            self.hot
                .del_locked(&mut hot_guard, page, self.config.nominal_size(page));
        }

        if flags & PAGE_DIRTY != 0 {
            let mut dirty_guard = self.dirty.lock(prio);
            self.dirty
                .del_locked(&mut dirty_guard, page, self.config.nominal_size(page));
        }

        let mut clean_guard = self.clean.lock(prio);
        self.clean
            .add_locked(&mut clean_guard, page, self.config.nominal_size(page));
    }

    /// Any state to CLEAN for a caller holding only a page reference.
    fn page_make_clean(&self, page: &Arc<Page<D>>, prio: LockPriority) {
        loop {
            let flags = page.flags.state();

            if flags & PAGE_CLEAN != 0 {
                return;
            }

            if flags & PAGE_HOT != 0 {
                let mut hot_guard = self.hot.lock(prio);
                if !page.transition.try_lock() {
                    drop(hot_guard);
                    std::thread::sleep(RETRY_SLEEP);
                    continue;
                }
                if page.flags.state() & PAGE_HOT == 0 {
                    // moved on while we were locking; reassess
                    page.transition.unlock();
                    continue;
                }
                self.hot
                    .del_locked(&mut hot_guard, page, self.config.nominal_size(page));
                drop(hot_guard);
            } else if flags & PAGE_DIRTY != 0 {
                let mut dirty_guard = self.dirty.lock(prio);
                if !page.transition.try_lock() {
                    drop(dirty_guard);
                    std::thread::sleep(RETRY_SLEEP);
                    continue;
                }
                if page.flags.state() & PAGE_DIRTY == 0 {
                    page.transition.unlock();
                    continue;
                }
                self.dirty
                    .del_locked(&mut dirty_guard, page, self.config.nominal_size(page));
                drop(dirty_guard);
            } else {
                // mid-transition on another thread; it holds a reference,
                // so it will finish
                std::thread::sleep(RETRY_SLEEP);
                continue;
            }

            let mut clean_guard = self.clean.lock(prio);
            self.clean
                .add_locked(&mut clean_guard, page, self.config.nominal_size(page));
            drop(clean_guard);
            page.transition.unlock();
            return;
        }
    }

    // ------------------------------------------------------------------
    // add / lookup

    pub(crate) fn add_page(&self, entry: PageEntry<D>) -> (Arc<Page<D>>, bool) {
        debug_assert!(
            entry.start_time_s >= 0 && entry.end_time_s >= 0,
            "page timestamps are negative"
        );

        self.stats.workers_add.fetch_add(1, Ordering::Relaxed);

        let mut custom_data = vec![0u8; self.config.additional_bytes_per_page];
        if let Some(source) = &entry.custom_data {
            let len = source.len().min(custom_data.len());
            custom_data[..len].copy_from_slice(&source[..len]);
        }

        let hot = entry.hot;
        let mut allocation = Some(Arc::new(Page::new(
            entry.section,
            entry.metric_id,
            entry.start_time_s.max(0),
            entry.end_time_s.max(0),
            entry.update_every_s,
            self.config.assumed_size(entry.size),
            if hot { 0 } else { 1 },
            custom_data.into_boxed_slice(),
            entry.data,
        )));

        let mut spins = 0usize;
        let (page, added) = loop {
            spins += 1;

            let candidate = allocation.as_ref().unwrap();
            match self
                .index
                .insert_or_acquire(candidate, |existing| self.page_acquire(existing))
            {
                InsertResult::Inserted => {
                    let page = allocation.take().unwrap();

                    self.page_link_initial(&page, hot);

                    // the creation reference pairs with its eventual release
                    self.stats.acquires.fetch_add(1, Ordering::Relaxed);
                    self.referenced_add(page.assumed_size());

                    self.stats.added_entries.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .added_size
                        .fetch_add(page.assumed_size(), Ordering::Relaxed);
                    self.stats.entries.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .size
                        .fetch_add(page.assumed_size(), Ordering::Relaxed);

                    break (page, true);
                }
                InsertResult::Found(existing) => break (existing, false),
                InsertResult::Retry => {
                    // a page with this identity is on its way out; give
                    // it some time to go away
                    std::thread::sleep(RETRY_SLEEP);
                }
            }
        };

        if spins > 1 {
            self.stats
                .waste_insert_spins
                .fetch_add(spins as u64 - 1, Ordering::Relaxed);
        }

        // an unused allocation drops here, returning the payload

        self.stats.workers_add.fetch_sub(1, Ordering::Relaxed);

        if !hot {
            self.evict_inline(false);
        }
        self.flush_inline(false);

        (page, added)
    }

    pub(crate) fn get_page(
        &self,
        section: SectionId,
        metric_id: MetricId,
        start_time_s: i64,
        method: SearchMethod,
    ) -> Option<Arc<Page<D>>> {
        self.stats.workers_search.fetch_add(1, Ordering::Relaxed);

        let (searches, hits, misses) = if method == SearchMethod::Closest {
            (
                &self.stats.searches_closest,
                &self.stats.searches_closest_hits,
                &self.stats.searches_closest_misses,
            )
        } else {
            (
                &self.stats.searches_exact,
                &self.stats.searches_exact_hits,
                &self.stats.searches_exact_misses,
            )
        };
        searches.fetch_add(1, Ordering::Relaxed);

        let page =
            self.index
                .find_and_acquire(section, metric_id, start_time_s, method, |candidate| {
                    self.page_acquire(candidate)
                });

        match &page {
            Some(page) => {
                hits.fetch_add(1, Ordering::Relaxed);
                self.page_has_been_accessed(page);
            }
            None => {
                misses.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.stats.workers_search.fetch_sub(1, Ordering::Relaxed);
        page
    }

    /// LRU feedback: bump the access counter and try to move a clean page
    /// to the tail; when the lock is busy, leave a note for the eviction
    /// scanner instead.
    fn page_has_been_accessed(&self, page: &Arc<Page<D>>) {
        let flags = page.flags.check(PAGE_CLEAN | PAGE_IGNORE_ACCESSES);

        if flags & PAGE_IGNORE_ACCESSES != 0 {
            return;
        }

        page.count_access();

        if flags & PAGE_CLEAN != 0 {
            match self.clean.try_lock(LockPriority::Evictors) {
                Some(mut clean_guard) => {
                    clean_guard.relink_at_tail(page);
                    drop(clean_guard);
                    page.flags.clear(PAGE_HAS_BEEN_ACCESSED);
                }
                None => {
                    page.flags.set(PAGE_HAS_BEEN_ACCESSED);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // acquired-page mutators

    pub(crate) fn hot_set_end_time(
        &self,
        page: &Arc<Page<D>>,
        end_time_s: i64,
        additional_bytes: usize,
    ) {
        debug_assert!(page.is_hot(), "end time update on a non-hot page");
        debug_assert!(
            end_time_s >= page.end_time_s(),
            "end time is not bigger than the existing one"
        );

        page.store_end_time_s(end_time_s);

        if additional_bytes == 0 {
            return;
        }

        // account the growth against whichever queue the page is in
        loop {
            let mut hot_guard = self.hot.lock(LockPriority::Collectors);
            if !page.transition.try_lock() {
                drop(hot_guard);
                std::thread::sleep(RETRY_SLEEP);
                continue;
            }

            let flags = page.flags.state();
            let old_assumed = page.assumed_size();
            let old_nominal = self.config.nominal_size(page);
            let new_assumed = self
                .config
                .assumed_size(self.config.size_from_assumed(old_assumed) + additional_bytes);
            let delta = new_assumed - old_assumed;

            let queue_stats = if flags & PAGE_HOT != 0 {
                if let Some(sp) = hot_guard.sections.get_mut(&page.section()) {
                    sp.size += delta;
                }
                Some(&self.hot.stats)
            } else if flags & PAGE_DIRTY != 0 {
                let mut dirty_guard = self.dirty.lock(LockPriority::Collectors);
                if let Some(sp) = dirty_guard.sections.get_mut(&page.section()) {
                    sp.size += delta;
                }
                Some(&self.dirty.stats)
            } else if flags & PAGE_CLEAN != 0 {
                Some(&self.clean.stats)
            } else {
                None
            };

            if let Some(queue_stats) = queue_stats {
                queue_stats.histogram.del(old_nominal);
            }

            page.set_assumed_size(new_assumed);

            self.stats.size.fetch_add(delta, Ordering::Relaxed);
            self.stats.added_size.fetch_add(delta, Ordering::Relaxed);
            self.stats
                .referenced_size
                .fetch_add(delta, Ordering::Relaxed);

            if let Some(queue_stats) = queue_stats {
                queue_stats.size.fetch_add(delta, Ordering::Relaxed);
                queue_stats.added_size.fetch_add(delta, Ordering::Relaxed);
                queue_stats.histogram.add(self.config.nominal_size(page));
            }

            page.transition.unlock();
            return;
        }
    }

    /// Turn an acquired page clean and, when no other reference exists,
    /// evict it on the spot.
    pub(crate) fn page_to_clean_evict_or_release(&self, page: Arc<Page<D>>) -> bool {
        self.stats.workers_hot2dirty.fetch_add(1, Ordering::Relaxed);

        // keep accesses from resurrecting it in the LRU
        page.flags.set(PAGE_IGNORE_ACCESSES);
        page.reset_accesses();

        // without accesses it is prepended, staying an eviction candidate
        self.page_make_clean(&page, LockPriority::Collectors);

        let evicted = {
            let mut clean_guard = self.clean.lock(LockPriority::Evictors);
            if self.acquired_page_deletion_or_release(&page) {
                self.clean
                    .del_locked(&mut clean_guard, &page, self.config.nominal_size(&page));
                true
            } else {
                false
            }
        };

        if evicted {
            self.index.remove(&page);
            self.free_this_page(page);
            self.stats
                .hot_empty_pages_evicted_immediately
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats
                .hot_empty_pages_evicted_later
                .fetch_add(1, Ordering::Relaxed);
        }

        self.stats.workers_hot2dirty.fetch_sub(1, Ordering::Relaxed);
        evicted
    }

    // ------------------------------------------------------------------
    // freeing

    /// Hand a fully unlinked, deletion-claimed page to the free callback.
    pub(crate) fn free_this_page(&self, page: Arc<Page<D>>) {
        let assumed_size = page.assumed_size();
        let descriptor = self.config.descriptor(&page);

        // a racing index reader may still hold a clone for the instant
        // between cloning the entry and failing its acquire
        let mut shared = page;
        let owned = loop {
            match Arc::try_unwrap(shared) {
                Ok(owned) => break owned,
                Err(still_shared) => {
                    shared = still_shared;
                    std::thread::yield_now();
                }
            }
        };

        let (data, custom_data) = owned.into_parts();
        (self.config.hooks.free_clean_page)(FreedPage {
            descriptor,
            data,
            custom_data,
        });

        self.stats.removed_entries.fetch_add(1, Ordering::Relaxed);
        self.stats
            .removed_size
            .fetch_add(assumed_size, Ordering::Relaxed);
        self.stats.entries.fetch_sub(1, Ordering::Relaxed);
        self.stats.size.fetch_sub(assumed_size, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // bulk conversions

    pub(crate) fn all_hot_pages_to_dirty(&self, section: Option<SectionId>) {
        let mut hot_guard = self.hot.lock(LockPriority::Collectors);

        let mut current = match section {
            Some(section) => Some(section),
            None => hot_guard.next_section(None),
        };

        while let Some(this_section) = current {
            let mut after: Option<i64> = None;

            loop {
                let Some((key, page)) = hot_guard.next_page(this_section, after) else {
                    break;
                };

                if !self.page_acquire(&page) {
                    after = Some(key);
                    continue;
                }

                if page.transition.try_lock() {
                    after = Some(key);
                    self.page_set_dirty_locked(&page, &mut hot_guard, LockPriority::Collectors);
                    self.page_release(&page, false);
                } else {
                    // the transition holder may need the hot lock; step
                    // aside and retry this position
                    self.page_release(&page, false);
                    drop(hot_guard);
                    std::thread::sleep(RETRY_SLEEP);
                    hot_guard = self.hot.lock(LockPriority::Collectors);
                }
            }

            current = match section {
                Some(_) => None,
                None => hot_guard.next_section(Some(this_section)),
            };
        }
    }

    // ------------------------------------------------------------------
    // migration

    pub(crate) fn migrate_hot_pages(
        &self,
        section: SectionId,
        select: &dyn Fn(&Page<D>) -> bool,
        build: &mut dyn FnMut(&[Arc<Page<D>>]) -> bool,
    ) -> MigrationOutcome {
        self.stats.workers_migrate.fetch_add(1, Ordering::Relaxed);

        let mut outcome = MigrationOutcome {
            pages: 0,
            success: false,
            postponed: false,
        };

        let mut hot_guard = self.hot.lock(LockPriority::Low);

        match hot_guard.sections.get(&section) {
            None => {
                drop(hot_guard);
                self.stats.workers_migrate.fetch_sub(1, Ordering::Relaxed);
                return outcome;
            }
            Some(sp) => {
                if !sp.migration.try_lock() {
                    log::info!(
                        "CACHE {}: migration scan of section {:#x} postponed, another one is already running",
                        self.config.name,
                        section
                    );
                    drop(hot_guard);
                    outcome.postponed = true;
                    self.stats.workers_migrate.fetch_sub(1, Ordering::Relaxed);
                    return outcome;
                }
            }
        }

        // phase one: tag and reference the selected pages, keeping their
        // transition locks, without hogging the hot queue
        let mut tagged: Vec<Arc<Page<D>>> = Vec::new();
        let mut after: Option<i64> = None;

        loop {
            let Some((key, page)) = hot_guard.next_page(section, after) else {
                break;
            };
            after = Some(key);

            if !select(&page) {
                continue;
            }

            if page.flags.check(PAGE_BEING_MIGRATED) != 0 {
                debug_assert!(false, "page has already been tagged for migration");
                continue;
            }

            if !page.transition.try_lock() {
                continue;
            }

            if !self.page_acquire(&page) {
                page.transition.unlock();
                continue;
            }

            page.flags.set(PAGE_BEING_MIGRATED);
            tagged.push(page);

            drop(hot_guard);
            std::thread::yield_now();
            hot_guard = self.hot.lock(LockPriority::Low);
        }

        if let Some(sp) = hot_guard.sections.get(&section) {
            sp.migration.unlock();
        }
        drop(hot_guard);

        // phase two: let the caller build its on-disk index, then settle
        // every tagged page according to the verdict
        let success = build(&tagged);

        outcome.pages = tagged.len();
        outcome.success = success;

        for page in tagged {
            if success {
                self.page_set_clean(&page, LockPriority::Low);
            } else {
                page.flags.clear(PAGE_BEING_MIGRATED);
            }

            page.transition.unlock();
            self.page_release(&page, success);
        }

        self.stats.workers_migrate.fetch_sub(1, Ordering::Relaxed);
        outcome
    }

    // ------------------------------------------------------------------
    // service

    #[inline]
    pub(crate) fn signal_evictor(&self) {
        let _ = self.evictor_signal.try_send(());
        self.stats
            .waste_evict_thread_signals
            .fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn evictor_cancelled(&self) -> bool {
        self.evictor_cancel.load(Ordering::Acquire)
    }

    fn shutdown(&self, flush: bool) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        if !flush {
            self.save_enabled.store(false, Ordering::Release);
        }

        self.all_hot_pages_to_dirty(None);
        self.flush_pages_impl(0, None, true, true);
        self.evict_pages_impl(0, 0, true, true, None);

        self.evictor_cancel.store(true, Ordering::Release);
        let _ = self.evictor_signal.try_send(());
        let thread = self.evictor_thread.lock().take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }

        let referenced = self.stats.referenced_entries.load(Ordering::Relaxed);
        if referenced > 0 {
            log::error!(
                "CACHE {}: there are {} referenced cache pages, leaving the cache allocated",
                self.config.name,
                referenced
            );
        }
    }
}

// ============================================================================
// Public Cache
// ============================================================================

/// A concurrent cache of fixed-identity time-series pages.
///
/// Pages transit HOT (being collected), DIRTY (awaiting save) and CLEAN
/// (reclaimable); eviction and flushing run inline on caller threads and
/// on a dedicated evictor thread, driven by the configured size targets.
pub struct PageCache<D: Send + Sync + 'static> {
    inner: Arc<PageCacheInner<D>>,
}

impl<D: Send + Sync + 'static> PageCacheBuilder<D> {
    pub fn build(self) -> Result<PageCache<D>> {
        PageCache::create(self.into_config()?)
    }
}

impl<D: Send + Sync + 'static> PageCache<D> {
    pub(crate) fn create(config: CacheConfig<D>) -> Result<Self> {
        let (signal_tx, signal_rx) = crossbeam::channel::bounded(1);

        let inner = Arc::new(PageCacheInner {
            index: PageIndex::new(config.partitions),
            hot: SectionQueue::new(PAGE_HOT, config.max_dirty_pages_per_call),
            dirty: SectionQueue::new(PAGE_DIRTY, config.max_dirty_pages_per_call),
            clean: CleanQueue::new(PAGE_CLEAN),
            stats: CacheStats::new(),
            usage: UsageTracker::new(),
            save_enabled: AtomicBool::new(true),
            evictor_signal: signal_tx,
            evictor_cancel: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            evictor_thread: Mutex::new(None),
            config,
        });

        let thread_cache = Arc::clone(&inner);
        let thread = std::thread::Builder::new()
            .name(format!("pgc-evictor-{}", inner.config.name))
            .spawn(move || evictor_main(thread_cache, signal_rx))
            .map_err(|e| {
                CacheError::Configuration(format!("cannot start the evictor thread: {e}"))
            })?;
        *inner.evictor_thread.lock() = Some(thread);

        Ok(Self { inner })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Insert a page, or return the already-cached page of the same
    /// identity with a fresh reference. The returned flag tells whether
    /// this call created the page; when it did not, the entry's payload
    /// is dropped.
    pub fn add_and_acquire(&self, entry: PageEntry<D>) -> (PageHandle<D>, bool) {
        let (page, added) = self.inner.add_page(entry);
        (PageHandle::new(Arc::clone(&self.inner), page), added)
    }

    /// Look up a page near `start_time_s` and acquire it.
    pub fn get_and_acquire(
        &self,
        section: SectionId,
        metric_id: MetricId,
        start_time_s: i64,
        method: SearchMethod,
    ) -> Option<PageHandle<D>> {
        self.inner
            .get_page(section, metric_id, start_time_s, method)
            .map(|page| PageHandle::new(Arc::clone(&self.inner), page))
    }

    /// Flush every dirty page of `section` (all sections when None),
    /// regardless of batch sizes.
    pub fn flush_dirty_pages(&self, section: Option<SectionId>) {
        self.inner.flush_pages_impl(0, section, true, true);
    }

    /// Convert the hot pages of `section` to dirty, then flush them all.
    pub fn flush_all_hot_and_dirty_pages(&self, section: Option<SectionId>) {
        self.inner.all_hot_pages_to_dirty(section);
        self.inner.flush_pages_impl(0, section, true, true);
    }

    /// One cooperative flush pass over full batches. Returns true when
    /// there is potentially more work to do.
    pub fn flush_pages(&self) -> bool {
        self.inner.flush_pages_impl(0, None, true, false)
    }

    /// One cooperative eviction pass. Returns true when there is
    /// potentially more work to do.
    pub fn evict_pages(&self, max_skip: usize, max_evict: usize) -> bool {
        let under_pressure = self.inner.cache_needs_space_aggressively();
        self.inner.evict_pages_impl(
            if under_pressure { 0 } else { max_skip },
            if under_pressure { 0 } else { max_evict },
            true,
            false,
            None,
        )
    }

    /// Evict every clean page nobody references.
    pub fn free_all_unreferenced_clean_pages(&self) {
        self.inner.evict_pages_impl(0, 0, true, true, None);
    }

    /// Evict every unreferenced clean page matching `filter` (e.g. all
    /// pages whose payload lives in a datafile being retired).
    pub fn evict_clean_pages_matching(&self, filter: impl Fn(&Page<D>) -> bool) {
        self.inner.evict_pages_impl(0, 0, true, true, Some(&filter));
    }

    pub fn count_clean_pages_matching(
        &self,
        section: SectionId,
        predicate: impl Fn(&D) -> bool,
    ) -> usize {
        let clean_guard = self.inner.clean.lock(LockPriority::Low);
        clean_guard
            .pages
            .values()
            .filter(|page| page.section() == section && predicate(page.data()))
            .count()
    }

    pub fn count_hot_pages_matching(
        &self,
        section: SectionId,
        predicate: impl Fn(&D) -> bool,
    ) -> usize {
        let hot_guard = self.inner.hot.lock(LockPriority::Low);
        hot_guard.sections.get(&section).map_or(0, |sp| {
            sp.pages
                .values()
                .filter(|page| predicate(page.data()))
                .count()
        })
    }

    /// Two-phase scan of a section's hot pages: pages accepted by
    /// `select` are tagged and referenced, `build` turns their metadata
    /// into an external index, and on success they become clean without
    /// passing through the dirty queue. On failure (or early exit) all
    /// tags and references are rolled back.
    pub fn migrate_hot_pages(
        &self,
        section: SectionId,
        select: impl Fn(&Page<D>) -> bool,
        mut build: impl FnMut(&[Arc<Page<D>>]) -> bool,
    ) -> MigrationOutcome {
        self.inner.migrate_hot_pages(section, &select, &mut build)
    }

    pub fn statistics(&self) -> CacheStatistics {
        let mut snapshot = self.inner.stats.snapshot();
        snapshot.hot = self.inner.hot.stats.snapshot();
        snapshot.dirty = self.inner.dirty.stats.snapshot();
        snapshot.clean = self.inner.clean.stats.snapshot();
        snapshot
    }

    pub fn current_cache_size(&self) -> i64 {
        self.inner.usage_per1000(None);
        self.inner.stats.current_cache_size.load(Ordering::Relaxed)
    }

    pub fn wanted_cache_size(&self) -> i64 {
        self.inner.usage_per1000(None);
        self.inner.stats.wanted_cache_size.load(Ordering::Relaxed)
    }

    /// Pages that still have to reach the clean state.
    pub fn hot_and_dirty_entries(&self) -> u64 {
        self.inner.hot.stats.entries.load(Ordering::Relaxed)
            + self.inner.dirty.stats.entries.load(Ordering::Relaxed)
            + self.inner.stats.flushing_entries.load(Ordering::Relaxed)
            + self.inner.stats.hot2dirty_entries.load(Ordering::Relaxed)
    }

    /// Restart the hot ceiling from the current hot volume and re-apply
    /// the sizing policy.
    pub fn reset_hot_max(&self) {
        let entries = self.inner.hot.stats.entries.load(Ordering::Relaxed);
        let size = self.inner.hot.stats.size.load(Ordering::Relaxed);
        self.inner
            .hot
            .stats
            .max_entries
            .store(entries, Ordering::Relaxed);
        self.inner.hot.stats.max_size.store(size, Ordering::Relaxed);

        let mut size_to_evict = 0i64;
        self.inner.usage_per1000(Some(&mut size_to_evict));
        self.inner.evict_pages_impl(0, 0, true, false, None);
    }

    /// Tear the cache down: convert and flush everything (unless `flush`
    /// is false, which drops the data), evict all unreferenced clean
    /// pages and stop the evictor thread. With outstanding references
    /// the shared state stays allocated and an error is logged.
    pub fn destroy(self, flush: bool) {
        self.inner.shutdown(flush);
    }
}

impl<D: Send + Sync + 'static> Drop for PageCache<D> {
    fn drop(&mut self) {
        self.inner.shutdown(true);
    }
}

// ============================================================================
// Page Handle
// ============================================================================

/// A counted reference to a cached page.
///
/// Dropping the handle releases the reference (and may trigger inline
/// eviction when the page is clean); the consuming methods drive the
/// producer-side state changes.
pub struct PageHandle<D: Send + Sync + 'static> {
    cache: Arc<PageCacheInner<D>>,
    page: Arc<Page<D>>,
}

impl<D: Send + Sync + 'static> PageHandle<D> {
    fn new(cache: Arc<PageCacheInner<D>>, page: Arc<Page<D>>) -> Self {
        Self { cache, page }
    }

    /// Another reference to the same page.
    pub fn dup(&self) -> Self {
        self.cache.page_dup(&self.page);
        Self {
            cache: Arc::clone(&self.cache),
            page: Arc::clone(&self.page),
        }
    }

    /// Explicit form of drop.
    pub fn release(self) {}

    /// Grow a hot page: raise its end time and account `additional_bytes`
    /// more payload.
    pub fn hot_set_end_time_s(&self, end_time_s: i64, additional_bytes: usize) {
        self.cache
            .hot_set_end_time(&self.page, end_time_s, additional_bytes);
    }

    /// Close the page for collection and release it, optionally helping
    /// with flushing when it is falling behind.
    pub fn hot_to_dirty_and_release(self, never_flush: bool) {
        let cache = Arc::clone(&self.cache);
        let page = Arc::clone(&self.page);
        std::mem::forget(self);

        cache.stats.workers_hot2dirty.fetch_add(1, Ordering::Relaxed);

        cache.page_set_dirty(&page, LockPriority::Collectors);
        cache.page_release(&page, true);

        cache.stats.workers_hot2dirty.fetch_sub(1, Ordering::Relaxed);

        if !never_flush {
            cache.flush_inline(true);
        }
    }

    /// Discard a page without saving it: make it clean, and evict it
    /// immediately when no other reference exists. Returns whether the
    /// page is gone.
    pub fn to_clean_evict_or_release(self) -> bool {
        let cache = Arc::clone(&self.cache);
        let page = Arc::clone(&self.page);
        std::mem::forget(self);

        cache.page_to_clean_evict_or_release(page)
    }
}

impl<D: Send + Sync + 'static> std::ops::Deref for PageHandle<D> {
    type Target = Page<D>;

    #[inline]
    fn deref(&self) -> &Page<D> {
        &self.page
    }
}

impl<D: Send + Sync + 'static> Drop for PageHandle<D> {
    fn drop(&mut self) {
        self.cache
            .page_release(&self.page, self.page.is_clean());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::config::CacheOptions;
    use crate::cache::page::PageDescriptor;
    use std::sync::Mutex as StdMutex;

    fn entry(section: SectionId, metric: MetricId, start: i64, hot: bool) -> PageEntry<u32> {
        PageEntry {
            section,
            metric_id: metric,
            start_time_s: start,
            end_time_s: start + 100,
            update_every_s: 1,
            size: 4096,
            hot,
            custom_data: None,
            data: 0,
        }
    }

    fn small_cache() -> PageCache<u32> {
        PageCacheBuilder::new("test")
            .clean_size_bytes(32 * 1024 * 1024)
            .max_dirty_pages_per_flush(10)
            .partitions(4)
            .free_clean_page(|_| {})
            .save_dirty(|_, _| {})
            .build()
            .unwrap()
    }

    #[test]
    fn test_add_get_release() {
        let cache = small_cache();

        let (page, added) = cache.add_and_acquire(entry(1, 10, 100, false));
        assert!(added);
        assert!(page.is_clean());
        assert_eq!(page.start_time_s(), 100);
        drop(page);

        let found = cache
            .get_and_acquire(1, 10, 100, SearchMethod::Exact)
            .expect("page should be in the cache");
        assert_eq!(found.end_time_s(), 200);
    }

    #[test]
    fn test_add_twice_returns_existing() {
        let cache = small_cache();

        let (first, added_first) = cache.add_and_acquire(entry(1, 10, 100, false));
        let (second, added_second) = cache.add_and_acquire(entry(1, 10, 100, false));

        assert!(added_first);
        assert!(!added_second);
        assert_eq!(cache.statistics().entries, 1);

        drop(first);
        drop(second);
    }

    #[test]
    fn test_hot_page_lifecycle() {
        let saved: Arc<StdMutex<Vec<PageDescriptor>>> = Arc::new(StdMutex::new(Vec::new()));
        let saved_cb = Arc::clone(&saved);

        let cache: PageCache<u32> = PageCacheBuilder::new("test")
            .max_dirty_pages_per_flush(10)
            .partitions(4)
            .free_clean_page(|_| {})
            .save_dirty(move |descriptors, _pages| {
                saved_cb.lock().unwrap().extend_from_slice(descriptors);
            })
            .build()
            .unwrap();

        let (page, added) = cache.add_and_acquire(entry(1, 10, 1000, true));
        assert!(added);
        assert!(page.is_hot());

        page.hot_set_end_time_s(1200, 0);
        page.hot_to_dirty_and_release(true);

        cache.flush_all_hot_and_dirty_pages(None);

        let saved = saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].start_time_s, 1000);
        assert_eq!(saved[0].end_time_s, 1200);

        let page = cache
            .get_and_acquire(1, 10, 1000, SearchMethod::Exact)
            .expect("flushed page should still be indexed");
        assert!(page.is_clean());
    }

    #[test]
    fn test_to_clean_evict_removes_from_index() {
        let cache = small_cache();

        let (page, _) = cache.add_and_acquire(entry(1, 10, 100, true));
        assert!(page.to_clean_evict_or_release());

        assert!(cache.get_and_acquire(1, 10, 100, SearchMethod::Exact).is_none());
        assert_eq!(cache.statistics().entries, 0);
    }

    #[test]
    fn test_to_clean_with_second_reference_defers_eviction() {
        let cache = small_cache();

        let (page, _) = cache.add_and_acquire(entry(1, 10, 100, true));
        let other = page.dup();

        assert!(!page.to_clean_evict_or_release());
        assert!(other.is_clean());
        drop(other);

        // still indexed; only eligible for eviction now
        assert!(cache.get_and_acquire(1, 10, 100, SearchMethod::Exact).is_some());
    }

    #[test]
    fn test_dup_pairs_acquires_with_releases() {
        let cache = small_cache();

        let (page, _) = cache.add_and_acquire(entry(1, 10, 100, false));
        let dup = page.dup();
        drop(page);
        drop(dup);

        let stats = cache.statistics();
        assert_eq!(stats.acquires, stats.releases);
        assert_eq!(stats.referenced_entries, 0);
    }

    #[test]
    fn test_destroy_without_flush_skips_save() {
        let saved = Arc::new(StdMutex::new(0usize));
        let saved_cb = Arc::clone(&saved);

        let cache: PageCache<u32> = PageCacheBuilder::new("test")
            .partitions(4)
            .free_clean_page(|_| {})
            .save_dirty(move |_, _| {
                *saved_cb.lock().unwrap() += 1;
            })
            .build()
            .unwrap();

        let (page, _) = cache.add_and_acquire(entry(1, 10, 100, true));
        page.hot_to_dirty_and_release(true);

        cache.destroy(false);
        assert_eq!(*saved.lock().unwrap(), 0);
    }

    #[test]
    fn test_free_all_unreferenced_clean_pages() {
        let freed = Arc::new(StdMutex::new(0usize));
        let freed_cb = Arc::clone(&freed);

        let cache: PageCache<u32> = PageCacheBuilder::new("test")
            .partitions(4)
            .free_clean_page(move |_| {
                *freed_cb.lock().unwrap() += 1;
            })
            .save_dirty(|_, _| {})
            .build()
            .unwrap();

        for metric in 0..10u64 {
            let (page, _) = cache.add_and_acquire(entry(1, metric, 100, false));
            drop(page);
        }

        cache.free_all_unreferenced_clean_pages();
        assert_eq!(*freed.lock().unwrap(), 10);
        assert_eq!(cache.statistics().entries, 0);
    }

    #[test]
    fn test_count_pages_matching() {
        let cache = small_cache();

        let (clean_page, _) = cache.add_and_acquire(entry(1, 10, 100, false));
        let (hot_page, _) = cache.add_and_acquire(entry(1, 11, 100, true));

        assert_eq!(cache.count_clean_pages_matching(1, |_| true), 1);
        assert_eq!(cache.count_hot_pages_matching(1, |_| true), 1);
        assert_eq!(cache.count_hot_pages_matching(2, |_| true), 0);

        drop(clean_page);
        drop(hot_page);
    }

    #[test]
    fn test_migration_success_makes_pages_clean() {
        let cache = small_cache();

        for metric in 0..4u64 {
            let (page, _) = cache.add_and_acquire(entry(7, metric, 100, true));
            drop(page);
        }

        let outcome = cache.migrate_hot_pages(7, |_| true, |pages| {
            assert_eq!(pages.len(), 4);
            true
        });

        assert!(outcome.success);
        assert_eq!(outcome.pages, 4);
        assert_eq!(cache.count_hot_pages_matching(7, |_| true), 0);
        assert_eq!(cache.count_clean_pages_matching(7, |_| true), 4);
    }

    #[test]
    fn test_migration_failure_rolls_back() {
        let cache = small_cache();

        let (page, _) = cache.add_and_acquire(entry(7, 1, 100, true));
        drop(page);

        let outcome = cache.migrate_hot_pages(7, |_| true, |_| false);

        assert!(!outcome.success);
        assert_eq!(outcome.pages, 1);
        assert_eq!(cache.count_hot_pages_matching(7, |_| true), 1);
    }

    #[test]
    fn test_options_default() {
        let options = CacheOptions::default();
        assert!(options.evict_no_inline);
        assert!(options.autoscale);
        assert!(!options.flush_no_inline);
    }
}
