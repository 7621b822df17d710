// # Eviction Engine
//
// Selects clean pages from the head of the LRU, claims them for deletion
// at refcount zero, unlinks them, and removes them from the index in
// per-partition batches before handing their payload to the free
// callback. Pages that were accessed since the last scan get a second
// chance at the tail; pages that cannot be claimed are relocated to the
// tail and counted against the skip budget.
//
// The engine runs in three modes: opportunistic (inline on adders and
// releasers, try-locks only), pressure-driven (the evictor thread, with
// a budget that ramps up while the cache stays above the thresholds) and
// drain-everything (shutdown and per-collaborator cleanups).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};

use crate::cache::manager::PageCacheInner;
use crate::cache::page::{Page, PAGE_HAS_BEEN_ACCESSED, PAGE_IGNORE_ACCESSES};
use crate::cache::waitq::LockPriority;

impl<D: Send + Sync + 'static> PageCacheInner<D> {
    /// Opportunistic eviction on a caller's thread.
    ///
    /// Adders pitch in above the aggressive threshold, releasers only
    /// once pressure is severe. Computing the utilization here is what
    /// signals the evictor thread, so it happens even when inline
    /// eviction itself is disabled.
    pub(crate) fn evict_inline(&self, on_release: bool) {
        let per1000 = self.usage_per1000(None);

        if self.config.options.evict_no_inline {
            return;
        }

        if per1000 > self.config.aggressive_evict_per1000 && !on_release {
            self.stats
                .waste_evictions_inline_on_add
                .fetch_add(1, Ordering::Relaxed);
        } else if per1000 > self.config.severe_pressure_per1000 && on_release {
            self.stats
                .waste_evictions_inline_on_release
                .fetch_add(1, Ordering::Relaxed);
        } else {
            return;
        }

        self.evict_pages_impl(
            self.config.max_skip_pages_per_inline_eviction,
            self.config.max_pages_per_inline_eviction,
            false,
            false,
            None,
        );
    }

    /// One eviction run. Returns true when it stopped on a budget or a
    /// lock before finishing, so the caller may loop.
    pub(crate) fn evict_pages_impl(
        &self,
        max_skip: usize,
        max_evict: usize,
        wait: bool,
        all_of_them: bool,
        filter: Option<&dyn Fn(&Page<D>) -> bool>,
    ) -> bool {
        let mut per1000 = self.usage_per1000(None);

        if !all_of_them && per1000 < self.config.healthy_size_per1000 {
            // not enough to do anything
            return false;
        }

        let mut under_severe_pressure = per1000 >= self.config.severe_pressure_per1000;

        let workers = self.stats.workers_evict.fetch_add(1, Ordering::Relaxed) + 1;
        if !wait
            && !all_of_them
            && workers as usize > self.config.max_workers_evict_inline
            && !under_severe_pressure
        {
            self.stats.workers_evict.fetch_sub(1, Ordering::Relaxed);
            return false;
        }

        let max_skip = if max_skip == 0 { usize::MAX } else { max_skip.max(2) };
        let max_evict = if max_evict == 0 { usize::MAX } else { max_evict.max(2) };

        let mut total_pages_evicted = 0usize;
        let mut total_pages_relocated = 0usize;
        let mut this_loop_evicted = 0usize;
        let mut stopped_before_finishing = false;
        let mut spins = 0usize;
        let mut max_pages_to_evict = 0usize;

        'run: loop {
            let max_size_to_evict: i64;
            if all_of_them {
                max_size_to_evict = i64::MAX;
                max_pages_to_evict = usize::MAX;
                under_severe_pressure = true;
            } else if wait {
                // evict as much as needed to reach the low watermark,
                // ramping the page budget while pressure persists
                let mut size_to_evict = 0i64;
                per1000 = self.usage_per1000(Some(&mut size_to_evict));
                max_size_to_evict = size_to_evict;

                if per1000 >= self.config.severe_pressure_per1000 {
                    under_severe_pressure = true;
                    max_pages_to_evict = if max_pages_to_evict == 0 {
                        16
                    } else {
                        (max_pages_to_evict * 2).min(64)
                    };
                } else if per1000 >= self.config.aggressive_evict_per1000 {
                    under_severe_pressure = false;
                    max_pages_to_evict = if max_pages_to_evict == 0 {
                        4
                    } else {
                        (max_pages_to_evict * 2).min(16)
                    };
                } else {
                    under_severe_pressure = false;
                    max_pages_to_evict = 1;
                }
            } else {
                // an adder pitching in: one page, and only above healthy
                max_size_to_evict = if self.cache_above_healthy_limit() { 1 } else { 0 };
                max_pages_to_evict = 1;
            }

            if max_size_to_evict == 0 || max_pages_to_evict == 0 {
                break;
            }

            if total_pages_evicted >= max_evict && !all_of_them {
                stopped_before_finishing = true;
                break;
            }

            spins += 1;
            if spins > 1 && this_loop_evicted == 0 {
                self.stats
                    .waste_evict_useless_spins
                    .fetch_add(1, Ordering::Relaxed);
            }
            this_loop_evicted = 0;

            let mut clean_guard = if !all_of_them && !wait {
                match self.clean.try_lock(LockPriority::Evictors) {
                    Some(guard) => guard,
                    None => {
                        stopped_before_finishing = true;
                        break 'run;
                    }
                }
            } else {
                self.clean.lock(LockPriority::Evictors)
            };

            // walk the LRU head, collecting claimable pages
            let mut to_evict: Vec<Arc<Page<D>>> = Vec::new();
            let mut to_evict_size = 0i64;
            let mut cursor: Option<i64> = None;
            let mut first_relocated_key: Option<i64> = None;

            loop {
                let Some((key, page)) = clean_guard.next_page(cursor) else {
                    break;
                };

                if first_relocated_key.map_or(false, |stop| key >= stop) {
                    // completed a full loop over the queue
                    break;
                }
                cursor = Some(key);

                if page.flags.check(PAGE_HAS_BEEN_ACCESSED | PAGE_IGNORE_ACCESSES)
                    == PAGE_HAS_BEEN_ACCESSED
                {
                    // second chance: to the tail, bit cleared
                    clean_guard.relink_at_tail(&page);
                    page.flags.clear(PAGE_HAS_BEEN_ACCESSED);
                    continue;
                }

                if filter.map_or(false, |f| !f(&page)) {
                    continue;
                }

                if self.page_try_deletion_clean_locked(&page) {
                    let assumed_size = page.assumed_size();
                    self.clean
                        .del_locked(&mut clean_guard, &page, self.config.nominal_size(&page));

                    self.stats.evicting_entries.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .evicting_size
                        .fetch_add(assumed_size, Ordering::Relaxed);

                    to_evict_size += assumed_size;
                    to_evict.push(page);

                    if !((to_evict.len() < max_pages_to_evict && to_evict_size < max_size_to_evict)
                        || all_of_them)
                    {
                        break;
                    }
                } else {
                    // somebody references it, move it out of the way
                    if let Some(new_key) = clean_guard.relink_at_tail(&page) {
                        if first_relocated_key.is_none() {
                            first_relocated_key = Some(new_key);
                        }
                    }

                    total_pages_relocated += 1;
                    if total_pages_relocated >= max_skip && !all_of_them {
                        stopped_before_finishing = true;
                        break;
                    }
                }
            }
            drop(clean_guard);

            if to_evict.is_empty() {
                break;
            }

            if to_evict.len() > 1 {
                // bucket by partition to minimize index write locks
                let partitions = self.index.partitions();
                let mut per_partition: Vec<Vec<Arc<Page<D>>>> =
                    (0..partitions).map(|_| Vec::new()).collect();
                for page in to_evict {
                    per_partition[self.index.partition_for(page.metric_id())].push(page);
                }

                let mut done = vec![false; partitions];
                let mut remaining = per_partition.iter().filter(|b| !b.is_empty()).count();
                let mut last_remaining = remaining + 1;
                while remaining > 0 {
                    // force the locks once a whole round made no progress
                    let force = remaining == last_remaining;
                    last_remaining = remaining;
                    remaining = 0;

                    for partition in 0..partitions {
                        if per_partition[partition].is_empty() || done[partition] {
                            continue;
                        }

                        match self.index.try_write_partition(partition, force) {
                            Some(mut part) => {
                                done[partition] = true;
                                for page in &per_partition[partition] {
                                    self.index.remove_locked(&mut part, page);
                                }
                            }
                            None => remaining += 1,
                        }
                    }
                }

                for bucket in per_partition {
                    for page in bucket {
                        let assumed_size = page.assumed_size();
                        self.free_this_page(page);

                        self.stats.evicting_entries.fetch_sub(1, Ordering::Relaxed);
                        self.stats
                            .evicting_size
                            .fetch_sub(assumed_size, Ordering::Relaxed);

                        total_pages_evicted += 1;
                        this_loop_evicted += 1;
                    }
                }
            } else {
                let page = to_evict.pop().unwrap();
                let assumed_size = page.assumed_size();

                self.index.remove(&page);
                self.free_this_page(page);

                self.stats.evicting_entries.fetch_sub(1, Ordering::Relaxed);
                self.stats
                    .evicting_size
                    .fetch_sub(assumed_size, Ordering::Relaxed);

                total_pages_evicted += 1;
                this_loop_evicted += 1;
            }

            if !(all_of_them
                || (total_pages_evicted < max_evict && total_pages_relocated < max_skip))
            {
                break;
            }
        }

        if all_of_them && filter.is_none() {
            let _guard = self.clean.lock(LockPriority::Evictors);
            let entries = self.clean.stats.entries.load(Ordering::Relaxed);
            if entries > 0 {
                log::warn!(
                    "CACHE {}: cannot free all clean pages, {} are still in the clean queue",
                    self.config.name,
                    entries
                );
            }
        }

        if total_pages_relocated > 0 {
            self.stats
                .waste_evict_relocated
                .fetch_add(total_pages_relocated as u64, Ordering::Relaxed);
        }

        self.stats.workers_evict.fetch_sub(1, Ordering::Relaxed);

        stopped_before_finishing
    }
}

/// The per-cache evictor thread: reacts to pressure signals and a
/// periodic tick until the cache shuts down.
pub(crate) fn evictor_main<D: Send + Sync + 'static>(
    cache: Arc<PageCacheInner<D>>,
    signal: Receiver<()>,
) {
    let mut last_memory_trim: Option<Instant> = None;

    loop {
        match signal.recv_timeout(Duration::from_secs(1)) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if cache.evictor_cancelled() {
            break;
        }

        let mut size_to_evict = 0i64;
        let system_cleanup = cache.usage_per1000(Some(&mut size_to_evict))
            > cache.config.aggressive_evict_per1000;

        cache.evict_pages_impl(0, 0, true, false, None);

        if system_cleanup {
            let due = last_memory_trim.map_or(true, |at| at.elapsed() >= Duration::from_secs(1));
            if due {
                last_memory_trim = Some(Instant::now());
                if let Some(trim) = &cache.config.hooks.memory_trim {
                    trim();
                }
            }
        }
    }
}
