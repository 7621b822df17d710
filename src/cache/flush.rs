// # Flush Engine
//
// Drains the dirty queue in per-section batches. A batch is collected
// under the dirty lock (each page acquired and transition-locked), then
// unlinked and accounted as "flushing" before the lock is dropped, so
// the save callback runs without blocking collectors. Once the callback
// returns, the pages become clean.
//
// Sections that cannot fill a whole batch are skipped (their pages are
// released again) unless the caller asked for everything; the queue
// version cursor lets a non-waiting flush return immediately when
// nothing changed since the last completed pass.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::cache::manager::PageCacheInner;
use crate::cache::page::{Page, PageDescriptor, SectionId, PAGE_DIRTY};
use crate::cache::queue::SectionQueueInner;
use crate::cache::waitq::LockPriority;

impl<D: Send + Sync + 'static> PageCacheInner<D> {
    /// Dirty data outgrew the hot ceiling; flushing cannot keep up.
    pub(crate) fn flushing_critical(&self) -> bool {
        if self.dirty.stats.size.load(Ordering::Relaxed)
            > self.hot.stats.max_size.load(Ordering::Relaxed)
        {
            self.stats
                .events_flush_critical
                .fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Opportunistic flushing on a caller's thread.
    pub(crate) fn flush_inline(&self, on_release: bool) {
        if self.config.options.flush_no_inline || !self.flushing_critical() {
            return;
        }

        if on_release {
            self.stats
                .waste_flush_on_release
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.waste_flush_on_add.fetch_add(1, Ordering::Relaxed);
        }

        self.flush_pages_impl(self.config.max_flushes_inline, None, false, false);
    }

    /// One flush run. Returns true when it stopped on a budget or a lock
    /// before finishing, so the caller may loop.
    pub(crate) fn flush_pages_impl(
        &self,
        max_flushes: usize,
        section: Option<SectionId>,
        wait: bool,
        all_of_them: bool,
    ) -> bool {
        let dirty_guard = if !all_of_them && !wait {
            // called from a data collection thread; don't waste its time
            match self.dirty.try_lock(LockPriority::Flushers) {
                Some(guard) => guard,
                None => return false,
            }
        } else {
            self.dirty.lock(LockPriority::Flushers)
        };

        let batch = self.config.max_dirty_pages_per_call;
        let version_at_entry = dirty_guard.version;
        let entries = self.dirty.stats.entries.load(Ordering::Relaxed) as usize;
        if !all_of_them
            && (entries < batch || dirty_guard.last_version_checked == version_at_entry)
        {
            return false;
        }

        self.stats.workers_flush.fetch_add(1, Ordering::Relaxed);

        let max_flushes = if all_of_them || max_flushes == 0 {
            usize::MAX
        } else {
            max_flushes
        };

        let mut have_guard = Some(dirty_guard);
        let mut flushes_so_far = 0usize;
        let mut stopped_before_finishing = false;
        let mut current: Option<SectionId> = None;
        let mut revisit = false;

        while let Some(mut guard) = have_guard.take() {
            let Some(this_section) = next_flush_section(&guard, section, current, revisit) else {
                have_guard = Some(guard);
                break;
            };
            current = Some(this_section);
            revisit = false;

            let section_entries = guard
                .sections
                .get(&this_section)
                .map_or(0, |sp| sp.entries);
            if !all_of_them && section_entries < batch {
                have_guard = Some(guard);
                continue;
            }

            if !all_of_them && flushes_so_far > max_flushes {
                stopped_before_finishing = true;
                have_guard = Some(guard);
                break;
            }

            // collect a batch: reference and transition-lock each page
            let mut pages: Vec<Arc<Page<D>>> = Vec::with_capacity(batch);
            let mut descriptors: Vec<PageDescriptor> = Vec::with_capacity(batch);
            let mut batch_size = 0i64;
            let mut after: Option<i64> = None;

            while pages.len() < batch {
                let Some((key, page)) = guard.next_page(this_section, after) else {
                    break;
                };
                after = Some(key);

                debug_assert_eq!(
                    page.flags.state(),
                    PAGE_DIRTY,
                    "page should be in the dirty queue before being saved"
                );
                debug_assert_eq!(page.section(), this_section);

                if self.page_acquire(&page) {
                    if page.transition.try_lock() {
                        let mut descriptor = self.config.descriptor(&page);
                        descriptor.hot = false;
                        descriptors.push(descriptor);
                        batch_size += page.assumed_size();
                        pages.push(page);
                    } else {
                        self.page_release(&page, false);
                    }
                }
            }

            if !all_of_them && pages.len() < batch {
                // not enough to save; release and advance to the next section
                self.stats
                    .flushes_cancelled
                    .fetch_add(pages.len() as u64, Ordering::Relaxed);
                self.stats
                    .flushes_cancelled_size
                    .fetch_add(batch_size, Ordering::Relaxed);

                for page in pages {
                    page.transition.unlock();
                    self.page_release(&page, false);
                }

                have_guard = Some(guard);
                continue;
            }

            if pages.is_empty() {
                // an all-of-them pass over a section whose pages are all
                // transition-locked elsewhere; move on
                have_guard = Some(guard);
                continue;
            }

            // commit the batch: out of the dirty queue, into "flushing"
            for page in &pages {
                self.stats.flushing_entries.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .flushing_size
                    .fetch_add(page.assumed_size(), Ordering::Relaxed);

                self.dirty
                    .del_locked(&mut guard, page, self.config.nominal_size(page));
            }

            // repeat the same section next round
            revisit = true;

            let save_enabled = self.save_enabled.load(Ordering::Acquire);
            if save_enabled {
                if let Some(init) = &self.config.hooks.save_init {
                    init(this_section);
                }
            }

            // the callback may take a while; run it without the lock
            drop(guard);

            if save_enabled {
                if let Some(save) = &self.config.hooks.save_dirty {
                    save(&descriptors, &pages);
                }
            }

            flushes_so_far += 1;
            self.stats
                .flushes_completed
                .fetch_add(pages.len() as u64, Ordering::Relaxed);
            self.stats
                .flushes_completed_size
                .fetch_add(batch_size, Ordering::Relaxed);

            for page in pages {
                debug_assert_eq!(
                    page.flags.state(),
                    0,
                    "page should not be in any queue while it is being saved"
                );

                self.stats.flushing_entries.fetch_sub(1, Ordering::Relaxed);
                self.stats
                    .flushing_size
                    .fetch_sub(page.assumed_size(), Ordering::Relaxed);

                self.page_set_clean(&page, LockPriority::Flushers);
                page.transition.unlock();
                self.page_release(&page, false);
            }

            if !all_of_them && !wait {
                match self.dirty.try_lock(LockPriority::Flushers) {
                    Some(guard) => have_guard = Some(guard),
                    None => {
                        stopped_before_finishing = true;
                    }
                }
            } else {
                have_guard = Some(self.dirty.lock(LockPriority::Flushers));
            }
        }

        if let Some(mut guard) = have_guard {
            if !stopped_before_finishing && version_at_entry > guard.last_version_checked {
                guard.last_version_checked = version_at_entry;
            }
        }

        self.stats.workers_flush.fetch_sub(1, Ordering::Relaxed);

        stopped_before_finishing
    }
}

/// Section iteration order of a flush pass: an explicit target section is
/// visited (and revisited) alone; otherwise sections are walked in order,
/// re-entering the one just flushed until it cannot fill a batch.
fn next_flush_section<D>(
    inner: &SectionQueueInner<D>,
    target: Option<SectionId>,
    current: Option<SectionId>,
    revisit: bool,
) -> Option<SectionId> {
    match target {
        Some(section) => {
            if current.is_none() || revisit {
                inner.sections.contains_key(&section).then(|| section)
            } else {
                None
            }
        }
        None => match current {
            None => inner.next_section(None),
            Some(section) if revisit => {
                if inner.sections.contains_key(&section) {
                    Some(section)
                } else {
                    inner.next_section(Some(section))
                }
            }
            Some(section) => inner.next_section(Some(section)),
        },
    }
}
