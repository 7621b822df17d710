// # Cache Sizing and Pressure
//
// Computes the wanted cache size, the utilization in thousandths of it
// (`per1000`) and the eviction budget that brings the cache back to the
// low watermark. Only one thread computes at a time; concurrent callers
// read the last cached value instead of blocking, unless they need a
// fresh eviction budget.

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

use crate::cache::manager::PageCacheInner;

pub(crate) struct UsageTracker {
    gate: Mutex<()>,
    per1000: AtomicI64,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self {
            gate: Mutex::new(()),
            per1000: AtomicI64::new(0),
        }
    }
}

/// The autoscaled target: twice the hot ceiling (the promise made to
/// collectors), capped by the slow-flushing allowance.
#[inline]
pub(crate) fn autoscale_wanted_size(hot: i64, hot_max: i64, dirty_max: i64, index: i64) -> i64 {
    let max_size1 = hot.max(hot_max) * 2;
    let max_size2 = hot_max + (dirty_max * 2).max(hot_max * 2 / 3) + index;
    max_size1.min(max_size2)
}

/// A per1000 threshold in bytes, floored so it never asks for more than
/// the clean queue could ever yield.
#[inline]
pub(crate) fn pressure_threshold(
    threshold_per1000: i64,
    mut wanted: i64,
    mut current: i64,
    clean: i64,
) -> i64 {
    if current < clean {
        current = clean;
    }
    if wanted < current - clean {
        wanted = current - clean;
    }

    let mut ret = wanted * threshold_per1000 / 1000;
    if ret < current - clean {
        ret = current - clean;
    }
    ret
}

fn system_available_bytes() -> Option<i64> {
    sys_info::mem_info().ok().map(|m| m.avail as i64 * 1024)
}

impl<D: Send + Sync + 'static> PageCacheInner<D> {
    /// Recompute (or read) the cache utilization.
    ///
    /// Passing `size_to_evict` forces a fresh computation and fills in
    /// how many bytes eviction should reclaim right now.
    pub(crate) fn usage_per1000(&self, size_to_evict: Option<&mut i64>) -> i64 {
        let _gate = if size_to_evict.is_some() {
            self.usage.gate.lock()
        } else {
            match self.usage.gate.try_lock() {
                Some(gate) => gate,
                None => return self.usage.per1000.load(Ordering::Relaxed),
            }
        };

        let dirty = self.dirty.stats.size.load(Ordering::Relaxed);
        let hot = self.hot.stats.size.load(Ordering::Relaxed);
        let clean = self.clean.stats.size.load(Ordering::Relaxed);
        let evicting = self.stats.evicting_size.load(Ordering::Relaxed);
        let flushing = self.stats.flushing_size.load(Ordering::Relaxed);
        let current_cache_size = self.stats.size.load(Ordering::Relaxed);
        let all_pages_size = hot + dirty + clean + evicting + flushing;
        let index_size = (current_cache_size - all_pages_size).max(0);
        let referenced_size = self.stats.referenced_size.load(Ordering::Relaxed);

        let mut wanted_cache_size;
        if self.config.options.autoscale {
            if let Some(dynamic_target) = &self.config.hooks.dynamic_target_size {
                wanted_cache_size = autoscale_wanted_size(hot, hot, dirty, index_size);

                let dynamic_size = dynamic_target();
                if dynamic_size > wanted_cache_size {
                    wanted_cache_size = dynamic_size;
                }
            } else {
                let dirty_max = self.dirty.stats.max_size.load(Ordering::Relaxed);
                let hot_max = self.hot.stats.max_size.load(Ordering::Relaxed);
                wanted_cache_size = autoscale_wanted_size(hot, hot_max, dirty_max, index_size);
            }

            let floor = hot + dirty + index_size + self.config.clean_size;
            if wanted_cache_size < floor {
                wanted_cache_size = floor;
            }
        } else {
            wanted_cache_size = hot + dirty + index_size + self.config.clean_size;
        }

        // the absolute minimum the cache can shrink to
        let min_cache_size1 = referenced_size.max(hot) + dirty + index_size;
        let min_cache_size2 = if current_cache_size > clean {
            current_cache_size - clean
        } else {
            min_cache_size1
        };
        let min_cache_size = min_cache_size1.max(min_cache_size2);

        if self.config.out_of_memory_protection_bytes > 0 {
            if let Some(available) = system_available_bytes() {
                let min_available = self.config.out_of_memory_protection_bytes;
                if available < min_available {
                    // we must shrink
                    let must_lose = min_available - available;
                    if current_cache_size > must_lose {
                        wanted_cache_size = current_cache_size - must_lose;
                    } else {
                        wanted_cache_size = min_cache_size;
                    }
                } else if self.config.use_all_ram {
                    // we can grow
                    wanted_cache_size = current_cache_size + (available - min_available);
                }
            }
        }

        if wanted_cache_size < min_cache_size {
            wanted_cache_size = min_cache_size;
        }

        // protection for a totally empty cache
        if wanted_cache_size < 65536 {
            wanted_cache_size = 65536;
        }

        let per1000 = current_cache_size * 1000 / wanted_cache_size;
        self.usage.per1000.store(per1000, Ordering::Relaxed);
        self.stats
            .wanted_cache_size
            .store(wanted_cache_size, Ordering::Relaxed);
        self.stats
            .current_cache_size
            .store(current_cache_size, Ordering::Relaxed);

        let healthy_target = pressure_threshold(
            self.config.healthy_size_per1000,
            wanted_cache_size,
            current_cache_size,
            clean,
        );
        if current_cache_size > healthy_target {
            let low_watermark_target = pressure_threshold(
                self.config.evict_low_threshold_per1000,
                wanted_cache_size,
                current_cache_size,
                clean,
            );

            let mut size_to_evict_now = current_cache_size - low_watermark_target;
            if size_to_evict_now > clean {
                size_to_evict_now = clean;
            }

            if let Some(out) = size_to_evict {
                *out = size_to_evict_now;
            }

            let mut signal = false;
            if per1000 >= self.config.severe_pressure_per1000 {
                self.stats
                    .events_cache_under_severe_pressure
                    .fetch_add(1, Ordering::Relaxed);
                signal = true;
            } else if per1000 >= self.config.aggressive_evict_per1000 {
                self.stats
                    .events_cache_needs_space_aggressively
                    .fetch_add(1, Ordering::Relaxed);
                signal = true;
            }

            if signal {
                self.signal_evictor();
            }
        }

        per1000
    }

    #[inline]
    pub(crate) fn cache_above_healthy_limit(&self) -> bool {
        self.usage_per1000(None) >= self.config.healthy_size_per1000
    }

    #[inline]
    pub(crate) fn cache_needs_space_aggressively(&self) -> bool {
        self.usage_per1000(None) >= self.config.aggressive_evict_per1000
    }
}
