// # Cache Statistics
//
// All counters are relaxed atomics and eventually consistent; snapshots
// are plain structs taken field by field. Maximum trackers use the usual
// CAS-raise loop so concurrent updates never lower a maximum.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

// ============================================================================
// Helpers
// ============================================================================

#[inline]
pub(crate) fn raise_max_u64(max: &AtomicU64, desired: u64) {
    let mut expected = max.load(Ordering::Relaxed);
    while expected < desired {
        match max.compare_exchange_weak(expected, desired, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(observed) => expected = observed,
        }
    }
}

#[inline]
pub(crate) fn raise_max_i64(max: &AtomicI64, desired: i64) {
    let mut expected = max.load(Ordering::Relaxed);
    while expected < desired {
        match max.compare_exchange_weak(expected, desired, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(observed) => expected = observed,
        }
    }
}

// ============================================================================
// Size Histogram
// ============================================================================

pub(crate) const SIZE_HISTOGRAM_BUCKETS: usize = 15;

/// Lower bounds of the histogram buckets; bucket `i` counts pages whose
/// nominal size is in `[UPTO[i], UPTO[i + 1])`.
pub(crate) const SIZE_HISTOGRAM_UPTO: [u64; SIZE_HISTOGRAM_BUCKETS] = [
    0,
    32,
    64,
    128,
    256,
    512,
    1024,
    2048,
    4096,
    8192,
    16384,
    32768,
    65536,
    128 * 1024,
    u64::MAX,
];

pub(crate) struct SizeHistogram {
    counts: [AtomicU64; SIZE_HISTOGRAM_BUCKETS],
}

impl SizeHistogram {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline]
    fn slot(size: u64) -> usize {
        SIZE_HISTOGRAM_UPTO
            .iter()
            .rposition(|&upto| size >= upto)
            .unwrap_or(0)
    }

    #[inline]
    pub fn add(&self, size: u64) {
        self.counts[Self::slot(size)].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn del(&self, size: u64) {
        self.counts[Self::slot(size)].fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SizeHistogramSnapshot {
        SizeHistogramSnapshot {
            buckets: std::array::from_fn(|i| SizeHistogramBucket {
                upto: SIZE_HISTOGRAM_UPTO[i],
                count: self.counts[i].load(Ordering::Relaxed),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeHistogramBucket {
    pub upto: u64,
    pub count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SizeHistogramSnapshot {
    pub buckets: [SizeHistogramBucket; SIZE_HISTOGRAM_BUCKETS],
}

// ============================================================================
// Per-Queue Statistics
// ============================================================================

pub(crate) struct QueueStats {
    pub entries: AtomicU64,
    pub size: AtomicI64,
    pub max_entries: AtomicU64,
    pub max_size: AtomicI64,
    pub added_entries: AtomicU64,
    pub added_size: AtomicI64,
    pub removed_entries: AtomicU64,
    pub removed_size: AtomicI64,
    pub histogram: SizeHistogram,
}

impl QueueStats {
    pub fn new() -> Self {
        Self {
            entries: AtomicU64::new(0),
            size: AtomicI64::new(0),
            max_entries: AtomicU64::new(0),
            max_size: AtomicI64::new(0),
            added_entries: AtomicU64::new(0),
            added_size: AtomicI64::new(0),
            removed_entries: AtomicU64::new(0),
            removed_size: AtomicI64::new(0),
            histogram: SizeHistogram::new(),
        }
    }

    /// Accounting for a page entering the queue.
    #[inline]
    pub fn on_add(&self, assumed_size: i64, nominal_size: u64) {
        let entries = self.entries.fetch_add(1, Ordering::Relaxed) + 1;
        let size = self.size.fetch_add(assumed_size, Ordering::Relaxed) + assumed_size;
        self.added_entries.fetch_add(1, Ordering::Relaxed);
        self.added_size.fetch_add(assumed_size, Ordering::Relaxed);

        raise_max_u64(&self.max_entries, entries);
        raise_max_i64(&self.max_size, size);

        self.histogram.add(nominal_size);
    }

    /// Accounting for a page leaving the queue.
    #[inline]
    pub fn on_del(&self, assumed_size: i64, nominal_size: u64) {
        self.histogram.del(nominal_size);

        self.entries.fetch_sub(1, Ordering::Relaxed);
        self.size.fetch_sub(assumed_size, Ordering::Relaxed);
        self.removed_entries.fetch_add(1, Ordering::Relaxed);
        self.removed_size.fetch_add(assumed_size, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QueueStatistics {
        QueueStatistics {
            entries: self.entries.load(Ordering::Relaxed),
            size: self.size.load(Ordering::Relaxed),
            max_entries: self.max_entries.load(Ordering::Relaxed),
            max_size: self.max_size.load(Ordering::Relaxed),
            added_entries: self.added_entries.load(Ordering::Relaxed),
            added_size: self.added_size.load(Ordering::Relaxed),
            removed_entries: self.removed_entries.load(Ordering::Relaxed),
            removed_size: self.removed_size.load(Ordering::Relaxed),
            size_histogram: self.histogram.snapshot(),
        }
    }
}

/// Read-only snapshot of one queue's counters.
#[derive(Debug, Clone, Default)]
pub struct QueueStatistics {
    pub entries: u64,
    pub size: i64,
    pub max_entries: u64,
    pub max_size: i64,
    pub added_entries: u64,
    pub added_size: i64,
    pub removed_entries: u64,
    pub removed_size: i64,
    pub size_histogram: SizeHistogramSnapshot,
}

// ============================================================================
// Global Statistics
// ============================================================================

pub(crate) struct CacheStats {
    pub wanted_cache_size: AtomicI64,
    pub current_cache_size: AtomicI64,

    // volume
    pub entries: AtomicU64,
    pub size: AtomicI64,
    pub referenced_entries: AtomicU64,
    pub referenced_size: AtomicI64,
    pub added_entries: AtomicU64,
    pub added_size: AtomicI64,
    pub removed_entries: AtomicU64,
    pub removed_size: AtomicI64,

    // migrations between queues
    pub evicting_entries: AtomicU64,
    pub evicting_size: AtomicI64,
    pub flushing_entries: AtomicU64,
    pub flushing_size: AtomicI64,
    pub hot2dirty_entries: AtomicU64,
    pub hot2dirty_size: AtomicI64,
    pub hot_empty_pages_evicted_immediately: AtomicU64,
    pub hot_empty_pages_evicted_later: AtomicU64,

    // workload
    pub acquires: AtomicU64,
    pub releases: AtomicU64,
    pub acquires_for_deletion: AtomicU64,
    pub searches_exact: AtomicU64,
    pub searches_exact_hits: AtomicU64,
    pub searches_exact_misses: AtomicU64,
    pub searches_closest: AtomicU64,
    pub searches_closest_hits: AtomicU64,
    pub searches_closest_misses: AtomicU64,
    pub flushes_completed: AtomicU64,
    pub flushes_completed_size: AtomicI64,
    pub flushes_cancelled: AtomicU64,
    pub flushes_cancelled_size: AtomicI64,

    // critical events
    pub events_cache_under_severe_pressure: AtomicU64,
    pub events_cache_needs_space_aggressively: AtomicU64,
    pub events_flush_critical: AtomicU64,

    // worker gauges
    pub workers_add: AtomicU64,
    pub workers_search: AtomicU64,
    pub workers_evict: AtomicU64,
    pub workers_flush: AtomicU64,
    pub workers_hot2dirty: AtomicU64,
    pub workers_migrate: AtomicU64,

    // waste events
    pub waste_insert_spins: AtomicU64,
    pub waste_evict_useless_spins: AtomicU64,
    pub waste_evict_relocated: AtomicU64,
    pub waste_evict_thread_signals: AtomicU64,
    pub waste_evictions_inline_on_add: AtomicU64,
    pub waste_evictions_inline_on_release: AtomicU64,
    pub waste_flush_on_add: AtomicU64,
    pub waste_flush_on_release: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self {
            wanted_cache_size: AtomicI64::new(0),
            current_cache_size: AtomicI64::new(0),
            entries: AtomicU64::new(0),
            size: AtomicI64::new(0),
            referenced_entries: AtomicU64::new(0),
            referenced_size: AtomicI64::new(0),
            added_entries: AtomicU64::new(0),
            added_size: AtomicI64::new(0),
            removed_entries: AtomicU64::new(0),
            removed_size: AtomicI64::new(0),
            evicting_entries: AtomicU64::new(0),
            evicting_size: AtomicI64::new(0),
            flushing_entries: AtomicU64::new(0),
            flushing_size: AtomicI64::new(0),
            hot2dirty_entries: AtomicU64::new(0),
            hot2dirty_size: AtomicI64::new(0),
            hot_empty_pages_evicted_immediately: AtomicU64::new(0),
            hot_empty_pages_evicted_later: AtomicU64::new(0),
            acquires: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            acquires_for_deletion: AtomicU64::new(0),
            searches_exact: AtomicU64::new(0),
            searches_exact_hits: AtomicU64::new(0),
            searches_exact_misses: AtomicU64::new(0),
            searches_closest: AtomicU64::new(0),
            searches_closest_hits: AtomicU64::new(0),
            searches_closest_misses: AtomicU64::new(0),
            flushes_completed: AtomicU64::new(0),
            flushes_completed_size: AtomicI64::new(0),
            flushes_cancelled: AtomicU64::new(0),
            flushes_cancelled_size: AtomicI64::new(0),
            events_cache_under_severe_pressure: AtomicU64::new(0),
            events_cache_needs_space_aggressively: AtomicU64::new(0),
            events_flush_critical: AtomicU64::new(0),
            workers_add: AtomicU64::new(0),
            workers_search: AtomicU64::new(0),
            workers_evict: AtomicU64::new(0),
            workers_flush: AtomicU64::new(0),
            workers_hot2dirty: AtomicU64::new(0),
            workers_migrate: AtomicU64::new(0),
            waste_insert_spins: AtomicU64::new(0),
            waste_evict_useless_spins: AtomicU64::new(0),
            waste_evict_relocated: AtomicU64::new(0),
            waste_evict_thread_signals: AtomicU64::new(0),
            waste_evictions_inline_on_add: AtomicU64::new(0),
            waste_evictions_inline_on_release: AtomicU64::new(0),
            waste_flush_on_add: AtomicU64::new(0),
            waste_flush_on_release: AtomicU64::new(0),
        }
    }
}

/// Read-only snapshot of the cache-wide counters plus the three queues.
#[derive(Debug, Clone, Default)]
pub struct CacheStatistics {
    pub wanted_cache_size: i64,
    pub current_cache_size: i64,

    pub entries: u64,
    pub size: i64,
    pub referenced_entries: u64,
    pub referenced_size: i64,
    pub added_entries: u64,
    pub added_size: i64,
    pub removed_entries: u64,
    pub removed_size: i64,

    pub evicting_entries: u64,
    pub evicting_size: i64,
    pub flushing_entries: u64,
    pub flushing_size: i64,
    pub hot2dirty_entries: u64,
    pub hot2dirty_size: i64,
    pub hot_empty_pages_evicted_immediately: u64,
    pub hot_empty_pages_evicted_later: u64,

    pub acquires: u64,
    pub releases: u64,
    pub acquires_for_deletion: u64,
    pub searches_exact: u64,
    pub searches_exact_hits: u64,
    pub searches_exact_misses: u64,
    pub searches_closest: u64,
    pub searches_closest_hits: u64,
    pub searches_closest_misses: u64,
    pub flushes_completed: u64,
    pub flushes_completed_size: i64,
    pub flushes_cancelled: u64,
    pub flushes_cancelled_size: i64,

    pub events_cache_under_severe_pressure: u64,
    pub events_cache_needs_space_aggressively: u64,
    pub events_flush_critical: u64,

    pub hot: QueueStatistics,
    pub dirty: QueueStatistics,
    pub clean: QueueStatistics,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatistics {
        CacheStatistics {
            wanted_cache_size: self.wanted_cache_size.load(Ordering::Relaxed),
            current_cache_size: self.current_cache_size.load(Ordering::Relaxed),
            entries: self.entries.load(Ordering::Relaxed),
            size: self.size.load(Ordering::Relaxed),
            referenced_entries: self.referenced_entries.load(Ordering::Relaxed),
            referenced_size: self.referenced_size.load(Ordering::Relaxed),
            added_entries: self.added_entries.load(Ordering::Relaxed),
            added_size: self.added_size.load(Ordering::Relaxed),
            removed_entries: self.removed_entries.load(Ordering::Relaxed),
            removed_size: self.removed_size.load(Ordering::Relaxed),
            evicting_entries: self.evicting_entries.load(Ordering::Relaxed),
            evicting_size: self.evicting_size.load(Ordering::Relaxed),
            flushing_entries: self.flushing_entries.load(Ordering::Relaxed),
            flushing_size: self.flushing_size.load(Ordering::Relaxed),
            hot2dirty_entries: self.hot2dirty_entries.load(Ordering::Relaxed),
            hot2dirty_size: self.hot2dirty_size.load(Ordering::Relaxed),
            hot_empty_pages_evicted_immediately: self
                .hot_empty_pages_evicted_immediately
                .load(Ordering::Relaxed),
            hot_empty_pages_evicted_later: self
                .hot_empty_pages_evicted_later
                .load(Ordering::Relaxed),
            acquires: self.acquires.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            acquires_for_deletion: self.acquires_for_deletion.load(Ordering::Relaxed),
            searches_exact: self.searches_exact.load(Ordering::Relaxed),
            searches_exact_hits: self.searches_exact_hits.load(Ordering::Relaxed),
            searches_exact_misses: self.searches_exact_misses.load(Ordering::Relaxed),
            searches_closest: self.searches_closest.load(Ordering::Relaxed),
            searches_closest_hits: self.searches_closest_hits.load(Ordering::Relaxed),
            searches_closest_misses: self.searches_closest_misses.load(Ordering::Relaxed),
            flushes_completed: self.flushes_completed.load(Ordering::Relaxed),
            flushes_completed_size: self.flushes_completed_size.load(Ordering::Relaxed),
            flushes_cancelled: self.flushes_cancelled.load(Ordering::Relaxed),
            flushes_cancelled_size: self.flushes_cancelled_size.load(Ordering::Relaxed),
            events_cache_under_severe_pressure: self
                .events_cache_under_severe_pressure
                .load(Ordering::Relaxed),
            events_cache_needs_space_aggressively: self
                .events_cache_needs_space_aggressively
                .load(Ordering::Relaxed),
            events_flush_critical: self.events_flush_critical.load(Ordering::Relaxed),
            hot: QueueStatistics::default(),
            dirty: QueueStatistics::default(),
            clean: QueueStatistics::default(),
        }
    }
}
