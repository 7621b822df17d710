// # Cache Configuration
//
// Builder-assembled, immutable once the cache is running. The callbacks
// are a small capability struct of boxed functions plus whatever context
// they capture; they receive owned descriptors, never borrows tied to a
// page's lifetime.

use std::mem::size_of;
use std::sync::Arc;

use crate::cache::page::{FreedPage, Page, PageDescriptor, SectionId};
use crate::error::{CacheError, Result};

const MIN_CLEAN_SIZE: i64 = 1024 * 1024;

/// Per1000 pressure thresholds (units: 1/1000 of the wanted size).
pub(crate) const SEVERE_PRESSURE_PER1000: i64 = 1010;
pub(crate) const AGGRESSIVE_EVICT_PER1000: i64 = 990;
pub(crate) const HEALTHY_SIZE_PER1000: i64 = 980;
pub(crate) const EVICT_LOW_THRESHOLD_PER1000: i64 = 970;

// ============================================================================
// Callback Types
// ============================================================================

/// Frees a clean page's payload once the cache is done with it.
pub type FreeCleanPageCb<D> = Box<dyn Fn(FreedPage<D>) + Send + Sync>;

/// Persists a batch of dirty pages of one section. The data must be
/// durable (or durably queued) by the time the callback returns.
pub type SaveDirtyCb<D> = Box<dyn Fn(&[PageDescriptor], &[Arc<Page<D>>]) + Send + Sync>;

/// Invoked once per flush batch before the save callback.
pub type SaveInitCb = Box<dyn Fn(SectionId) + Send + Sync>;

/// Supplies a target cache size computed outside the cache.
pub type DynamicTargetSizeCb = Box<dyn Fn() -> i64 + Send + Sync>;

/// Reports the nominal (uncompressed) size of a payload for histograms.
pub type NominalPageSizeCb<D> = Box<dyn Fn(&D) -> usize + Send + Sync>;

/// Asks the allocator to return freed memory to the system.
pub type MemoryTrimCb = Box<dyn Fn() + Send + Sync>;

pub(crate) struct CacheHooks<D> {
    pub free_clean_page: FreeCleanPageCb<D>,
    pub save_dirty: Option<SaveDirtyCb<D>>,
    pub save_init: Option<SaveInitCb>,
    pub dynamic_target_size: Option<DynamicTargetSizeCb>,
    pub nominal_page_size: Option<NominalPageSizeCb<D>>,
    pub memory_trim: Option<MemoryTrimCb>,
}

// ============================================================================
// Options
// ============================================================================

/// Behavioral switches of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    /// Do not evict on the caller's thread when pressure crosses the
    /// inline thresholds; leave it to the evictor thread.
    pub evict_no_inline: bool,
    /// Do not flush on the caller's thread when flushing gets critical.
    pub flush_no_inline: bool,
    /// Grow the target size with the observed hot/dirty workload instead
    /// of keeping it fixed at the configured clean size.
    pub autoscale: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            evict_no_inline: true,
            flush_no_inline: false,
            autoscale: true,
        }
    }
}

// ============================================================================
// Config
// ============================================================================

pub(crate) struct CacheConfig<D> {
    pub name: String,
    pub options: CacheOptions,

    pub partitions: usize,
    pub clean_size: i64,
    pub max_dirty_pages_per_call: usize,
    pub max_pages_per_inline_eviction: usize,
    pub max_skip_pages_per_inline_eviction: usize,
    pub max_flushes_inline: usize,
    pub max_workers_evict_inline: usize,
    pub additional_bytes_per_page: usize,
    pub out_of_memory_protection_bytes: i64,
    pub use_all_ram: bool,

    pub severe_pressure_per1000: i64,
    pub aggressive_evict_per1000: i64,
    pub healthy_size_per1000: i64,
    pub evict_low_threshold_per1000: i64,

    pub hooks: CacheHooks<D>,
}

impl<D> CacheConfig<D> {
    /// Bytes a page is accounted for: payload plus the page struct, the
    /// custom data tail and the index entry overhead.
    #[inline]
    pub fn assumed_size(&self, size: usize) -> i64 {
        (size + size_of::<Page<D>>() + self.additional_bytes_per_page + 3 * size_of::<usize>())
            as i64
    }

    /// Payload bytes back out of an accounted size.
    #[inline]
    pub fn size_from_assumed(&self, assumed_size: i64) -> usize {
        (assumed_size as usize)
            .saturating_sub(size_of::<Page<D>>() + self.additional_bytes_per_page + 3 * size_of::<usize>())
    }

    /// Size used for the queue histograms.
    #[inline]
    pub fn nominal_size(&self, page: &Page<D>) -> u64 {
        match &self.hooks.nominal_page_size {
            Some(cb) => cb(page.data()) as u64,
            None => self.size_from_assumed(page.assumed_size()) as u64,
        }
    }

    pub fn descriptor(&self, page: &Page<D>) -> PageDescriptor {
        PageDescriptor {
            section: page.section(),
            metric_id: page.metric_id(),
            start_time_s: page.start_time_s(),
            end_time_s: page.end_time_s(),
            update_every_s: page.update_every_s(),
            size: self.size_from_assumed(page.assumed_size()),
            hot: page.is_hot(),
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for a [`PageCache`](crate::cache::PageCache).
///
/// ```ignore
/// let cache = PageCacheBuilder::new("main")
///     .clean_size_bytes(32 * 1024 * 1024)
///     .max_dirty_pages_per_flush(64)
///     .free_clean_page(|freed| drop(freed))
///     .save_dirty(|descriptors, _pages| persist(descriptors))
///     .build()?;
/// ```
pub struct PageCacheBuilder<D> {
    name: String,
    options: CacheOptions,
    partitions: usize,
    clean_size_bytes: i64,
    max_dirty_pages_per_flush: usize,
    max_pages_per_inline_eviction: usize,
    max_inline_evictors: usize,
    max_skip_pages_per_inline_eviction: usize,
    max_flushes_inline: usize,
    additional_bytes_per_page: usize,
    out_of_memory_protection_bytes: i64,
    use_all_ram: bool,
    severe_pressure_per1000: i64,
    aggressive_evict_per1000: i64,
    healthy_size_per1000: i64,
    evict_low_threshold_per1000: i64,
    free_clean_page: Option<FreeCleanPageCb<D>>,
    save_dirty: Option<SaveDirtyCb<D>>,
    save_init: Option<SaveInitCb>,
    dynamic_target_size: Option<DynamicTargetSizeCb>,
    nominal_page_size: Option<NominalPageSizeCb<D>>,
    memory_trim: Option<MemoryTrimCb>,
}

impl<D> PageCacheBuilder<D> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: CacheOptions::default(),
            partitions: 0,
            clean_size_bytes: 32 * 1024 * 1024,
            max_dirty_pages_per_flush: 64,
            max_pages_per_inline_eviction: 32,
            max_inline_evictors: 1 + num_cpus::get() / 2,
            max_skip_pages_per_inline_eviction: 64,
            max_flushes_inline: 2,
            additional_bytes_per_page: 0,
            out_of_memory_protection_bytes: 0,
            use_all_ram: false,
            severe_pressure_per1000: SEVERE_PRESSURE_PER1000,
            aggressive_evict_per1000: AGGRESSIVE_EVICT_PER1000,
            healthy_size_per1000: HEALTHY_SIZE_PER1000,
            evict_low_threshold_per1000: EVICT_LOW_THRESHOLD_PER1000,
            free_clean_page: None,
            save_dirty: None,
            save_init: None,
            dynamic_target_size: None,
            nominal_page_size: None,
            memory_trim: None,
        }
    }

    /// Target size of the clean queue, in bytes (minimum 1 MiB).
    pub fn clean_size_bytes(mut self, bytes: usize) -> Self {
        self.clean_size_bytes = bytes as i64;
        self
    }

    pub fn options(mut self, options: CacheOptions) -> Self {
        self.options = options;
        self
    }

    /// Index partition count; 0 selects twice the CPU count. Clamped to
    /// `[4, 256]`.
    pub fn partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn max_dirty_pages_per_flush(mut self, pages: usize) -> Self {
        self.max_dirty_pages_per_flush = pages;
        self
    }

    pub fn max_pages_per_inline_eviction(mut self, pages: usize) -> Self {
        self.max_pages_per_inline_eviction = pages;
        self
    }

    pub fn max_inline_evictors(mut self, evictors: usize) -> Self {
        self.max_inline_evictors = evictors;
        self
    }

    pub fn max_skip_pages_per_inline_eviction(mut self, pages: usize) -> Self {
        self.max_skip_pages_per_inline_eviction = pages;
        self
    }

    pub fn max_flushes_inline(mut self, flushes: usize) -> Self {
        self.max_flushes_inline = flushes;
        self
    }

    /// Fixed-length custom data tail carried by every page.
    pub fn additional_bytes_per_page(mut self, bytes: usize) -> Self {
        self.additional_bytes_per_page = bytes;
        self
    }

    /// Keep at least this much system memory available; 0 disables the
    /// probe.
    pub fn out_of_memory_protection_bytes(mut self, bytes: usize) -> Self {
        self.out_of_memory_protection_bytes = bytes as i64;
        self
    }

    /// Grow the target size into all memory above the protection floor.
    pub fn use_all_ram(mut self, use_all_ram: bool) -> Self {
        self.use_all_ram = use_all_ram;
        self
    }

    /// Override the per1000 pressure thresholds, highest first.
    pub fn pressure_thresholds(
        mut self,
        severe: i64,
        aggressive: i64,
        healthy: i64,
        low_water: i64,
    ) -> Self {
        self.severe_pressure_per1000 = severe;
        self.aggressive_evict_per1000 = aggressive;
        self.healthy_size_per1000 = healthy;
        self.evict_low_threshold_per1000 = low_water;
        self
    }

    /// Required: called with the payload of every page the cache frees.
    pub fn free_clean_page(mut self, cb: impl Fn(FreedPage<D>) + Send + Sync + 'static) -> Self {
        self.free_clean_page = Some(Box::new(cb));
        self
    }

    /// Called with every batch of dirty pages to persist.
    pub fn save_dirty(
        mut self,
        cb: impl Fn(&[PageDescriptor], &[Arc<Page<D>>]) + Send + Sync + 'static,
    ) -> Self {
        self.save_dirty = Some(Box::new(cb));
        self
    }

    pub fn save_init(mut self, cb: impl Fn(SectionId) + Send + Sync + 'static) -> Self {
        self.save_init = Some(Box::new(cb));
        self
    }

    /// Dynamic target size source. Setting this disables the
    /// out-of-memory probe and `use_all_ram`.
    pub fn dynamic_target_cache_size(mut self, cb: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.dynamic_target_size = Some(Box::new(cb));
        self
    }

    pub fn nominal_page_size(mut self, cb: impl Fn(&D) -> usize + Send + Sync + 'static) -> Self {
        self.nominal_page_size = Some(Box::new(cb));
        self
    }

    /// Invoked by the evictor thread, at most once per second, after a
    /// cleanup pass under aggressive pressure.
    pub fn memory_trim(mut self, cb: impl Fn() + Send + Sync + 'static) -> Self {
        self.memory_trim = Some(Box::new(cb));
        self
    }

    pub(crate) fn into_config(self) -> Result<CacheConfig<D>> {
        let free_clean_page = self.free_clean_page.ok_or_else(|| {
            CacheError::Configuration("a free_clean_page callback is required".into())
        })?;

        if !(self.severe_pressure_per1000 > self.aggressive_evict_per1000
            && self.aggressive_evict_per1000 > self.healthy_size_per1000
            && self.healthy_size_per1000 > self.evict_low_threshold_per1000
            && self.evict_low_threshold_per1000 > 0)
        {
            return Err(CacheError::Configuration(
                "pressure thresholds must be strictly decreasing and positive".into(),
            ));
        }

        let max_dirty_pages_per_call = self.max_dirty_pages_per_flush.max(1);
        let mut max_flushes_inline = self.max_flushes_inline;
        if max_flushes_inline * max_dirty_pages_per_call < 2 {
            max_flushes_inline = 2;
        }

        let mut partitions = self.partitions;
        if partitions == 0 {
            partitions = num_cpus::get() * 2;
        }
        let partitions = partitions.clamp(4, 256);

        let dynamic_target = self.dynamic_target_size.is_some();

        Ok(CacheConfig {
            name: self.name,
            options: self.options,
            partitions,
            clean_size: self.clean_size_bytes.max(MIN_CLEAN_SIZE),
            max_dirty_pages_per_call,
            max_pages_per_inline_eviction: self.max_pages_per_inline_eviction.max(1),
            max_skip_pages_per_inline_eviction: self.max_skip_pages_per_inline_eviction.max(2),
            max_flushes_inline,
            max_workers_evict_inline: self.max_inline_evictors,
            additional_bytes_per_page: self.additional_bytes_per_page,
            out_of_memory_protection_bytes: if dynamic_target {
                0
            } else {
                self.out_of_memory_protection_bytes
            },
            use_all_ram: self.use_all_ram && !dynamic_target,
            severe_pressure_per1000: self.severe_pressure_per1000,
            aggressive_evict_per1000: self.aggressive_evict_per1000,
            healthy_size_per1000: self.healthy_size_per1000,
            evict_low_threshold_per1000: self.evict_low_threshold_per1000,
            hooks: CacheHooks {
                free_clean_page,
                save_dirty: self.save_dirty,
                save_init: self.save_init,
                dynamic_target_size: self.dynamic_target_size,
                nominal_page_size: self.nominal_page_size,
                memory_trim: self.memory_trim,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> PageCacheBuilder<()> {
        PageCacheBuilder::new("test").free_clean_page(|_| {})
    }

    #[test]
    fn test_clean_size_floor() {
        let config = builder().clean_size_bytes(1).into_config().unwrap();
        assert_eq!(config.clean_size, MIN_CLEAN_SIZE);
    }

    #[test]
    fn test_partition_clamping() {
        assert_eq!(builder().partitions(1).into_config().unwrap().partitions, 4);
        assert_eq!(builder().partitions(1000).into_config().unwrap().partitions, 256);
        let auto = builder().partitions(0).into_config().unwrap().partitions;
        assert!((4..=256).contains(&auto));
    }

    #[test]
    fn test_flushes_inline_floor() {
        let config = builder()
            .max_dirty_pages_per_flush(1)
            .max_flushes_inline(1)
            .into_config()
            .unwrap();
        assert_eq!(config.max_flushes_inline, 2);
    }

    #[test]
    fn test_free_callback_required() {
        let result = PageCacheBuilder::<()>::new("test").into_config();
        assert!(result.is_err());
    }

    #[test]
    fn test_threshold_validation() {
        let result = builder().pressure_thresholds(900, 990, 980, 970).into_config();
        assert!(result.is_err());
    }

    #[test]
    fn test_dynamic_target_disables_memory_probe() {
        let config = builder()
            .out_of_memory_protection_bytes(1024)
            .use_all_ram(true)
            .dynamic_target_cache_size(|| 1024)
            .into_config()
            .unwrap();
        assert_eq!(config.out_of_memory_protection_bytes, 0);
        assert!(!config.use_all_ram);
    }

    #[test]
    fn test_assumed_size_round_trip() {
        let config = builder().additional_bytes_per_page(11).into_config().unwrap();
        let assumed = config.assumed_size(4096);
        assert!(assumed > 4096);
        assert_eq!(config.size_from_assumed(assumed), 4096);
    }
}
