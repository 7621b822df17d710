// RustyPageCache - Concurrent page cache for time-series storage engines
// Core library module

pub mod cache;
pub mod error;

pub use cache::{
    CacheOptions, CacheStatistics, FreedPage, MetricId, MigrationOutcome, Page, PageCache,
    PageCacheBuilder, PageDescriptor, PageEntry, PageHandle, QueueStatistics, SearchMethod,
    SectionId,
};
pub use error::{CacheError, Result};
