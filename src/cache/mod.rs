//! # Time-Series Page Cache
//!
//! A concurrent, in-memory cache of fixed-identity pages indexed by
//! `(section, metric_id, start_time)`. Pages move through a three-state
//! lifecycle with strict invariants:
//!
//! - **HOT**: currently being appended to by a producer
//! - **DIRTY**: closed by its producer, awaiting a durable save
//! - **CLEAN**: durable; its memory may be reclaimed
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Page Cache                         │
//! │                                                          │
//! │  ┌─────────────┐  ┌───────────────┐  ┌───────────────┐  │
//! │  │Sharded Index│  │ HOT / DIRTY   │  │  CLEAN (LRU)  │  │
//! │  │(per-metric  │  │ (per-section  │  │  (cache-wide  │  │
//! │  │ partitions) │  │  FIFO lists)  │  │    list)      │  │
//! │  └─────────────┘  └───────────────┘  └───────────────┘  │
//! │                                                          │
//! │  ┌──────────────────────────────────────────────────┐   │
//! │  │  Sizing & Pressure (per1000, inline hooks,       │   │
//! │  │  evictor thread, flush engine)                   │   │
//! │  └──────────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//!          │                        │
//!          ▼                        ▼
//!    save callback            free callback
//!    (dirty batches)          (evicted payloads)
//! ```
//!
//! The cache owns no I/O: durability and payload memory are delegated to
//! the save and free callbacks supplied at construction. Payloads are an
//! opaque generic type.
//!
//! ## Usage
//!
//! ```no_run
//! use rusty_pagecache::cache::{PageCacheBuilder, PageEntry, SearchMethod};
//!
//! # fn main() -> rusty_pagecache::Result<()> {
//! let cache = PageCacheBuilder::<Vec<u8>>::new("main")
//!     .clean_size_bytes(32 * 1024 * 1024)
//!     .max_dirty_pages_per_flush(64)
//!     .free_clean_page(|freed| drop(freed.data))
//!     .save_dirty(|descriptors, _pages| {
//!         for d in descriptors {
//!             // persist the page range [d.start_time_s, d.end_time_s]
//!             let _ = d;
//!         }
//!     })
//!     .build()?;
//!
//! let (page, added) = cache.add_and_acquire(PageEntry {
//!     section: 1,
//!     metric_id: 10,
//!     start_time_s: 1000,
//!     end_time_s: 1000,
//!     update_every_s: 1,
//!     size: 4096,
//!     hot: true,
//!     custom_data: None,
//!     data: vec![0u8; 4096],
//! });
//! assert!(added);
//!
//! page.hot_set_end_time_s(1060, 0);
//! page.hot_to_dirty_and_release(false);
//!
//! let found = cache.get_and_acquire(1, 10, 1030, SearchMethod::Closest);
//! assert!(found.is_some());
//! # Ok(())
//! # }
//! ```

mod config;
mod evict;
mod flush;
mod index;
mod manager;
mod page;
mod queue;
mod refcount;
mod sizing;
mod stats;
mod waitq;

pub use config::{
    CacheOptions, DynamicTargetSizeCb, FreeCleanPageCb, MemoryTrimCb, NominalPageSizeCb,
    PageCacheBuilder, SaveDirtyCb, SaveInitCb,
};
pub use index::SearchMethod;
pub use manager::{MigrationOutcome, PageCache, PageHandle};
pub use page::{FreedPage, MetricId, Page, PageDescriptor, PageEntry, SectionId};
pub use stats::{CacheStatistics, QueueStatistics, SizeHistogramBucket, SizeHistogramSnapshot};
