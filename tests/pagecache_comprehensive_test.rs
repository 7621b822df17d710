// Comprehensive integration tests for the page cache: lifecycle round
// trips, lookup semantics, pressure-driven eviction and concurrent
// deletion safety.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use rusty_pagecache::{
    CacheOptions, MetricId, PageCache, PageCacheBuilder, PageDescriptor, PageEntry, SearchMethod,
    SectionId,
};

fn entry(
    section: SectionId,
    metric_id: MetricId,
    start: i64,
    end: i64,
    hot: bool,
    custom_data: Option<Vec<u8>>,
) -> PageEntry<()> {
    PageEntry {
        section,
        metric_id,
        start_time_s: start,
        end_time_s: end,
        update_every_s: 1,
        size: 4096,
        hot,
        custom_data,
        data: (),
    }
}

#[test]
fn test_custom_data_round_trip() {
    let cache: PageCache<()> = PageCacheBuilder::new("custom-data")
        .partitions(4)
        .additional_bytes_per_page(11)
        .free_clean_page(|_| {})
        .save_dirty(|_, _| {})
        .build()
        .unwrap();

    let (page, added) = cache.add_and_acquire(entry(
        1,
        10,
        100,
        1000,
        false,
        Some(b"0123456789\0".to_vec()),
    ));
    assert!(added);
    assert_eq!(&page.custom_data()[..10], b"0123456789");

    // overwrite in place while holding the reference
    page.custom_data_mut().copy_from_slice(b"ABCDEFGHIJ\0");
    drop(page);

    let page = cache
        .get_and_acquire(1, 10, 100, SearchMethod::Exact)
        .expect("page must still be cached");
    assert_eq!(&page.custom_data()[..10], b"ABCDEFGHIJ");
}

#[test]
fn test_hot_to_dirty_saved_on_destroy() {
    let saved: Arc<Mutex<Vec<PageDescriptor>>> = Arc::new(Mutex::new(Vec::new()));
    let saved_cb = Arc::clone(&saved);

    let cache: PageCache<()> = PageCacheBuilder::new("hot-dirty-save")
        .partitions(4)
        .additional_bytes_per_page(11)
        .free_clean_page(|_| {})
        .save_dirty(move |descriptors, _pages| {
            saved_cb.lock().unwrap().extend_from_slice(descriptors);
        })
        .build()
        .unwrap();

    let (page, added) = cache.add_and_acquire(entry(1, 10, 1001, 2000, true, None));
    assert!(added);

    page.hot_set_end_time_s(2001, 0);
    page.hot_to_dirty_and_release(false);

    cache.destroy(true);

    let saved = saved.lock().unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].start_time_s, 1001);
    assert_eq!(saved[0].end_time_s, 2001);
}

#[test]
fn test_destroy_flushes_each_section_separately() {
    // batches are per section, so each section produces its own save call
    let batches: Arc<Mutex<Vec<(SectionId, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let batches_cb = Arc::clone(&batches);

    let cache: PageCache<()> = PageCacheBuilder::new("destroy-sections")
        .partitions(4)
        .free_clean_page(|_| {})
        .save_dirty(move |descriptors, _pages| {
            batches_cb
                .lock()
                .unwrap()
                .push((descriptors[0].section, descriptors.len()));
        })
        .build()
        .unwrap();

    for section in [2u64, 3u64] {
        let (page, _) = cache.add_and_acquire(entry(section, 10, 1001, 2000, true, None));
        page.hot_set_end_time_s(2001, 0);
        page.hot_to_dirty_and_release(false);
    }

    cache.destroy(true);

    let mut batches = batches.lock().unwrap();
    batches.sort();
    assert_eq!(*batches, vec![(2, 1), (3, 1)]);
}

#[test]
fn test_lookup_methods() {
    let cache: PageCache<()> = PageCacheBuilder::new("lookup")
        .partitions(4)
        .free_clean_page(|_| {})
        .save_dirty(|_, _| {})
        .build()
        .unwrap();

    for start in [100i64, 200, 300] {
        let (page, _) = cache.add_and_acquire(entry(1, 10, start, start + 100, false, None));
        drop(page);
    }

    let start_of = |method: SearchMethod, t: i64| {
        cache
            .get_and_acquire(1, 10, t, method)
            .map(|p| p.start_time_s())
    };

    assert_eq!(start_of(SearchMethod::Exact, 200), Some(200));
    assert_eq!(start_of(SearchMethod::Closest, 250), Some(200));
    assert_eq!(start_of(SearchMethod::Closest, 305), Some(300));
    assert_eq!(start_of(SearchMethod::Next, 200), Some(300));
    assert_eq!(start_of(SearchMethod::Prev, 200), Some(100));
    assert_eq!(start_of(SearchMethod::First, 150), Some(200));
    assert_eq!(start_of(SearchMethod::Last, 250), Some(200));
    assert_eq!(start_of(SearchMethod::Closest, 1000), None);
}

#[test]
fn test_pressure_driven_eviction() {
    let cache: PageCache<()> = PageCacheBuilder::new("pressure")
        .clean_size_bytes(1024 * 1024)
        .partitions(4)
        .options(CacheOptions {
            evict_no_inline: false,
            flush_no_inline: false,
            autoscale: false,
        })
        .free_clean_page(|_| {})
        .save_dirty(|_, _| {})
        .build()
        .unwrap();

    // four times the configured clean target
    for metric in 0..1024u64 {
        let (page, _) = cache.add_and_acquire(entry(1, metric, 100, 200, false, None));
        drop(page);
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let stats = cache.statistics();
        let settled = cache.current_cache_size() <= cache.wanted_cache_size() + 64 * 1024;
        if settled && stats.events_cache_needs_space_aggressively >= 1 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "cache did not settle below its target: current {} wanted {} events {}",
            cache.current_cache_size(),
            cache.wanted_cache_size(),
            stats.events_cache_needs_space_aggressively
        );
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_deletion_race_safety() {
    let freed = Arc::new(AtomicU64::new(0));
    let freed_cb = Arc::clone(&freed);

    let cache: Arc<PageCache<()>> = Arc::new(
        PageCacheBuilder::new("deletion-race")
            .partitions(4)
            .free_clean_page(move |_| {
                freed_cb.fetch_add(1, Ordering::Relaxed);
            })
            .save_dirty(|_, _| {})
            .build()
            .unwrap(),
    );

    let stop = Arc::new(AtomicBool::new(false));

    let reader = {
        let cache = Arc::clone(&cache);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let mut hits = 0u64;
            while !stop.load(Ordering::Relaxed) {
                if let Some(page) = cache.get_and_acquire(1, 10, 100, SearchMethod::Exact) {
                    // either a live page or nothing; never garbage
                    assert_eq!(page.section(), 1);
                    assert_eq!(page.metric_id(), 10);
                    assert_eq!(page.start_time_s(), 100);
                    hits += 1;
                }
            }
            hits
        })
    };

    let deleter = {
        let cache = Arc::clone(&cache);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let mut rounds = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let (page, _) = cache.add_and_acquire(entry(1, 10, 100, 200, false, None));
                page.to_clean_evict_or_release();
                rounds += 1;
            }
            rounds
        })
    };

    std::thread::sleep(Duration::from_secs(10));
    stop.store(true, Ordering::Relaxed);

    let hits = reader.join().unwrap();
    let rounds = deleter.join().unwrap();
    assert!(rounds > 0);
    let _ = hits;

    cache.free_all_unreferenced_clean_pages();

    let stats = cache.statistics();
    assert_eq!(stats.acquires, stats.releases);
    assert_eq!(stats.referenced_entries, 0);
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.added_entries, stats.removed_entries);
    assert!(freed.load(Ordering::Relaxed) > 0);
}

#[test]
fn test_queue_accounting_matches_contents() {
    let cache: PageCache<()> = PageCacheBuilder::new("accounting")
        .partitions(4)
        .free_clean_page(|_| {})
        .save_dirty(|_, _| {})
        .build()
        .unwrap();

    let mut handles = Vec::new();
    for metric in 0..8u64 {
        handles.push(cache.add_and_acquire(entry(1, metric, 100, 200, true, None)).0);
    }
    for metric in 8..20u64 {
        let (page, _) = cache.add_and_acquire(entry(1, metric, 100, 200, false, None));
        drop(page);
    }

    let stats = cache.statistics();
    assert_eq!(stats.hot.entries, 8);
    assert_eq!(stats.clean.entries, 12);
    assert_eq!(stats.entries, 20);
    assert_eq!(cache.count_hot_pages_matching(1, |_| true), 8);
    assert_eq!(cache.count_clean_pages_matching(1, |_| true), 12);

    // queue sizes add up to the page sizes
    assert_eq!(
        stats.hot.size + stats.clean.size,
        stats.size,
        "queue sizes should cover all pages"
    );

    // the added counters are monotonic and already include everything
    assert_eq!(stats.added_entries, 20);
    assert_eq!(stats.removed_entries, 0);

    drop(handles);
}

#[test]
fn test_flush_waits_for_full_batches() {
    let saved = Arc::new(AtomicU64::new(0));
    let saved_cb = Arc::clone(&saved);

    let cache: PageCache<()> = PageCacheBuilder::new("batching")
        .partitions(4)
        .max_dirty_pages_per_flush(4)
        .free_clean_page(|_| {})
        .save_dirty(move |descriptors, _pages| {
            saved_cb.fetch_add(descriptors.len() as u64, Ordering::Relaxed);
        })
        .build()
        .unwrap();

    // three dirty pages: below the batch size, a cooperative flush is a no-op
    for metric in 0..3u64 {
        let (page, _) = cache.add_and_acquire(entry(1, metric, 100, 200, true, None));
        page.hot_to_dirty_and_release(true);
    }
    cache.flush_pages();
    assert_eq!(saved.load(Ordering::Relaxed), 0);

    // a fourth one completes the batch
    let (page, _) = cache.add_and_acquire(entry(1, 3, 100, 200, true, None));
    page.hot_to_dirty_and_release(true);
    cache.flush_pages();
    assert_eq!(saved.load(Ordering::Relaxed), 4);

    // and an explicit flush takes whatever remains
    let (page, _) = cache.add_and_acquire(entry(1, 4, 100, 200, true, None));
    page.hot_to_dirty_and_release(true);
    cache.flush_dirty_pages(Some(1));
    assert_eq!(saved.load(Ordering::Relaxed), 5);
}

#[test]
fn test_evict_clean_pages_matching_filter() {
    let cache: PageCache<u32> = PageCacheBuilder::new("filtered-evict")
        .partitions(4)
        .free_clean_page(|_| {})
        .save_dirty(|_, _| {})
        .build()
        .unwrap();

    for metric in 0..6u64 {
        let (page, _) = cache.add_and_acquire(PageEntry {
            section: 1,
            metric_id: metric,
            start_time_s: 100,
            end_time_s: 200,
            update_every_s: 1,
            size: 4096,
            hot: false,
            custom_data: None,
            data: (metric % 2) as u32,
        });
        drop(page);
    }

    cache.evict_clean_pages_matching(|page| *page.data() == 0);

    assert_eq!(cache.count_clean_pages_matching(1, |_| true), 3);
    assert_eq!(cache.count_clean_pages_matching(1, |d| *d == 0), 0);
}

#[test]
fn test_stress_collectors_and_queriers() {
    const METRICS: u64 = 64;
    const COLLECTORS: usize = 4;
    const QUERIERS: usize = 4;

    let cache: Arc<PageCache<()>> = Arc::new(
        PageCacheBuilder::new("stress")
            .clean_size_bytes(4 * 1024 * 1024)
            .max_dirty_pages_per_flush(16)
            .partitions(8)
            .options(CacheOptions {
                evict_no_inline: false,
                flush_no_inline: false,
                autoscale: true,
            })
            .free_clean_page(|_| {})
            .save_dirty(|_, _| {})
            .build()
            .unwrap(),
    );

    let stop = Arc::new(AtomicBool::new(false));
    let mut threads = Vec::new();

    for collector in 0..COLLECTORS {
        let cache = Arc::clone(&cache);
        let stop = Arc::clone(&stop);
        threads.push(std::thread::spawn(move || {
            let metrics_per_collector = METRICS / COLLECTORS as u64;
            let first = collector as u64 * metrics_per_collector;
            let mut start = 1_000_000i64;

            while !stop.load(Ordering::Relaxed) {
                let mut open = Vec::new();
                for metric in first..first + metrics_per_collector {
                    let (page, added) =
                        cache.add_and_acquire(entry(1, metric, start, start, true, None));
                    if added && page.is_hot() {
                        open.push(page);
                    }
                }

                for tick in 1..=10 {
                    for page in &open {
                        page.hot_set_end_time_s(start + tick, 0);
                    }
                }

                for (i, page) in open.into_iter().enumerate() {
                    if i % 10 == 0 {
                        page.to_clean_evict_or_release();
                    } else {
                        page.hot_to_dirty_and_release(false);
                    }
                }

                start += 11;
            }
        }));
    }

    for _ in 0..QUERIERS {
        let cache = Arc::clone(&cache);
        let stop = Arc::clone(&stop);
        threads.push(std::thread::spawn(move || {
            let mut rng = rand::rng();
            while !stop.load(Ordering::Relaxed) {
                let metric = rng.random_range(0..METRICS);
                let t = 1_000_000i64 + rng.random_range(0..2000);
                if let Some(page) = cache.get_and_acquire(1, metric, t, SearchMethod::Closest) {
                    assert!(page.end_time_s() >= page.start_time_s());
                }
            }
        }));
    }

    // a service thread like the one the engine runs
    {
        let cache = Arc::clone(&cache);
        let stop = Arc::clone(&stop);
        threads.push(std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                cache.flush_pages();
                cache.evict_pages(0, 0);
                std::thread::sleep(Duration::from_millis(20));
            }
        }));
    }

    std::thread::sleep(Duration::from_secs(2));
    stop.store(true, Ordering::Relaxed);
    for thread in threads {
        thread.join().unwrap();
    }

    let stats = cache.statistics();
    assert_eq!(stats.referenced_entries, 0);
    assert_eq!(stats.acquires, stats.releases);
    assert!(stats.added_entries >= stats.removed_entries);

    // a full teardown still works after the workout
    match Arc::try_unwrap(cache) {
        Ok(cache) => cache.destroy(true),
        Err(_) => panic!("stray cache reference"),
    }
}
