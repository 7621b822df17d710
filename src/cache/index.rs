// # Sharded Page Index
//
// An ordered map `section -> metric -> start_time -> page`, split into
// partitions selected by a stable hash of the metric id, each under its
// own reader/writer lock. Lookups acquire the page while the partition
// read lock pins it in place; a page whose acquire fails (tagged for
// deletion) is skipped as if it were not there.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::cache::page::{MetricId, Page, SectionId};

pub(crate) type IndexPartition<D> =
    BTreeMap<SectionId, BTreeMap<MetricId, BTreeMap<i64, Arc<Page<D>>>>>;

/// Lookup methods for [`get_and_acquire`](crate::cache::PageCache::get_and_acquire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMethod {
    /// The page starting exactly at the requested time.
    Exact,
    /// The page covering the requested time, else the first page after it.
    Closest,
    /// The first page starting at or after the requested time.
    First,
    /// The first page starting strictly after the requested time.
    Next,
    /// The last page starting at or before the requested time.
    Last,
    /// The last page starting strictly before the requested time.
    Prev,
}

pub(crate) enum InsertResult<D> {
    /// The caller's page is now indexed.
    Inserted,
    /// An identical identity already existed and was acquired.
    Found(Arc<Page<D>>),
    /// An identical identity exists but is being deleted; retry shortly.
    Retry,
}

pub(crate) struct PageIndex<D> {
    partitions: Box<[RwLock<IndexPartition<D>>]>,
}

impl<D> PageIndex<D> {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: (0..partitions)
                .map(|_| RwLock::new(BTreeMap::new()))
                .collect(),
        }
    }

    #[inline]
    pub fn partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Stable partition selection by multiplicative hashing of the metric id.
    #[inline(always)]
    pub fn partition_for(&self, metric_id: MetricId) -> usize {
        (metric_id.wrapping_mul(0x9e37_79b9_7f4a_7c15) as usize) % self.partitions.len()
    }

    #[inline]
    pub fn write_partition(&self, partition: usize) -> RwLockWriteGuard<'_, IndexPartition<D>> {
        self.partitions[partition].write()
    }

    #[inline]
    pub fn try_write_partition(
        &self,
        partition: usize,
        force: bool,
    ) -> Option<RwLockWriteGuard<'_, IndexPartition<D>>> {
        if force {
            Some(self.partitions[partition].write())
        } else {
            self.partitions[partition].try_write()
        }
    }

    #[inline]
    fn read_partition(&self, partition: usize) -> RwLockReadGuard<'_, IndexPartition<D>> {
        self.partitions[partition].read()
    }

    /// One attempt to index `page` under its identity.
    ///
    /// On a conflict the existing page is acquired through `acquire`
    /// while the partition write lock still pins it; a page that cannot
    /// be acquired is about to vanish, so the caller should retry.
    pub fn insert_or_acquire(
        &self,
        page: &Arc<Page<D>>,
        acquire: impl FnOnce(&Arc<Page<D>>) -> bool,
    ) -> InsertResult<D> {
        let partition = self.partition_for(page.metric_id());
        let mut part = self.write_partition(partition);

        let slot = part
            .entry(page.section())
            .or_default()
            .entry(page.metric_id())
            .or_default()
            .entry(page.start_time_s());

        match slot {
            std::collections::btree_map::Entry::Vacant(v) => {
                v.insert(Arc::clone(page));
                InsertResult::Inserted
            }
            std::collections::btree_map::Entry::Occupied(o) => {
                let existing = Arc::clone(o.get());
                if acquire(&existing) {
                    InsertResult::Found(existing)
                } else {
                    InsertResult::Retry
                }
            }
        }
    }

    /// Remove a page from a partition the caller has write-locked,
    /// pruning emptied metric and section maps.
    ///
    /// The index must contain exactly this page under its identity;
    /// anything else is corruption and aborts.
    pub fn remove_locked(&self, part: &mut IndexPartition<D>, page: &Arc<Page<D>>) {
        let section = page.section();
        let metric_id = page.metric_id();
        let start_time_s = page.start_time_s();

        let metrics = part
            .get_mut(&section)
            .unwrap_or_else(|| panic!("section {section:#x} of an indexed page does not exist"));
        let times = metrics.get_mut(&metric_id).unwrap_or_else(|| {
            panic!("metric {metric_id:#x} in section {section:#x} does not exist")
        });

        let removed = times.remove(&start_time_s).unwrap_or_else(|| {
            panic!(
                "page with start time {start_time_s} of metric {metric_id:#x} \
                 in section {section:#x} does not exist"
            )
        });
        if !Arc::ptr_eq(&removed, page) {
            panic!(
                "page with start time {start_time_s} of metric {metric_id:#x} \
                 in section {section:#x} resolved to a different page"
            );
        }

        if times.is_empty() {
            metrics.remove(&metric_id);
        }
        if metrics.is_empty() {
            part.remove(&section);
        }
    }

    /// Remove a page, taking the partition write lock.
    pub fn remove(&self, page: &Arc<Page<D>>) {
        let partition = self.partition_for(page.metric_id());
        let mut part = self.write_partition(partition);
        self.remove_locked(&mut part, page);
    }

    /// Look a page up and acquire it under the partition read lock.
    pub fn find_and_acquire(
        &self,
        section: SectionId,
        metric_id: MetricId,
        start_time_s: i64,
        method: SearchMethod,
        mut acquire: impl FnMut(&Arc<Page<D>>) -> bool,
    ) -> Option<Arc<Page<D>>> {
        let partition = self.partition_for(metric_id);
        let part = self.read_partition(partition);

        let times = part.get(&section)?.get(&metric_id)?;

        match method {
            SearchMethod::Exact => Self::acquire_exact(times, start_time_s, &mut acquire),
            SearchMethod::First => {
                Self::acquire_ascending(times, Bound::Included(start_time_s), &mut acquire)
            }
            SearchMethod::Next => {
                Self::acquire_ascending(times, Bound::Excluded(start_time_s), &mut acquire)
            }
            SearchMethod::Last => {
                Self::acquire_descending(times, Bound::Included(start_time_s), &mut acquire)
            }
            SearchMethod::Prev => {
                Self::acquire_descending(times, Bound::Excluded(start_time_s), &mut acquire)
            }
            SearchMethod::Closest => {
                if let Some(page) = Self::acquire_exact(times, start_time_s, &mut acquire) {
                    return Some(page);
                }
                if let Some(page) = Self::acquire_covering(times, start_time_s, &mut acquire) {
                    return Some(page);
                }
                Self::acquire_ascending(times, Bound::Excluded(start_time_s), &mut acquire)
            }
        }
    }

    fn acquire_exact(
        times: &BTreeMap<i64, Arc<Page<D>>>,
        start_time_s: i64,
        acquire: &mut impl FnMut(&Arc<Page<D>>) -> bool,
    ) -> Option<Arc<Page<D>>> {
        let page = times.get(&start_time_s)?;
        acquire(page).then(|| Arc::clone(page))
    }

    fn acquire_ascending(
        times: &BTreeMap<i64, Arc<Page<D>>>,
        lower: Bound<i64>,
        acquire: &mut impl FnMut(&Arc<Page<D>>) -> bool,
    ) -> Option<Arc<Page<D>>> {
        times
            .range((lower, Bound::Unbounded))
            .map(|(_, p)| p)
            .find(|p| acquire(p))
            .cloned()
    }

    fn acquire_descending(
        times: &BTreeMap<i64, Arc<Page<D>>>,
        upper: Bound<i64>,
        acquire: &mut impl FnMut(&Arc<Page<D>>) -> bool,
    ) -> Option<Arc<Page<D>>> {
        times
            .range((Bound::Unbounded, upper))
            .rev()
            .map(|(_, p)| p)
            .find(|p| acquire(p))
            .cloned()
    }

    /// Best page covering `t` among those starting at or before it.
    ///
    /// Walks start times downwards while the pages still cover `t` and
    /// picks the finest update-every (ties broken towards the earlier
    /// start time), so overlapping pages resolve deterministically.
    fn acquire_covering(
        times: &BTreeMap<i64, Arc<Page<D>>>,
        t: i64,
        acquire: &mut impl FnMut(&Arc<Page<D>>) -> bool,
    ) -> Option<Arc<Page<D>>> {
        let mut covering: Vec<&Arc<Page<D>>> = Vec::new();
        for (_, page) in times.range((Bound::Unbounded, Bound::Excluded(t))).rev() {
            if page.end_time_s() < t {
                break;
            }
            covering.push(page);
        }

        // preference order: finest cadence first, earlier start within ties
        covering.reverse();
        covering.sort_by_key(|p| p.update_every_s());

        for page in covering {
            if acquire(page) {
                return Some(Arc::clone(page));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(start: i64, end: i64, update_every: u32) -> Arc<Page<u32>> {
        Arc::new(Page::new(1, 10, start, end, update_every, 4096, 1, Box::from([]), 0))
    }

    fn build_index(pages: &[Arc<Page<u32>>]) -> PageIndex<u32> {
        let index = PageIndex::new(4);
        for p in pages {
            match index.insert_or_acquire(p, |_| unreachable!()) {
                InsertResult::Inserted => {}
                _ => panic!("duplicate page in test fixture"),
            }
        }
        index
    }

    fn find(index: &PageIndex<u32>, t: i64, method: SearchMethod) -> Option<i64> {
        index
            .find_and_acquire(1, 10, t, method, |_| true)
            .map(|p| p.start_time_s())
    }

    #[test]
    fn test_search_methods() {
        let pages = [page(100, 200, 1), page(200, 300, 1), page(300, 400, 1)];
        let index = build_index(&pages);

        assert_eq!(find(&index, 200, SearchMethod::Exact), Some(200));
        assert_eq!(find(&index, 250, SearchMethod::Exact), None);
        assert_eq!(find(&index, 250, SearchMethod::Closest), Some(200));
        assert_eq!(find(&index, 305, SearchMethod::Closest), Some(300));
        assert_eq!(find(&index, 200, SearchMethod::Next), Some(300));
        assert_eq!(find(&index, 200, SearchMethod::Prev), Some(100));
        assert_eq!(find(&index, 200, SearchMethod::First), Some(200));
        assert_eq!(find(&index, 250, SearchMethod::First), Some(300));
        assert_eq!(find(&index, 200, SearchMethod::Last), Some(200));
        assert_eq!(find(&index, 1000, SearchMethod::Closest), None);
        assert_eq!(find(&index, 50, SearchMethod::Closest), Some(100));
    }

    #[test]
    fn test_closest_prefers_finer_cadence() {
        // both pages cover t=150; the finer cadence wins
        let pages = [page(100, 200, 10), page(120, 220, 1)];
        let index = build_index(&pages);
        assert_eq!(find(&index, 150, SearchMethod::Closest), Some(120));
    }

    #[test]
    fn test_closest_ties_prefer_earlier_start() {
        let pages = [page(100, 200, 1), page(120, 220, 1)];
        let index = build_index(&pages);
        assert_eq!(find(&index, 150, SearchMethod::Closest), Some(100));
    }

    #[test]
    fn test_deleted_pages_are_skipped() {
        let pages = [page(100, 200, 1), page(200, 300, 1)];
        let index = build_index(&pages);

        let found = index.find_and_acquire(1, 10, 100, SearchMethod::First, |p| {
            p.start_time_s() != 100
        });
        assert_eq!(found.map(|p| p.start_time_s()), Some(200));
    }

    #[test]
    fn test_remove_prunes_empty_maps() {
        let p = page(100, 200, 1);
        let index = build_index(std::slice::from_ref(&p));
        index.remove(&p);

        let part = index.read_partition(index.partition_for(10));
        assert!(part.is_empty());
    }

    #[test]
    fn test_insert_conflict_acquires_existing() {
        let p1 = page(100, 200, 1);
        let index = build_index(std::slice::from_ref(&p1));

        let dup = page(100, 250, 1);
        match index.insert_or_acquire(&dup, |_| true) {
            InsertResult::Found(existing) => assert!(Arc::ptr_eq(&existing, &p1)),
            _ => panic!("expected the existing page"),
        }
    }
}
