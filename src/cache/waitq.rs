// # Wait-Priority Lock
//
// A single-owner mutex with four named priority classes. When the holder
// releases, the waiter from the highest non-empty class is woken first;
// waiters within a class are served in condvar queue order.
//
// Collectors sit on the hot write path and must not be starved by bulk
// evictors; evictors take precedence over flushers so the clean queue can
// drain under memory pressure; background scans use the lowest class.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex};

/// Priority classes, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub(crate) enum LockPriority {
    Collectors = 0,
    Evictors = 1,
    Flushers = 2,
    Low = 3,
}

const PRIORITY_CLASSES: usize = 4;

struct Gate {
    locked: bool,
    waiting: [u32; PRIORITY_CLASSES],
}

/// Single-owner lock over `T` with priority-ordered wakeups.
///
/// The gate mutex protects only the lock state; `data` is accessed
/// exclusively by the guard while `locked` is true.
pub(crate) struct WaitQueue<T> {
    gate: Mutex<Gate>,
    wakeup: [Condvar; PRIORITY_CLASSES],
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by the gate's `locked` flag;
// a guard exists only while this thread holds the logical lock.
unsafe impl<T: Send> Send for WaitQueue<T> {}
unsafe impl<T: Send> Sync for WaitQueue<T> {}

impl<T> WaitQueue<T> {
    pub fn new(data: T) -> Self {
        Self {
            gate: Mutex::new(Gate {
                locked: false,
                waiting: [0; PRIORITY_CLASSES],
            }),
            wakeup: [Condvar::new(), Condvar::new(), Condvar::new(), Condvar::new()],
            data: UnsafeCell::new(data),
        }
    }

    /// Block until the lock is held.
    pub fn lock(&self, prio: LockPriority) -> WaitQueueGuard<'_, T> {
        let class = prio as usize;
        let mut gate = self.gate.lock();

        if !gate.locked {
            gate.locked = true;
        } else {
            gate.waiting[class] += 1;
            loop {
                self.wakeup[class].wait(&mut gate);
                if !gate.locked {
                    gate.locked = true;
                    break;
                }
            }
            gate.waiting[class] -= 1;
        }

        drop(gate);
        WaitQueueGuard { queue: self }
    }

    /// Non-blocking acquisition attempt.
    pub fn try_lock(&self, _prio: LockPriority) -> Option<WaitQueueGuard<'_, T>> {
        let mut gate = self.gate.lock();
        if gate.locked {
            return None;
        }
        gate.locked = true;
        drop(gate);
        Some(WaitQueueGuard { queue: self })
    }

    fn unlock(&self) {
        let mut gate = self.gate.lock();
        gate.locked = false;

        // wake the highest non-empty class
        for class in 0..PRIORITY_CLASSES {
            if gate.waiting[class] > 0 {
                self.wakeup[class].notify_one();
                break;
            }
        }
    }
}

pub(crate) struct WaitQueueGuard<'a, T> {
    queue: &'a WaitQueue<T>,
}

impl<T> Deref for WaitQueueGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: this guard holds the logical lock
        unsafe { &*self.queue.data.get() }
    }
}

impl<T> DerefMut for WaitQueueGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: this guard holds the logical lock exclusively
        unsafe { &mut *self.queue.data.get() }
    }
}

impl<T> Drop for WaitQueueGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.queue.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_lock_unlock() {
        let q = WaitQueue::new(0u32);
        {
            let mut g = q.lock(LockPriority::Collectors);
            *g += 1;
        }
        assert_eq!(*q.lock(LockPriority::Low), 1);
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let q = WaitQueue::new(());
        let g = q.lock(LockPriority::Flushers);
        assert!(q.try_lock(LockPriority::Collectors).is_none());
        drop(g);
        assert!(q.try_lock(LockPriority::Collectors).is_some());
    }

    #[test]
    fn test_higher_priority_wakes_first() {
        let q = Arc::new(WaitQueue::new(Vec::<usize>::new()));
        let held = q.lock(LockPriority::Collectors);

        let spawn_waiter = |prio: LockPriority, tag: usize| {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                let mut g = q.lock(prio);
                g.push(tag);
            })
        };

        // low-priority waiter first, then an evictor
        let low = spawn_waiter(LockPriority::Low, 3);
        std::thread::sleep(Duration::from_millis(100));
        let evictor = spawn_waiter(LockPriority::Evictors, 1);
        std::thread::sleep(Duration::from_millis(100));

        drop(held);
        low.join().unwrap();
        evictor.join().unwrap();

        let order = q.lock(LockPriority::Low);
        assert_eq!(*order, vec![1, 3], "evictor should win over low priority");
    }

    #[test]
    fn test_mutual_exclusion() {
        let q = Arc::new(WaitQueue::new(0u64));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let q = Arc::clone(&q);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                std::thread::spawn(move || {
                    let prio = match i % 4 {
                        0 => LockPriority::Collectors,
                        1 => LockPriority::Evictors,
                        2 => LockPriority::Flushers,
                        _ => LockPriority::Low,
                    };
                    for _ in 0..1000 {
                        let mut g = q.lock(prio);
                        let n = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(n, Ordering::SeqCst);
                        *g += 1;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(*q.lock(LockPriority::Low), 8 * 1000);
    }
}
