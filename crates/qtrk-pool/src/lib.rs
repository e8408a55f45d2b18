//! Recycling free list for tracker job records.
//!
//! The queued tracker hands every scheduled ROI to a worker inside a job record
//! that owns a pixel buffer. Allocating a fresh buffer per ROI at camera frame
//! rates causes allocator churn, so finished records are returned here and the
//! next producer call picks one up again, buffer capacity included.
//!
//! # Design
//!
//! - `SegQueue` holds the free records (lock-free), so a worker recycling a
//!   record never contends with a producer holding the job queue lock.
//! - The pool grows on demand when the free list is empty and never shrinks;
//!   the number of live records is bounded only by demand.
//! - An optional reset hook runs on every recycle.
//!
//! # Example
//!
//! ```
//! use qtrk_pool::Pool;
//!
//! let pool = Pool::new_with_reset(2, || Vec::<u8>::with_capacity(64), |buf| buf.clear());
//!
//! let mut buf = pool.acquire();
//! buf.extend_from_slice(&[1, 2, 3]);
//! pool.recycle(buf);
//!
//! // Records come back cleared, capacity kept.
//! let buf = pool.acquire();
//! assert!(buf.is_empty());
//! assert!(buf.capacity() >= 64);
//! assert_eq!(pool.stats().allocated, 2);
//! ```

use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

/// Type alias for reset function used when returning items to the pool.
type ResetFn<T> = Box<dyn Fn(&mut T) + Send + Sync>;

/// Type alias for factory function used to create new pool items.
type FactoryFn<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Records created by the factory over the pool lifetime
    pub allocated: usize,
    /// Records currently sitting in the free list
    pub available: usize,
    /// Total `acquire` calls
    pub total_acquires: u64,
    /// Total `recycle` calls
    pub total_recycles: u64,
}

impl PoolStats {
    /// Records currently handed out (queued or being processed).
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.allocated.saturating_sub(self.available)
    }
}

/// Free list of reusable records, grown on demand.
pub struct Pool<T> {
    /// Lock-free queue of records ready for reuse
    free: SegQueue<T>,
    /// Factory function to create new records when the free list is empty
    factory: FactoryFn<T>,
    /// Optional reset function called when a record is returned
    reset_fn: Option<ResetFn<T>>,
    /// Number of records in `free`
    available: AtomicUsize,
    /// Records created so far
    allocated: AtomicUsize,
    total_acquires: AtomicU64,
    total_recycles: AtomicU64,
}

impl<T: Send + 'static> Pool<T> {
    /// Create a pool, pre-allocating `initial` records.
    ///
    /// `initial` may be zero; the pool then allocates lazily on first use.
    pub fn new<F, R>(initial: usize, factory: F, reset: Option<R>) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        let free = SegQueue::new();
        for _ in 0..initial {
            free.push(factory());
        }

        Self {
            free,
            factory: Box::new(factory),
            reset_fn: reset.map(|f| Box::new(f) as ResetFn<T>),
            available: AtomicUsize::new(initial),
            allocated: AtomicUsize::new(initial),
            total_acquires: AtomicU64::new(0),
            total_recycles: AtomicU64::new(0),
        }
    }

    /// Create a pool without a reset function.
    pub fn new_simple<F>(initial: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::new(initial, factory, None::<fn(&mut T)>)
    }

    /// Create a pool with a reset function.
    pub fn new_with_reset<F, R>(initial: usize, factory: F, reset: R) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        Self::new(initial, factory, Some(reset))
    }

    /// Take a record from the free list, allocating a new one if it is empty.
    ///
    /// Never blocks.
    pub fn acquire(&self) -> T {
        self.total_acquires.fetch_add(1, Ordering::Relaxed);

        if let Some(item) = self.free.pop() {
            self.available.fetch_sub(1, Ordering::AcqRel);
            return item;
        }

        let allocated = self.allocated.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            pool_type = std::any::type_name::<T>(),
            allocated, "Free list empty, growing pool"
        );
        (self.factory)()
    }

    /// Return a record to the free list.
    pub fn recycle(&self, mut item: T) {
        if let Some(reset_fn) = &self.reset_fn {
            reset_fn(&mut item);
        }
        // Count before pushing so a concurrent pop never decrements below zero.
        self.available.fetch_add(1, Ordering::AcqRel);
        self.free.push(item);
        self.total_recycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of records waiting in the free list.
    #[must_use]
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    /// Number of records created over the pool lifetime.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Snapshot of all counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated(),
            available: self.available(),
            total_acquires: self.total_acquires.load(Ordering::Relaxed),
            total_recycles: self.total_recycles.load(Ordering::Relaxed),
        }
    }
}

impl<T> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("allocated", &self.allocated.load(Ordering::Relaxed))
            .field("available", &self.available.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_pool_reuses_records() {
        let pool = Pool::new_with_reset(1, || vec![0u8; 16], |v| v.fill(0));

        let mut item = pool.acquire();
        item[0] = 42;
        pool.recycle(item);

        let item = pool.acquire();
        assert_eq!(item[0], 0); // Reset to zero
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn test_pool_grows_when_empty() {
        let pool = Pool::new_simple(0, || 7i32);
        assert_eq!(pool.allocated(), 0);

        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!((a, b), (7, 7));
        assert_eq!(pool.allocated(), 2);
        assert_eq!(pool.available(), 0);

        pool.recycle(a);
        pool.recycle(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_pool_never_shrinks() {
        let pool = Pool::new_simple(0, Vec::<u8>::new);
        let items: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        for item in items {
            pool.recycle(item);
        }
        let _one = pool.acquire();
        assert_eq!(pool.allocated(), 5);
        assert_eq!(pool.available(), 4);
    }

    fn default_pool<T: Default + Send + 'static>() -> Pool<T> {
        Pool::new_simple(1, T::default)
    }

    #[test]
    fn test_generic_pool_without_reset() {
        let pool: Pool<String> = default_pool();
        let mut item = pool.acquire();
        item.push('x');
        pool.recycle(item);
        // No reset hook: the record comes back as it was returned
        assert_eq!(pool.acquire(), "x");
    }

    #[test]
    fn test_stats() {
        let pool = Pool::new_simple(2, || 0u32);
        let a = pool.acquire();
        let stats = pool.stats();
        assert_eq!(stats.total_acquires, 1);
        assert_eq!(stats.in_use(), 1);
        pool.recycle(a);
        let stats = pool.stats();
        assert_eq!(stats.total_recycles, 1);
        assert_eq!(stats.in_use(), 0);
    }

    #[test]
    fn test_concurrent_acquire_recycle() {
        let pool = Arc::new(Pool::new_simple(4, || vec![0u8; 64]));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let mut item = pool.acquire();
                        item[0] = i as u8;
                        pool.recycle(item);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.total_acquires, 800);
        assert_eq!(stats.total_recycles, 800);
        assert_eq!(stats.available, stats.allocated);
        assert!(stats.allocated <= 8 + 4);
    }
}
