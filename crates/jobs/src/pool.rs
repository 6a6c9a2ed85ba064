use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex};

struct PoolState<T> {
    free: Vec<T>,
    created: usize,
    checked_out: usize,
}

/// A set of reusable heavyweight objects, created lazily up to a capacity.
///
/// Exhaustion is an expected condition: [`Pool::acquire`] returns `None` and
/// the caller falls back to doing the work without a pooled object.
pub struct Pool<T> {
    state: Mutex<PoolState<T>>,
    recycled: Condvar,
    capacity: Option<usize>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T> Pool<T> {
    pub fn bounded(capacity: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self::build(Some(capacity), factory)
    }

    /// Capacity is `budget_bytes / item_bytes`, rounded up.
    pub fn with_budget(
        budget_bytes: u64,
        item_bytes: u64,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) -> Self {
        let capacity = budget_bytes.div_ceil(item_bytes.max(1));
        Self::build(Some(capacity as usize), factory)
    }

    /// A pool that always creates a new item when the free list is empty.
    pub fn unbounded(factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self::build(None, factory)
    }

    fn build(capacity: Option<usize>, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::new(PoolState {
                free: Vec::new(),
                created: 0,
                checked_out: 0,
            }),
            recycled: Condvar::new(),
            capacity,
            factory: Box::new(factory),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Items that can be acquired right now without blocking.
    pub fn available(&self) -> usize {
        let state = self.state.lock();
        match self.capacity {
            Some(cap) => state.free.len() + cap.saturating_sub(state.created),
            None => usize::MAX,
        }
    }

    pub fn checked_out(&self) -> usize {
        self.state.lock().checked_out
    }

    pub fn acquire(&self) -> Option<T> {
        let mut state = self.state.lock();
        self.take(&mut state)
    }

    /// Wait until an item is recycled if the pool is exhausted.
    pub fn acquire_blocking(&self) -> T {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = self.take(&mut state) {
                return item;
            }
            self.recycled.wait(&mut state);
        }
    }

    /// Return an item. Recycling more items than were checked out is a bug.
    ///
    /// Items carry no identity, so a double release is detected by count:
    /// every recycle must match an outstanding checkout, and a bounded pool
    /// never holds more free items than it has created.
    pub fn recycle(&self, item: T) {
        {
            let mut state = self.state.lock();
            debug_assert!(
                state.checked_out > 0,
                "item recycled into a pool with nothing checked out"
            );
            debug_assert!(
                self.capacity.is_none_or(|cap| state.free.len() < cap),
                "item recycled into a full pool"
            );
            state.checked_out = state.checked_out.saturating_sub(1);
            state.free.push(item);
        }
        self.recycled.notify_one();
    }

    /// Scoped checkout; the item returns to the pool when the guard drops.
    pub fn checkout(&self) -> Option<Pooled<'_, T>> {
        self.acquire().map(|item| Pooled {
            pool: self,
            item: Some(item),
        })
    }

    pub fn checkout_blocking(&self) -> Pooled<'_, T> {
        Pooled {
            pool: self,
            item: Some(self.acquire_blocking()),
        }
    }

    fn take(&self, state: &mut PoolState<T>) -> Option<T> {
        let item = match state.free.pop() {
            Some(item) => item,
            None if self.capacity.is_none_or(|cap| state.created < cap) => {
                state.created += 1;
                (self.factory)()
            }
            None => return None,
        };
        state.checked_out += 1;
        Some(item)
    }
}

/// An item checked out of a [`Pool`].
pub struct Pooled<'a, T> {
    pool: &'a Pool<T>,
    // Only `None` while dropping.
    item: Option<T>,
}

impl<T> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("pooled item is present until drop")
    }
}

impl<T> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pooled item is present until drop")
    }
}

impl<T> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.recycle(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn bounded_pool_exhausts() {
        let pool = Pool::bounded(2, || vec![0u8; 16]);
        let a = pool.acquire();
        let b = pool.acquire();
        assert!(a.is_some() && b.is_some());
        assert!(pool.acquire().is_none());
        assert_eq!(pool.checked_out(), 2);
        assert_eq!(pool.available(), 0);

        pool.recycle(a.unwrap());
        assert_eq!(pool.available(), 1);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn budget_capacity_rounds_up() {
        let pool = Pool::with_budget(1000, 300, || 0u32);
        assert_eq!(pool.capacity(), Some(4));
        let pool = Pool::with_budget(900, 300, || 0u32);
        assert_eq!(pool.capacity(), Some(3));
    }

    #[test]
    fn no_two_live_references_to_one_item() {
        let pool = Pool::bounded(4, || Arc::new(AtomicUsize::new(0)));
        let mut live = Vec::new();
        for round in 0..20 {
            while let Some(item) = pool.acquire() {
                for other in &live {
                    assert!(!Arc::ptr_eq(&item, other));
                }
                live.push(item);
            }
            assert_eq!(live.len(), 4);
            // Return a varying subset each round.
            for _ in 0..(round % 4 + 1) {
                if let Some(item) = live.pop() {
                    pool.recycle(item);
                }
            }
        }
    }

    #[test]
    fn guard_returns_item_on_drop() {
        let pool = Pool::bounded(1, Vec::<u32>::new);
        {
            let mut guard = pool.checkout().unwrap();
            guard.push(7);
            assert!(pool.checkout().is_none());
        }
        let guard = pool.checkout().unwrap();
        assert_eq!(*guard, vec![7]);
    }

    #[test]
    fn unbounded_pool_never_exhausts() {
        let created = Arc::new(AtomicUsize::new(0));
        let c = created.clone();
        let pool = Pool::unbounded(move || c.fetch_add(1, Ordering::SeqCst));
        let items: Vec<_> = (0..10).filter_map(|_| pool.acquire()).collect();
        assert_eq!(items.len(), 10);
        assert_eq!(created.load(Ordering::SeqCst), 10);
        assert_eq!(pool.capacity(), None);
    }

    #[test]
    fn blocking_acquire_waits_for_recycle() {
        let pool = Arc::new(Pool::bounded(1, || 5u64));
        let item = pool.acquire().unwrap();
        let p = pool.clone();
        let waiter = std::thread::spawn(move || p.acquire_blocking());
        std::thread::sleep(Duration::from_millis(20));
        pool.recycle(item);
        assert_eq!(waiter.join().unwrap(), 5);
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn double_recycle_is_caught() {
        let pool = Pool::bounded(1, || 1u8);
        let item = pool.acquire().unwrap();
        pool.recycle(item);
        pool.recycle(item);
    }

    #[test]
    fn guards_recycle_each_item_once() {
        let pool = Pool::bounded(2, Vec::<u8>::new);
        for _ in 0..5 {
            let a = pool.checkout_blocking();
            let b = pool.checkout_blocking();
            assert_eq!(pool.checked_out(), 2);
            drop(a);
            drop(b);
            assert_eq!(pool.checked_out(), 0);
            assert_eq!(pool.available(), 2);
        }
    }
}
