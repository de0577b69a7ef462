//!
//! Thread safe memory pools, keyed by `(pool_type, sub_id)`.
//!
//! This avoids doing memory allocation on the write hot path. Each pool
//! preallocates `capacity` slots of `T`; `get` pops one off a LIFO free list
//! (returning `None`, never blocking, when exhausted), `put` pushes it back.
use parking_lot::Mutex;

/// Identifies one pool instance. Mirrors the source's `(pool_type, sub_id)`
/// pairing: mcmds are keyed by read/write class, provisioning contexts by
/// provisioning type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKey {
    Mcmd { sub_id: u16 },
    ProvCtx { ptype: u16 },
}

pub struct MemoryPool<T> {
    key: PoolKey,
    capacity: usize,
    free: Mutex<Vec<T>>,
}

impl<T> MemoryPool<T> {
    /// Creates a pool with `capacity` pre-built elements produced by `make`.
    pub fn create(key: PoolKey, capacity: usize, mut make: impl FnMut() -> T) -> Self {
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(make());
        }
        tracing::info!(?key, capacity, "memory pool created");
        Self {
            key,
            capacity,
            free: Mutex::new(free),
        }
    }

    /// Gets a free element from the pool. Returns `None` if exhausted; never
    /// blocks.
    pub fn get(&self) -> Option<T> {
        self.free.lock().pop()
    }

    /// Returns an element to the pool's free list.
    pub fn put(&self, val: T) {
        let mut free = self.free.lock();
        debug_assert!(free.len() < self.capacity, "returning more than was taken");
        free.push(val);
    }

    pub fn key(&self) -> PoolKey {
        self.key
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of elements currently available.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

impl<T> Drop for MemoryPool<T> {
    fn drop(&mut self) {
        let available = self.free.lock().len();
        if available != self.capacity {
            tracing::warn!(
                key = ?self.key,
                capacity = self.capacity,
                available,
                "dropping memory pool with entries still checked out"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_put_round_trips_and_exhausts() {
        let pool = MemoryPool::create(PoolKey::Mcmd { sub_id: 0 }, 2, || 0u32);
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert!(pool.get().is_none());
        pool.put(a);
        pool.put(b);
        assert_eq!(pool.available(), 2);
    }
}
