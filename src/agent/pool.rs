// Bounded object pool for hot-path allocations
use parking_lot::Mutex;
use std::fmt;

/// Objects that can be scrubbed and reused
pub trait Poolable: Default + Send {
    /// Return to a state equivalent to `Default::default()`, keeping
    /// allocations that are worth keeping
    fn reset(&mut self);
}

/// A LIFO free list of at most `capacity` objects.
///
/// `get` never blocks: an empty pool hands out a fresh default object.
/// `put` resets the object and drops it when the pool is full.
pub struct ObjectPool<T> {
    items: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T: Poolable> ObjectPool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn get(&self) -> T {
        self.items.lock().pop().unwrap_or_default()
    }

    pub fn put(&self, mut item: T) {
        item.reset();
        let mut items = self.items.lock();
        if items.len() < self.capacity {
            items.push(item);
        }
    }

    /// Objects currently idle in the pool
    pub fn idle(&self) -> usize {
        self.items.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("idle", &self.items.lock().len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Buffer {
        data: Vec<u8>,
        resets: usize,
    }

    impl Poolable for Buffer {
        fn reset(&mut self) {
            self.data.clear();
            self.resets += 1;
        }
    }

    #[test]
    fn test_pool_reuses_reset_objects() {
        let pool = ObjectPool::<Buffer>::new(2);
        let mut buffer = pool.get();
        buffer.data.extend_from_slice(b"hello");
        pool.put(buffer);
        assert_eq!(pool.idle(), 1);

        let reused = pool.get();
        assert!(reused.data.is_empty());
        assert_eq!(reused.resets, 1);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = ObjectPool::<Buffer>::new(1);
        pool.put(Buffer::default());
        pool.put(Buffer::default());
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.capacity(), 1);
    }
}
