use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};

struct PoolInner<T> {
    free: Mutex<Vec<T>>,
    init: Box<dyn Fn() -> T + Send + Sync>,
}

/// Thread-safe cache of reusable objects.
///
/// [`acquire`] hands out a [`Pooled`] guard; dropping the guard returns the
/// object to the free list instead of destroying it. An empty pool constructs
/// a fresh object with the closure given at creation. No upper bound is
/// enforced; callers that need one wrap the pool in a semaphore.
///
/// [`acquire`]: Pool::acquire
///
/// # Examples
///
/// ```
/// use lightvoice::Pool;
///
/// let pool: Pool<Vec<u8>> = Pool::new(|| Vec::with_capacity(1024));
/// {
///     let mut buf = pool.acquire();
///     buf.push(7);
/// }
/// // The buffer went back to the pool on drop.
/// assert_eq!(pool.idle(), 1);
/// ```
pub struct Pool<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + 'static> Pool<T> {
    pub fn new<F>(init: F) -> Pool<T>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Pool {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                init: Box::new(init),
            }),
        }
    }

    /// Takes an object from the free list, constructing one when empty.
    pub fn acquire(&self) -> Pooled<T> {
        let recycled = self.inner.free.lock().unwrap().pop();
        let value = recycled.unwrap_or_else(|| (self.inner.init)());
        Pooled {
            value: Some(value),
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Number of objects currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }
}

impl<T: Send + 'static> Clone for Pool<T> {
    fn clone(&self) -> Pool<T> {
        Pool {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Guard for a pooled object; returns it to the pool on drop.
///
/// If the pool itself is gone by then, the object is simply destroyed.
pub struct Pooled<T: Send + 'static> {
    value: Option<T>,
    pool: Weak<PoolInner<T>>,
}

impl<T: Send + 'static> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("pooled value already returned")
    }
}

impl<T: Send + 'static> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pooled value already returned")
    }
}

impl<T: Send + 'static> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let (Some(value), Some(pool)) = (self.value.take(), self.pool.upgrade()) {
            pool.free.lock().unwrap().push(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Pool;

    #[test]
    fn recycles_on_drop() {
        let pool: Pool<Vec<u8>> = Pool::new(|| Vec::with_capacity(64));
        assert_eq!(pool.idle(), 0);

        {
            let mut a = pool.acquire();
            a.extend_from_slice(b"xyz");
        }
        assert_eq!(pool.idle(), 1);

        // The recycled object comes back as-is; callers reset it themselves.
        let b = pool.acquire();
        assert_eq!(&b[..], b"xyz");
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn constructs_when_empty() {
        let pool: Pool<u32> = Pool::new(|| 7);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(*a, 7);
        assert_eq!(*b, 7);
    }

    #[test]
    fn outlives_pool() {
        let pool: Pool<u32> = Pool::new(|| 1);
        let guard = pool.acquire();
        drop(pool);
        // Returning into a dead pool must not panic.
        drop(guard);
    }
}
