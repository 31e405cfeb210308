//! A bounded free list for objects that are expensive to allocate on every call, like encode
//! buffers and call contexts.
//!
//! A [Pooled] handle returns its object to the [Recycler] on drop, after [Recycle::reset].
//! When the free list is full the object is simply dropped.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Clear the state of an object before it goes back to the pool.
pub trait Recycle: Send + 'static {
    fn reset(&mut self);
}

impl Recycle for Vec<u8> {
    #[inline]
    fn reset(&mut self) {
        self.clear();
    }
}

pub struct Recycler<T: Recycle> {
    free: Mutex<Vec<T>>,
    cap: usize,
    new_fn: fn() -> T,
}

impl<T: Recycle> Recycler<T> {
    /// `cap` is the max number of idle objects kept.
    pub fn new(cap: usize, new_fn: fn() -> T) -> Arc<Self> {
        Arc::new(Self { free: Mutex::new(Vec::with_capacity(cap)), cap, new_fn })
    }

    /// Take an idle object, or allocate a new one if the pool is empty.
    #[inline]
    pub fn get(self: &Arc<Self>) -> Pooled<T> {
        let item = match self.free.lock() {
            Ok(mut free) => free.pop(),
            Err(_) => None,
        };
        Pooled { item: Some(item.unwrap_or_else(self.new_fn)), pool: self.clone() }
    }

    #[inline]
    fn put(&self, mut item: T) {
        item.reset();
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.cap {
                free.push(item);
            }
        }
    }

    /// Number of idle objects
    #[inline]
    pub fn idle(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}

/// Handle to a pooled object, goes back to the pool on drop.
pub struct Pooled<T: Recycle> {
    item: Option<T>,
    pool: Arc<Recycler<T>>,
}

impl<T: Recycle> Pooled<T> {
    /// Detach the object from the pool, it will not be recycled.
    #[inline]
    pub fn into_inner(mut self) -> T {
        self.item.take().unwrap_or_else(self.pool.new_fn)
    }
}

impl<T: Recycle> Deref for Pooled<T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        // item is only None after into_inner() consumed self
        match self.item.as_ref() {
            Some(item) => item,
            None => unreachable!(),
        }
    }
}

impl<T: Recycle> DerefMut for Pooled<T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        match self.item.as_mut() {
            Some(item) => item,
            None => unreachable!(),
        }
    }
}

impl<T: Recycle> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.put(item);
        }
    }
}

impl<T: Recycle + std::fmt::Debug> std::fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.deref().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recycle_buf() {
        let pool = Recycler::<Vec<u8>>::new(2, || Vec::with_capacity(128));
        {
            let mut a = pool.get();
            a.extend_from_slice(b"hello");
            let mut b = pool.get();
            b.push(1);
            let _c = pool.get();
        }
        // one of the three is dropped because cap is 2
        assert_eq!(pool.idle(), 2);
        let a = pool.get();
        assert!(a.is_empty());
        assert!(a.capacity() >= 128);
        assert_eq!(pool.idle(), 1);
        let v = a.into_inner();
        assert!(v.is_empty());
        assert_eq!(pool.idle(), 1);
    }
}
