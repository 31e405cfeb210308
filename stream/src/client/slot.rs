//! One-shot completion slot shared by a waiting caller and the connection reader.
//!
//! A blocking caller spins a configurable number of iterations, then parks on the condvar.
//! An async caller polls [SlotFuture].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

pub struct ResponseSlot<T> {
    done: AtomicBool,
    inner: Mutex<SlotInner<T>>,
    cond: Condvar,
}

struct SlotInner<T> {
    result: Option<T>,
    waker: Option<Waker>,
}

impl<T: Send> ResponseSlot<T> {
    #[inline]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            done: AtomicBool::new(false),
            inner: Mutex::new(SlotInner { result: None, waker: None }),
            cond: Condvar::new(),
        })
    }

    #[inline(always)]
    fn lock(&self) -> MutexGuard<'_, SlotInner<T>> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fill the slot, only the first call has effect.
    pub fn complete(&self, result: T) -> bool {
        let waker = {
            let mut g = self.lock();
            if self.done.load(Ordering::Acquire) {
                return false;
            }
            g.result = Some(result);
            self.done.store(true, Ordering::Release);
            g.waker.take()
        };
        self.cond.notify_all();
        if let Some(w) = waker {
            w.wake();
        }
        true
    }

    #[inline(always)]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Take the result if there's one.
    #[inline]
    pub fn take(&self) -> Option<T> {
        self.lock().result.take()
    }

    /// Block until completed, spinning `spin` times first.
    ///
    /// Returns None when `timeout` passed without a result; `None` timeout waits forever.
    pub fn wait(&self, spin: usize, timeout: Option<Duration>) -> Option<T> {
        for _ in 0..spin {
            if self.is_done() {
                return self.take();
            }
            std::hint::spin_loop();
        }
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut g = self.lock();
        loop {
            if let Some(r) = g.result.take() {
                return Some(r);
            }
            if self.is_done() {
                // taken by someone else
                return None;
            }
            match deadline {
                None => {
                    g = match self.cond.wait(g) {
                        Ok(g) => g,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    g = match self.cond.wait_timeout(g, deadline - now) {
                        Ok((g, _)) => g,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            }
        }
    }

    pub fn poll_result(&self, cx: &mut Context<'_>) -> Poll<T> {
        let mut g = self.lock();
        if let Some(r) = g.result.take() {
            return Poll::Ready(r);
        }
        g.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// Await the result of a [ResponseSlot]
pub struct SlotFuture<T>(pub Arc<ResponseSlot<T>>);

impl<T: Send> Future for SlotFuture<T> {
    type Output = T;

    #[inline]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        self.0.poll_result(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_once() {
        let slot = ResponseSlot::<i32>::new();
        assert!(slot.complete(1));
        assert!(!slot.complete(2));
        assert_eq!(slot.wait(10, Some(Duration::from_millis(1))), Some(1));
        // result is taken only once
        assert_eq!(slot.wait(0, Some(Duration::from_millis(1))), None);
    }

    #[test]
    fn test_wait_timeout() {
        let slot = ResponseSlot::<i32>::new();
        let start = Instant::now();
        assert_eq!(slot.wait(100, Some(Duration::from_millis(50))), None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_cross_thread() {
        let slot = ResponseSlot::<String>::new();
        let _slot = slot.clone();
        let th = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            _slot.complete("hi! world".to_string());
        });
        assert_eq!(slot.wait(0, None).as_deref(), Some("hi! world"));
        th.join().unwrap();

        let slot = ResponseSlot::<u8>::new();
        let _slot = slot.clone();
        let th = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            _slot.complete(9);
        });
        assert_eq!(futures::executor::block_on(SlotFuture(slot)), 9);
        th.join().unwrap();
    }
}
