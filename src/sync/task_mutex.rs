//! 异步任务互斥锁
//!
//! 给 async 任务用的互斥锁: 拿不到锁时登记 waker 并返回 `Pending`,
//! 守卫释放时唤醒所有登记的 waker 重新竞争。不经过内核挂起,
//! 可以在没有安装内核的执行器中使用。
//!
//! # Example
//! ```ignore
//! static CONFIG: TaskMutex<Config> = TaskMutex::new(Config::DEFAULT);
//!
//! let mut config = CONFIG.lock().await;
//! config.retries += 1;
//! ```

use core::cell::{RefCell, UnsafeCell};
use core::future::poll_fn;
use core::ops::{Deref, DerefMut};
use core::task::{Context, Poll};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::waitqueue::MultiWakerRegistration;

use crate::config;

struct LockState {
    locked: bool,
    wakers: MultiWakerRegistration<{ config::MAX_ASYNC_WAITERS }>,
}

/// 异步互斥锁
pub struct TaskMutex<T> {
    state: BlockingMutex<CriticalSectionRawMutex, RefCell<LockState>>,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for TaskMutex<T> {}
unsafe impl<T: Send> Sync for TaskMutex<T> {}

impl<T> TaskMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            state: BlockingMutex::new(RefCell::new(LockState {
                locked: false,
                wakers: MultiWakerRegistration::new(),
            })),
            value: UnsafeCell::new(value),
        }
    }

    fn poll_lock(&self, cx: &mut Context<'_>) -> Poll<TaskMutexGuard<'_, T>> {
        let acquired = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.locked {
                state.wakers.register(cx.waker());
                false
            } else {
                state.locked = true;
                true
            }
        });

        if acquired {
            Poll::Ready(TaskMutexGuard { mutex: self })
        } else {
            Poll::Pending
        }
    }

    /// 异步加锁
    pub async fn lock(&self) -> TaskMutexGuard<'_, T> {
        poll_fn(|cx| self.poll_lock(cx)).await
    }

    /// 不等待地尝试加锁
    pub fn try_lock(&self) -> Option<TaskMutexGuard<'_, T>> {
        let acquired = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            !core::mem::replace(&mut state.locked, true)
        });
        acquired.then(|| TaskMutexGuard { mutex: self })
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock(|state| state.borrow().locked)
    }

    /// 独占访问时不需要加锁
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    fn release(&self) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.locked = false;
            state.wakers.wake();
        });
    }
}

/// 异步互斥锁守卫
pub struct TaskMutexGuard<'a, T> {
    mutex: &'a TaskMutex<T>,
}

impl<T> Deref for TaskMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: 持有守卫即独占锁
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> DerefMut for TaskMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: 持有守卫即独占锁
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T> Drop for TaskMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::future::Future;
    use core::pin::pin;
    use core::task::Waker;
    use portable_atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;
    use std::thread;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_waker() -> (Arc<CountingWaker>, Waker) {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());
        (counter, waker)
    }

    #[test]
    fn test_lock_and_try_lock() {
        let mutex = TaskMutex::new(1u32);

        {
            let mut guard = embassy_futures::block_on(mutex.lock());
            *guard += 1;
            assert!(mutex.is_locked());
            assert!(mutex.try_lock().is_none());
        }

        assert!(!mutex.is_locked());
        let guard = mutex.try_lock().unwrap();
        assert_eq!(*guard, 2);
        drop(guard);
        assert_eq!(mutex.into_inner(), 2);
    }

    #[test]
    fn test_release_wakes_pending_lockers() {
        let mutex = TaskMutex::new(());
        let guard = mutex.try_lock().unwrap();

        let (first_count, first_waker) = counting_waker();
        let (second_count, second_waker) = counting_waker();
        let mut first = pin!(mutex.lock());
        let mut second = pin!(mutex.lock());

        assert!(first.as_mut().poll(&mut Context::from_waker(&first_waker)).is_pending());
        assert!(second.as_mut().poll(&mut Context::from_waker(&second_waker)).is_pending());

        drop(guard);
        assert_eq!(first_count.0.load(Ordering::SeqCst), 1);
        assert_eq!(second_count.0.load(Ordering::SeqCst), 1);

        // 只有一个能拿到锁, 另一个重新登记
        let winner = first.as_mut().poll(&mut Context::from_waker(&first_waker));
        assert!(winner.is_ready());
        assert!(second.as_mut().poll(&mut Context::from_waker(&second_waker)).is_pending());

        drop(winner);
        assert_eq!(second_count.0.load(Ordering::SeqCst), 2);
        assert!(second.as_mut().poll(&mut Context::from_waker(&second_waker)).is_ready());
    }

    #[test]
    fn test_contended_increments() {
        let counter = TaskMutex::new(0u64);

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..250 {
                        let mut guard = embassy_futures::block_on(counter.lock());
                        *guard += 1;
                    }
                });
            }
        });

        assert_eq!(counter.into_inner(), 1_000);
    }
}
