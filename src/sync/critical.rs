//! 临界区
//!
//! `Spinlock` 由声明者持有, 生命周期必须覆盖所有使用。
//! 进入临界区时先关闭本核中断/抢占 (`critical_section::acquire`),
//! 再获取自旋锁以排斥其他核; 退出顺序相反并恢复进入前的中断状态。
//!
//! # Warning
//! 临界区内不能调用任何阻塞原语, 持续时间应控制在微秒级。
//!
//! # Example
//! ```ignore
//! static LOCK: Spinlock = Spinlock::new();
//!
//! let value = LOCK.with(|| {
//!     // 与中断处理函数共享的数据
//!     unsafe { SHARED += 1; SHARED }
//! });
//! ```

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use critical_section::RestoreState;
use portable_atomic::{AtomicBool, Ordering};

/// 临界区自旋锁
pub struct Spinlock {
    locked: AtomicBool,
    restore: UnsafeCell<RestoreState>,
}

// Safety: restore 只在持有自旋锁时访问
unsafe impl Sync for Spinlock {}
unsafe impl Send for Spinlock {}

impl Spinlock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            restore: UnsafeCell::new(RestoreState::invalid()),
        }
    }

    /// 进入临界区
    ///
    /// # Safety
    /// 必须与同一自旋锁上的一次 [`Spinlock::exit`] 严格配对,
    /// 且期间不得主动让出处理器。同一核上重复进入同一把锁会死锁。
    pub unsafe fn enter(&self) {
        let restore = critical_section::acquire();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        *self.restore.get() = restore;
    }

    /// 退出临界区并恢复进入前的中断状态
    ///
    /// # Safety
    /// 只能由之前调用 [`Spinlock::enter`] 的同一执行流调用一次。
    pub unsafe fn exit(&self) {
        let restore = *self.restore.get();
        self.locked.store(false, Ordering::Release);
        critical_section::release(restore);
    }

    /// 获取 RAII 守卫, drop 时自动退出
    pub fn lock(&self) -> SpinlockGuard<'_> {
        // SAFETY: 守卫保证 exit 恰好调用一次
        unsafe { self.enter() };
        SpinlockGuard { lock: self, _not_send: PhantomData }
    }

    /// 在临界区中执行闭包
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock();
        f()
    }

    /// 是否被某个执行流持有
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

/// 自旋锁守卫
pub struct SpinlockGuard<'a> {
    lock: &'a Spinlock,
    // 恢复状态属于进入时的核, 不能跨任务释放
    _not_send: PhantomData<*mut ()>,
}

impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: 守卫由 lock() 创建, 与一次 enter 配对
        unsafe { self.lock.exit() };
    }
}

/// 临界区互斥锁 - 保护与中断共享的数据
pub struct CriticalMutex<T> {
    spinlock: Spinlock,
    inner: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for CriticalMutex<T> {}

impl<T> CriticalMutex<T> {
    pub const fn new(value: T) -> Self {
        CriticalMutex {
            spinlock: Spinlock::new(),
            inner: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> CriticalMutexGuard<'_, T> {
        CriticalMutexGuard { mutex: self, _guard: self.spinlock.lock() }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

pub struct CriticalMutexGuard<'a, T> {
    mutex: &'a CriticalMutex<T>,
    _guard: SpinlockGuard<'a>,
}

impl<T> Deref for CriticalMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we're in a critical section
        unsafe { &*self.mutex.inner.get() }
    }
}

impl<T> DerefMut for CriticalMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we're in a critical section
        unsafe { &mut *self.mutex.inner.get() }
    }
}
