//! 内核互斥锁
//!
//! 一个类型覆盖两种锁语义和两种存储策略:
//!
//! | 构造 | 语义 | 存储 |
//! |---|---|---|
//! | [`KernelMutex::create_recursive`] | 递归 | 动态分配 |
//! | [`KernelMutex::create_static`] | 非递归 | 调用方提供的 `'static` 存储 |
//! | [`KernelMutex::create`] | 任意 | 任意 |
//!
//! `lock()` 是无界阻塞: 内部以 [`config::LOCK_RETRY_TICKS`] 为单位反复
//! 有界等待, 每次等待都会让出处理器。
//!
//! # 契约
//! - 只有持有者可以 `unlock`
//! - 锁定状态下不能 `delete`
//! - 不能在中断上下文中使用
//!
//! 违反契约在 debug 构建中 panic, release 构建中记录日志并忽略。

use alloc::boxed::Box;
use core::cell::{RefCell, UnsafeCell};
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use portable_atomic::{AtomicBool, Ordering};

use crate::config;
use crate::kernel::wait::{self, Attempt, WaitList};
use crate::kernel::{self, TaskId, TickType};
use crate::mem;
use crate::util::log::*;

use super::CreateError;

/// 锁语义
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MutexKind {
    /// 非递归: 深度只有 0/1
    Normal,
    /// 递归: 持有者可重复加锁, 需等次数解锁
    Recursive,
}

/// 存储策略
pub enum Storage {
    /// 调用方提供的静态存储
    Static(&'static MutexStorage),
    /// 由分配器提供
    Allocated,
}

/// 加锁失败
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LockError {
    /// 等待超时
    Timeout,
    /// 锁被占用且不等待
    WouldBlock,
    /// 非递归锁被持有者再次加锁
    Deadlock,
}

struct MutexState {
    kind: MutexKind,
    owner: Option<TaskId>,
    depth: u32,
    waiters: WaitList,
}

impl MutexState {
    const fn new() -> Self {
        Self {
            kind: MutexKind::Normal,
            owner: None,
            depth: 0,
            waiters: WaitList::new(),
        }
    }
}

/// 互斥锁控制块存储
///
/// 可以放在 `static` 中, 供 [`KernelMutex::create_static`] 使用:
///
/// ```ignore
/// static STORAGE: MutexStorage = MutexStorage::new();
/// let mutex = KernelMutex::create_static(&STORAGE)?;
/// ```
pub struct MutexStorage {
    state: BlockingMutex<CriticalSectionRawMutex, RefCell<MutexState>>,
    claimed: AtomicBool,
}

impl MutexStorage {
    pub const fn new() -> Self {
        Self {
            state: BlockingMutex::new(RefCell::new(MutexState::new())),
            claimed: AtomicBool::new(false),
        }
    }

    /// 是否已被某个互斥锁占用
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    fn claim(&self, kind: MutexKind) -> Result<(), CreateError> {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CreateError::StorageInUse);
        }
        self.reset(kind);
        Ok(())
    }

    fn release(&self) {
        self.reset(MutexKind::Normal);
        self.claimed.store(false, Ordering::Release);
    }

    fn reset(&self, kind: MutexKind) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            *state = MutexState::new();
            state.kind = kind;
        });
    }
}

impl Default for MutexStorage {
    fn default() -> Self {
        Self::new()
    }
}

enum Backing {
    Static(&'static MutexStorage),
    Allocated(Box<MutexStorage>),
}

enum Unlock {
    StillHeld,
    Released(Option<TaskId>),
    NotOwner,
}

/// 内核互斥锁句柄
pub struct KernelMutex {
    backing: Backing,
    kind: MutexKind,
}

impl KernelMutex {
    /// 按给定语义和存储策略创建
    pub fn create(kind: MutexKind, storage: Storage) -> Result<Self, CreateError> {
        let backing = match storage {
            Storage::Static(storage) => {
                storage.claim(kind)?;
                Backing::Static(storage)
            }
            Storage::Allocated => {
                let storage = mem::try_box(MutexStorage::new())?;
                storage.claim(kind)?;
                Backing::Allocated(storage)
            }
        };
        log_debug!("mutex created (recursive: {})", kind == MutexKind::Recursive);
        Ok(Self { backing, kind })
    }

    /// 动态分配的递归互斥锁
    pub fn create_recursive() -> Result<Self, CreateError> {
        Self::create(MutexKind::Recursive, Storage::Allocated)
    }

    /// 基于静态存储的非递归互斥锁
    pub fn create_static(storage: &'static MutexStorage) -> Result<Self, CreateError> {
        Self::create(MutexKind::Normal, Storage::Static(storage))
    }

    pub fn kind(&self) -> MutexKind {
        self.kind
    }

    fn storage(&self) -> &MutexStorage {
        match &self.backing {
            Backing::Static(storage) => storage,
            Backing::Allocated(storage) => storage,
        }
    }

    /// 阻塞直到获得锁
    pub fn lock(&self) {
        loop {
            match self.try_lock_for(config::LOCK_RETRY_TICKS) {
                Ok(()) => return,
                Err(LockError::Deadlock) => {
                    debug_assert_msg!(false, "non-recursive mutex locked twice by its owner");
                    // release 构建中与内核行为一致: 永远等不到
                    kernel::get().suspend(Some(config::LOCK_RETRY_TICKS));
                }
                Err(_) => {
                    log_trace!("mutex lock retry");
                }
            }
        }
    }

    /// 不等待地尝试加锁
    pub fn try_lock(&self) -> bool {
        self.try_lock_for(0).is_ok()
    }

    /// 最多等待 `wait` tick
    pub fn try_lock_for(&self, wait: TickType) -> Result<(), LockError> {
        let mut deadlock = false;

        let result = wait::wait_until(wait, |step| {
            self.storage().state.lock(|state| {
                let mut state = state.borrow_mut();
                let task = step.task();
                let owner = state.owner;

                match owner {
                    None => {
                        state.owner = Some(task);
                        state.depth = 1;
                        state.waiters.remove(task);
                        Attempt::Ready((), None)
                    }
                    Some(owner) if owner == task && state.kind == MutexKind::Recursive => {
                        state.depth += 1;
                        Attempt::Ready((), None)
                    }
                    Some(owner) if owner == task => {
                        deadlock = true;
                        Attempt::Expired
                    }
                    Some(_) => state.waiters.park(step),
                }
            })
        });

        match result {
            Ok(()) => Ok(()),
            Err(_) if deadlock => Err(LockError::Deadlock),
            Err(_) if wait == 0 => Err(LockError::WouldBlock),
            Err(_) => Err(LockError::Timeout),
        }
    }

    /// 释放一层锁
    ///
    /// 递归锁深度归零时清除持有者并唤醒等待最久的任务。
    pub fn unlock(&self) {
        let kernel = kernel::get();
        let task = kernel.current_task();

        let outcome = self.storage().state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.owner != Some(task) {
                return Unlock::NotOwner;
            }
            state.depth -= 1;
            if state.depth > 0 {
                return Unlock::StillHeld;
            }
            state.owner = None;
            Unlock::Released(state.waiters.pop())
        });

        match outcome {
            Unlock::Released(Some(waiter)) => kernel.wake(waiter),
            Unlock::Released(None) | Unlock::StillHeld => {}
            Unlock::NotOwner => {
                debug_assert_msg!(false, "mutex unlocked by a task that does not own it");
            }
        }
    }

    /// 持有者
    pub fn owner(&self) -> Option<TaskId> {
        self.storage().state.lock(|state| state.borrow().owner)
    }

    /// 当前递归深度 (未锁定为 0)
    pub fn depth(&self) -> u32 {
        self.storage().state.lock(|state| state.borrow().depth)
    }

    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }

    /// 阻塞在锁上的任务数
    pub fn waiters(&self) -> usize {
        self.storage().state.lock(|state| state.borrow().waiters.len())
    }

    /// 删除互斥锁, 释放内核资源
    pub fn delete(self) {
        debug_assert_msg!(!self.is_locked(), "mutex deleted while locked");
        drop(self);
    }
}

impl Drop for KernelMutex {
    fn drop(&mut self) {
        if self.is_locked() {
            log_error!("mutex dropped while locked");
        }
        if let Backing::Static(storage) = &self.backing {
            storage.release();
        }
    }
}

// ===== RAII 封装 =====

/// 非递归内核互斥锁保护的数据
///
/// # Example
/// ```ignore
/// let shared = OsMutex::new(SharedData::new())?;
/// {
///     let mut guard = shared.lock();
///     guard.value += 1;
/// } // 自动释放锁
/// ```
pub struct OsMutex<T> {
    raw: KernelMutex,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for OsMutex<T> {}
unsafe impl<T: Send> Send for OsMutex<T> {}

impl<T> OsMutex<T> {
    pub fn new(value: T) -> Result<Self, CreateError> {
        Ok(Self {
            raw: KernelMutex::create(MutexKind::Normal, Storage::Allocated)?,
            value: UnsafeCell::new(value),
        })
    }

    pub fn new_static(storage: &'static MutexStorage, value: T) -> Result<Self, CreateError> {
        Ok(Self {
            raw: KernelMutex::create_static(storage)?,
            value: UnsafeCell::new(value),
        })
    }

    pub fn lock(&self) -> OsMutexGuard<'_, T> {
        self.raw.lock();
        OsMutexGuard { mutex: self, _not_send: PhantomData }
    }

    pub fn try_lock_for(&self, wait: TickType) -> Result<OsMutexGuard<'_, T>, LockError> {
        self.raw.try_lock_for(wait)?;
        Ok(OsMutexGuard { mutex: self, _not_send: PhantomData })
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

pub struct OsMutexGuard<'a, T> {
    mutex: &'a OsMutex<T>,
    // 必须由加锁的任务释放
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for OsMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold the mutex
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> DerefMut for OsMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the mutex
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T> Drop for OsMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock();
    }
}

/// 递归内核互斥锁保护的数据
///
/// 同一任务可以嵌套加锁, 因此守卫只提供共享引用;
/// 需要修改时在内部使用 `Cell`/`RefCell`。
pub struct ReentrantMutex<T> {
    raw: KernelMutex,
    value: T,
}

unsafe impl<T: Send> Sync for ReentrantMutex<T> {}
unsafe impl<T: Send> Send for ReentrantMutex<T> {}

impl<T> ReentrantMutex<T> {
    pub fn new(value: T) -> Result<Self, CreateError> {
        Ok(Self {
            raw: KernelMutex::create_recursive()?,
            value,
        })
    }

    pub fn lock(&self) -> ReentrantGuard<'_, T> {
        self.raw.lock();
        ReentrantGuard { mutex: self, _not_send: PhantomData }
    }

    pub fn depth(&self) -> u32 {
        self.raw.depth()
    }
}

pub struct ReentrantGuard<'a, T> {
    mutex: &'a ReentrantMutex<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for ReentrantGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.mutex.value
    }
}

impl<T> Drop for ReentrantGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{host, Kernel};
    use core::cell::Cell;
    use portable_atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_mutual_exclusion() {
        host::install();
        let counter = OsMutex::new(0u64).unwrap();
        let inside = AtomicBool::new(false);

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..200 {
                        let mut guard = counter.lock();
                        assert!(!inside.swap(true, Ordering::SeqCst));
                        *guard += 1;
                        inside.store(false, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(counter.into_inner(), 800);
    }

    #[test]
    fn test_recursive_requires_matching_unlocks() {
        host::install();
        let mutex = Arc::new(KernelMutex::create_recursive().unwrap());

        mutex.lock();
        mutex.lock();
        mutex.lock();
        assert_eq!(mutex.depth(), 3);

        mutex.unlock();
        mutex.unlock();
        assert_eq!(mutex.depth(), 1);

        let other = Arc::clone(&mutex);
        let blocked = thread::spawn(move || other.try_lock_for(30)).join().unwrap();
        assert_eq!(blocked, Err(LockError::Timeout));

        mutex.unlock();
        assert!(!mutex.is_locked());

        let other = Arc::clone(&mutex);
        let acquired = thread::spawn(move || {
            let result = other.try_lock_for(30);
            other.unlock();
            result
        })
        .join()
        .unwrap();
        assert_eq!(acquired, Ok(()));
    }

    #[test]
    fn test_blocked_lock_wakes_on_unlock() {
        let kernel = host::install();
        let mutex = KernelMutex::create_recursive().unwrap();
        let acquired = AtomicUsize::new(0);

        mutex.lock();
        thread::scope(|s| {
            s.spawn(|| {
                mutex.lock();
                acquired.fetch_add(1, Ordering::SeqCst);
                mutex.unlock();
            });

            thread::sleep(std::time::Duration::from_millis(30));
            assert_eq!(acquired.load(Ordering::SeqCst), 0);

            let start = kernel.tick_count();
            mutex.unlock();
            while acquired.load(Ordering::SeqCst) == 0 {
                thread::yield_now();
            }
            // 解锁后立即被唤醒, 而不是等到下一个重试周期
            assert!(kernel.tick_count().wrapping_sub(start) < config::LOCK_RETRY_TICKS / 2);
        });
    }

    #[test]
    fn test_unlock_hands_off_to_waiters_in_order() {
        let kernel = host::install();
        let mutex = KernelMutex::create(MutexKind::Normal, Storage::Allocated).unwrap();
        let next = AtomicUsize::new(0);
        let turns = [AtomicUsize::new(usize::MAX), AtomicUsize::new(usize::MAX)];

        mutex.lock();
        thread::scope(|s| {
            for (waiting, turn) in turns.iter().enumerate() {
                let (mutex, next) = (&mutex, &next);
                s.spawn(move || {
                    mutex.lock();
                    turn.store(next.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
                    mutex.unlock();
                });
                while mutex.waiters() <= waiting {
                    thread::sleep(std::time::Duration::from_millis(1));
                }
            }

            let start = kernel.tick_count();
            mutex.unlock();
            while next.load(Ordering::SeqCst) < 2 {
                thread::yield_now();
            }
            assert!(kernel.tick_count().wrapping_sub(start) < config::LOCK_RETRY_TICKS / 2);
        });

        assert_eq!(turns[0].load(Ordering::SeqCst), 0);
        assert_eq!(turns[1].load(Ordering::SeqCst), 1);
        assert_eq!(mutex.waiters(), 0);
    }

    #[test]
    fn test_lock_outlasts_retry_window() {
        host::install();
        let mutex = KernelMutex::create(MutexKind::Normal, Storage::Allocated).unwrap();
        let acquired = AtomicBool::new(false);

        mutex.lock();
        thread::scope(|s| {
            s.spawn(|| {
                // 持锁时间超过一个重试周期, lock() 需要重新进入等待
                mutex.lock();
                acquired.store(true, Ordering::SeqCst);
                mutex.unlock();
            });

            let hold = config::LOCK_RETRY_TICKS as u64 * 1_000 / config::TICK_RATE_HZ as u64 + 200;
            thread::sleep(std::time::Duration::from_millis(hold));
            assert!(!acquired.load(Ordering::SeqCst));
            mutex.unlock();
        });

        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_static_storage_is_exclusive() {
        host::install();
        static STORAGE: MutexStorage = MutexStorage::new();

        let mutex = KernelMutex::create_static(&STORAGE).unwrap();
        assert_eq!(mutex.kind(), MutexKind::Normal);
        assert!(STORAGE.is_claimed());
        assert_eq!(
            KernelMutex::create_static(&STORAGE).err(),
            Some(CreateError::StorageInUse)
        );

        mutex.lock();
        assert_eq!(mutex.owner(), Some(kernel::get().current_task()));
        assert_eq!(mutex.try_lock_for(0), Err(LockError::Deadlock));
        mutex.unlock();

        mutex.delete();
        assert!(!STORAGE.is_claimed());
        assert!(KernelMutex::create_static(&STORAGE).is_ok());
    }

    #[test]
    fn test_try_lock_contended() {
        host::install();
        let mutex = KernelMutex::create(MutexKind::Normal, Storage::Allocated).unwrap();
        mutex.lock();

        thread::scope(|s| {
            let result = s.spawn(|| mutex.try_lock_for(0)).join().unwrap();
            assert_eq!(result, Err(LockError::WouldBlock));
            assert!(!s.spawn(|| mutex.try_lock()).join().unwrap());
        });

        mutex.unlock();
    }

    #[test]
    #[should_panic(expected = "mutex unlocked by a task that does not own it")]
    fn test_unlock_by_non_owner_panics_in_debug() {
        host::install();
        let mutex = KernelMutex::create_recursive().unwrap();
        mutex.unlock();
    }

    #[test]
    fn test_reentrant_mutex_nesting() {
        host::install();
        let shared = ReentrantMutex::new(Cell::new(0u32)).unwrap();

        let outer = shared.lock();
        outer.set(1);
        {
            let inner = shared.lock();
            assert_eq!(shared.depth(), 2);
            inner.set(inner.get() + 1);
        }
        assert_eq!(shared.depth(), 1);
        assert_eq!(outer.get(), 2);
        drop(outer);
        assert_eq!(shared.depth(), 0);
    }
}
