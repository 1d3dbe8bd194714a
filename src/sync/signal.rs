//! 全局信号锁
//!
//! 进程级单例互斥锁, 用来保护跨子系统共享的少量状态,
//! 调用方不必各自管理互斥锁实例。
//!
//! 生命周期:
//! 1. 启动阶段调用一次 [`init`] (基于静态存储创建非递归互斥锁)
//! 2. 之后任意任务 [`lock`] / 自动解锁
//! 3. 永不删除
//!
//! 在 `init` 之前加锁属于启动顺序错误: debug 构建中 panic,
//! release 构建中在第一次使用时补做初始化。

use core::cell::{Cell, UnsafeCell};
use core::marker::PhantomData;

use critical_section::Mutex;
use static_cell::StaticCell;

use crate::kernel;
use crate::util::log::*;

use super::mutex::{KernelMutex, MutexStorage};
use super::CreateError;

/// 初始化错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitError {
    /// 已经初始化过
    AlreadyInitialized,
    /// 创建底层互斥锁失败
    Create(CreateError),
}

/// 进程级信号锁
///
/// 必须放在 `static` 中使用。
pub struct GlobalSignal {
    storage: MutexStorage,
    cell: StaticCell<KernelMutex>,
    handle: Mutex<Cell<Option<&'static KernelMutex>>>,
}

/// 本进程的全局信号锁
pub static GLOBAL_SIGNAL: GlobalSignal = GlobalSignal::new();

impl GlobalSignal {
    pub const fn new() -> Self {
        Self {
            storage: MutexStorage::new(),
            cell: StaticCell::new(),
            handle: Mutex::new(Cell::new(None)),
        }
    }

    /// 一次性初始化
    pub fn init(&'static self) -> Result<(), InitError> {
        let mutex = match KernelMutex::create_static(&self.storage) {
            Ok(mutex) => mutex,
            Err(CreateError::StorageInUse) => return Err(InitError::AlreadyInitialized),
            Err(err) => return Err(InitError::Create(err)),
        };

        // 存储已被本次调用独占, StaticCell 不会已被占用
        let mutex: &'static KernelMutex = match self.cell.try_init(mutex) {
            Some(mutex) => mutex,
            None => return Err(InitError::AlreadyInitialized),
        };

        critical_section::with(|cs| self.handle.borrow(cs).set(Some(mutex)));
        log_info!("global signal initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.handle().is_some()
    }

    fn handle(&self) -> Option<&'static KernelMutex> {
        critical_section::with(|cs| self.handle.borrow(cs).get())
    }

    fn mutex(&'static self) -> &'static KernelMutex {
        if let Some(mutex) = self.handle() {
            return mutex;
        }

        debug_assert_msg!(false, "global signal used before init");

        // 并发的首次使用只有一个能完成 init, 其余等待句柄发布
        let _ = self.init();
        loop {
            if let Some(mutex) = self.handle() {
                return mutex;
            }
            kernel::get().suspend(Some(1));
        }
    }

    /// 加锁, 返回守卫
    pub fn lock(&'static self) -> SignalGuard<'static> {
        let mutex = self.mutex();
        mutex.lock();
        SignalGuard { mutex, _not_send: PhantomData }
    }

    /// 加锁但不返回守卫, 必须与一次 [`GlobalSignal::unlock`] 配对
    pub fn lock_raw(&'static self) {
        self.mutex().lock();
    }

    /// 释放 [`GlobalSignal::lock_raw`] 获得的锁
    pub fn unlock(&'static self) {
        self.mutex().unlock();
    }

    /// 在持锁状态下执行闭包
    pub fn with<R>(&'static self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock();
        f()
    }
}

impl Default for GlobalSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// 初始化本进程的全局信号锁
pub fn init() -> Result<(), InitError> {
    GLOBAL_SIGNAL.init()
}

/// 锁住本进程的全局信号锁
pub fn lock() -> SignalGuard<'static> {
    GLOBAL_SIGNAL.lock()
}

/// 信号锁守卫
pub struct SignalGuard<'a> {
    mutex: &'a KernelMutex,
    _not_send: PhantomData<*const ()>,
}

impl Drop for SignalGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// 由信号锁保护的共享值
///
/// 信号锁不可递归: 不要在 `update` 的闭包中再访问同一信号锁保护的对象。
pub struct SignalCell<T> {
    signal: &'static GlobalSignal,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SignalCell<T> {}

impl<T: Copy> SignalCell<T> {
    /// 使用本进程的全局信号锁
    ///
    /// 在 `static` 中请使用 `SignalCell::new_in(&GLOBAL_SIGNAL, value)`。
    pub fn new(value: T) -> Self {
        Self::new_in(&GLOBAL_SIGNAL, value)
    }

    pub const fn new_in(signal: &'static GlobalSignal, value: T) -> Self {
        Self {
            signal,
            value: UnsafeCell::new(value),
        }
    }

    pub fn get(&self) -> T {
        let _guard = self.signal.lock();
        // SAFETY: we hold the signal lock
        unsafe { *self.value.get() }
    }

    /// 写入新值, 返回旧值
    pub fn set(&self, value: T) -> T {
        let _guard = self.signal.lock();
        // SAFETY: we hold the signal lock
        unsafe { core::mem::replace(&mut *self.value.get(), value) }
    }

    /// 读-改-写, 返回新值
    pub fn update(&self, f: impl FnOnce(T) -> T) -> T {
        let _guard = self.signal.lock();
        // SAFETY: we hold the signal lock
        let slot = unsafe { &mut *self.value.get() };
        *slot = f(*slot);
        *slot
    }
}
