//! RustRTOS Sync - 实时内核同步与任务间通信原语
//!
//! 本库把抢占式实时内核的原生并发对象包装成一组小而稳定的接口:
//! - 临界区 (自旋锁 + 关中断)
//! - 内核互斥锁 (递归 / 非递归, 动态分配 / 静态存储)
//! - 全局信号锁 (进程级单例)
//! - 定长消息队列 (含中断安全发送路径)
//! - 字节流缓冲区 (触发水位唤醒)
//! - 事件标志组、值变化通知与异步任务互斥锁
//!
//! 内核本身 (调度、tick、任务挂起/唤醒) 通过 [`kernel::Kernel`] trait 注入,
//! 本库只决定何时挂起、何时唤醒。

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

#[cfg(feature = "log-defmt")]
use defmt_rtt as _;

pub mod util;
pub mod kernel;
pub mod mem;
pub mod sync;
pub mod api;

// ===== 重导出常用类型 =====
pub use kernel::{Kernel, TaskId, TickType, WAIT_FOREVER};
pub use sync::critical::{CriticalMutex, Spinlock};
pub use sync::event_group::{EventBits, EventGroup, EventTimeout, WaitFor};
pub use sync::isr::{IsrContext, IsrResult};
pub use sync::mutex::{
    KernelMutex, LockError, MutexKind, MutexStorage, OsMutex, ReentrantMutex, Storage,
};
pub use sync::queue::{Queue, QueueError, QueueIsr};
pub use sync::signal::{GlobalSignal, InitError, SignalCell, SignalGuard, GLOBAL_SIGNAL};
pub use sync::stream_buffer::{StreamBuffer, StreamError, StreamIsr};
pub use sync::task_mutex::{TaskMutex, TaskMutexGuard};
pub use sync::watch::{Signal, Watch, WatchTimeout};
pub use sync::CreateError;

// ===== 版本信息 =====
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// 系统配置常量
pub mod config {
    /// 内核 tick 频率 (Hz), 1 tick = 1ms
    pub const TICK_RATE_HZ: u32 = 1_000;

    /// `lock()` 每次有界等待的 tick 数, 超时后重试直到获得锁
    pub const LOCK_RETRY_TICKS: u32 = 1_000;

    /// 每个内核对象等待链表的容量 (每个方向)
    ///
    /// 链表满时新的等待者退化为每 tick 轮询一次
    pub const MAX_WAITERS: usize = 16;

    /// 每个内核对象可登记的异步 waker 数量 (每个方向)
    pub const MAX_ASYNC_WAITERS: usize = 4;
}
