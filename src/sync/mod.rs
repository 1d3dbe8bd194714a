//! 同步原语模块
//!
//! - `critical`: 自旋锁临界区与 `CriticalMutex`
//! - `mutex`: 内核互斥锁 (递归 / 非递归, 静态 / 动态存储)
//! - `task_mutex`: 异步任务互斥锁
//! - `signal`: 进程级全局信号锁
//! - `watch`: 值变化通知 (`Signal` / `Watch`)
//! - `event_group`: 事件标志组
//! - `queue`: 定长消息队列 (含中断安全发送)
//! - `stream_buffer`: 字节流缓冲区 (触发水位)
//! - `ringbuffer`: 以上两者共用的字节环形缓冲区
//! - `isr`: 中断上下文令牌与结果类型

pub mod critical;
pub mod event_group;
pub mod isr;
pub mod mutex;
pub mod queue;
pub mod ringbuffer;
pub mod signal;
pub mod stream_buffer;
pub mod task_mutex;
pub mod watch;

pub use critical::{CriticalMutex, Spinlock};
pub use event_group::EventGroup;
pub use mutex::{KernelMutex, MutexStorage, OsMutex, ReentrantMutex};
pub use queue::Queue;
pub use ringbuffer::ByteRing;
pub use signal::GlobalSignal;
pub use stream_buffer::StreamBuffer;
pub use task_mutex::TaskMutex;
pub use watch::Signal;

use crate::mem::AllocError;

/// 内核对象创建错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CreateError {
    /// 无法分配后备存储
    OutOfMemory,
    /// 参数无效 (容量为 0、尺寸溢出、触发水位超过容量等)
    InvalidParameter,
    /// 静态存储已被另一个对象占用
    StorageInUse,
}

impl From<AllocError> for CreateError {
    fn from(_: AllocError) -> Self {
        CreateError::OutOfMemory
    }
}
