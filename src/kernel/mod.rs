//! 内核能力接口
//!
//! 本库不实现调度器。任务挂起/唤醒、tick 计数、中断延迟唤醒等能力
//! 由底层实时内核提供, 通过 [`Kernel`] trait 在启动时注入一次:
//!
//! ```rust,ignore
//! static PORT: MyPort = MyPort::new();
//! rustrtos_sync::kernel::install(&PORT).ok();
//! ```
//!
//! 主机端口见 [`host`] (feature `std`)。

use core::cell::Cell;
use core::fmt;

use critical_section::Mutex;

use crate::config;

pub(crate) mod wait;

#[cfg(any(test, feature = "std"))]
pub mod host;

/// tick 计数类型
pub type TickType = u32;

/// 永久等待 (禁用超时)
pub const WAIT_FOREVER: TickType = TickType::MAX;

/// 任务标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TaskId(u32);

impl TaskId {
    pub const fn new(raw: u32) -> Self {
        TaskId(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// 内核提供给同步原语的能力集合
///
/// # 唤醒许可
///
/// `wake(t)` 如果发生在任务 `t` 调用 `suspend` 之前, 则 `t` 的下一次
/// `suspend` 必须立即返回。`suspend` 允许虚假返回, 调用方总会重新检查条件。
pub trait Kernel: Sync {
    /// 当前 tick 计数 (允许回绕)
    fn tick_count(&self) -> TickType;

    /// 当前正在运行的任务
    fn current_task(&self) -> TaskId;

    /// 挂起当前任务, `None` 表示无限期
    fn suspend(&self, timeout: Option<TickType>);

    /// 从任务上下文唤醒任务
    fn wake(&self, task: TaskId);

    /// 从中断上下文登记一个延迟唤醒, 在 [`Kernel::yield_from_isr`] 时生效
    fn pend_wake_from_isr(&self, task: TaskId);

    /// 中断尾声: 执行登记的延迟唤醒并请求重新调度
    fn yield_from_isr(&self);

    /// 是否处于中断上下文
    fn in_isr(&self) -> bool;
}

/// 内核安装错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KernelError {
    /// 已安装了另一个内核实现
    AlreadyInstalled,
}

static KERNEL: Mutex<Cell<Option<&'static dyn Kernel>>> = Mutex::new(Cell::new(None));

/// 安装进程级内核实现
///
/// 重复安装同一个实例是允许的。
pub fn install(kernel: &'static dyn Kernel) -> Result<(), KernelError> {
    critical_section::with(|cs| {
        let slot = KERNEL.borrow(cs);
        match slot.get() {
            None => {
                slot.set(Some(kernel));
                Ok(())
            }
            Some(current) if same_kernel(current, kernel) => Ok(()),
            Some(_) => Err(KernelError::AlreadyInstalled),
        }
    })
}

/// 已安装的内核 (未安装时返回 `None`)
pub fn try_get() -> Option<&'static dyn Kernel> {
    critical_section::with(|cs| KERNEL.borrow(cs).get())
}

/// 已安装的内核
///
/// # Panics
/// 在 [`install`] 之前使用任何阻塞原语都是启动顺序错误
pub fn get() -> &'static dyn Kernel {
    match try_get() {
        Some(kernel) => kernel,
        None => panic!("kernel::install must run before using sync primitives"),
    }
}

fn same_kernel(a: &dyn Kernel, b: &dyn Kernel) -> bool {
    core::ptr::eq(
        a as *const dyn Kernel as *const (),
        b as *const dyn Kernel as *const (),
    )
}

// ===== tick 换算 =====

/// 毫秒转 tick (向上取整, 非零毫秒至少 1 tick)
pub const fn ms_to_ticks(ms: u32) -> TickType {
    let ticks = (ms as u64 * config::TICK_RATE_HZ as u64).div_ceil(1_000);
    if ticks >= WAIT_FOREVER as u64 {
        WAIT_FOREVER - 1
    } else {
        ticks as TickType
    }
}

/// embassy `Duration` 转 tick
pub fn duration_to_ticks(duration: embassy_time::Duration) -> TickType {
    let ticks = (duration.as_ticks() as u128 * config::TICK_RATE_HZ as u128)
        .div_ceil(embassy_time::TICK_HZ as u128);
    if ticks >= WAIT_FOREVER as u128 {
        WAIT_FOREVER - 1
    } else {
        ticks as TickType
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_to_ticks() {
        assert_eq!(ms_to_ticks(0), 0);
        assert_eq!(ms_to_ticks(1), 1);
        assert_eq!(ms_to_ticks(250), 250);
        assert_eq!(ms_to_ticks(u32::MAX), WAIT_FOREVER - 1);
    }

    #[test]
    fn test_duration_to_ticks() {
        assert_eq!(duration_to_ticks(embassy_time::Duration::from_millis(100)), 100);
        assert_eq!(duration_to_ticks(embassy_time::Duration::from_micros(1)), 1);
        assert_eq!(duration_to_ticks(embassy_time::Duration::from_ticks(0)), 0);
    }

    #[test]
    fn test_install_same_kernel_twice() {
        let kernel = host::install();
        assert!(install(kernel).is_ok());
        assert!(try_get().is_some());
    }
}
