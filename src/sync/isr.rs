//! 中断上下文
//!
//! 中断处理函数只能通过 [`IsrContext`] 调用各原语的 ISR 句柄
//! ([`QueueIsr`](crate::sync::queue::QueueIsr),
//! [`StreamIsr`](crate::sync::stream_buffer::StreamIsr))
//! 以及带 `_from_isr` 后缀的方法。
//! 这些操作从不挂起, 需要唤醒的任务只登记为延迟唤醒,
//! 由中断尾声 [`IsrContext::exit`] 统一交给内核调度。

use core::cell::Cell;
use core::marker::PhantomData;

use crate::kernel::{self, TaskId};

/// 中断上下文令牌
///
/// 不可跨上下文传递 (`!Send`/`!Sync`), 只能由中断入口代码创建。
pub struct IsrContext {
    need_wake: Cell<bool>,
    _not_send: PhantomData<*mut ()>,
}

impl IsrContext {
    /// 进入中断上下文
    ///
    /// # Safety
    /// 只能在中断处理函数 (或内核端口的模拟中断) 中调用,
    /// 令牌不得在中断返回后继续使用。
    pub unsafe fn enter() -> Self {
        IsrContext {
            need_wake: Cell::new(false),
            _not_send: PhantomData,
        }
    }

    /// 本次中断中是否有任务等待延迟唤醒
    pub fn need_wake(&self) -> bool {
        self.need_wake.get()
    }

    /// 把被唤醒的任务交给内核延迟调度, 返回本次是否有任务登记
    pub(crate) fn defer_wake(&self, waiter: Option<TaskId>) -> bool {
        let Some(task) = waiter else {
            return false;
        };
        kernel::get().pend_wake_from_isr(task);
        self.need_wake.set(true);
        true
    }

    /// 离开中断上下文但不触发调度, 返回唤醒标志供调用方自行处理
    pub fn into_need_wake(self) -> bool {
        self.need_wake.get()
    }

    /// 中断尾声: 有延迟唤醒时请求内核重新调度
    pub fn exit(self) -> bool {
        let need_wake = self.need_wake.get();
        if need_wake {
            kernel::get().yield_from_isr();
        }
        need_wake
    }
}

/// 中断安全操作的结果, 附带延迟唤醒标志
#[must_use = "must return need_wake back to interrupt callback"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsrResult<T, E> {
    pub result: Result<T, E>,
    pub need_wake: bool,
}

impl<E> Default for IsrResult<(), E> {
    fn default() -> Self {
        IsrResult::ok((), false)
    }
}

impl<T, E> IsrResult<T, E> {
    pub fn ok(value: T, need_wake: bool) -> Self {
        IsrResult { result: Ok(value), need_wake }
    }

    pub fn err(err: E, need_wake: bool) -> Self {
        IsrResult { result: Err(err), need_wake }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn map<U>(self, func: impl FnOnce(T) -> U) -> IsrResult<U, E> {
        IsrResult {
            result: self.result.map(func),
            need_wake: self.need_wake,
        }
    }

    /// 串联两次操作: 结果取后者, 唤醒标志取并集
    pub fn chain<U, F>(self, other: IsrResult<U, F>) -> IsrResult<U, F> {
        IsrResult {
            result: other.result,
            need_wake: self.need_wake || other.need_wake,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_merges_need_wake() {
        let first: IsrResult<(), ()> = IsrResult::ok((), true);
        let second: IsrResult<u8, ()> = IsrResult::ok(7, false);
        let merged = first.chain(second);
        assert_eq!(merged.result, Ok(7));
        assert!(merged.need_wake);
    }

    #[test]
    fn test_map_keeps_need_wake() {
        let result: IsrResult<u8, ()> = IsrResult::ok(2, true);
        let mapped = result.map(|v| v as u32 * 10);
        assert_eq!(mapped.result, Ok(20));
        assert!(mapped.need_wake);
    }

    #[test]
    fn test_context_records_wake() {
        crate::kernel::host::install();
        // SAFETY: 测试中只在本函数内使用令牌
        let cx = unsafe { IsrContext::enter() };
        assert!(!cx.need_wake());
        assert!(!cx.defer_wake(None));
        assert!(!cx.need_wake());
        assert!(cx.defer_wake(Some(TaskId::new(u32::MAX))));
        assert!(!cx.defer_wake(None));
        assert!(cx.exit());
    }
}
