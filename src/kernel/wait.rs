//! 等待链表与通用阻塞循环
//!
//! 所有阻塞原语共用同一个循环:
//! 1. 临界区内检查条件, 不满足则把当前任务登记到等待链表
//! 2. 退出临界区后挂起 (带剩余超时)
//! 3. 超时后在同一个临界区内做最后一次检查并注销, 保证唤醒不会丢失

use heapless::Deque;

use crate::config;
use crate::util::log::*;

use super::{Kernel, TaskId, TickType, WAIT_FOREVER};

/// 有界 FIFO 等待链表
pub(crate) struct WaitList {
    tasks: Deque<TaskId, { config::MAX_WAITERS }>,
}

impl WaitList {
    pub(crate) const fn new() -> Self {
        Self { tasks: Deque::new() }
    }

    /// 登记任务, 链表已满时返回 `false`
    pub(crate) fn register(&mut self, task: TaskId) -> bool {
        if self.contains(task) {
            return true;
        }
        self.tasks.push_back(task).is_ok()
    }

    pub(crate) fn remove(&mut self, task: TaskId) {
        for _ in 0..self.tasks.len() {
            if let Some(waiting) = self.tasks.pop_front() {
                if waiting != task {
                    // 长度不变, 不会失败
                    let _ = self.tasks.push_back(waiting);
                }
            }
        }
    }

    /// 取出等待最久的任务
    pub(crate) fn pop(&mut self) -> Option<TaskId> {
        self.tasks.pop_front()
    }

    pub(crate) fn contains(&self, task: TaskId) -> bool {
        self.tasks.iter().any(|waiting| *waiting == task)
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    /// 取出全部等待者
    pub(crate) fn drain(&mut self) -> Deque<TaskId, { config::MAX_WAITERS }> {
        core::mem::replace(&mut self.tasks, Deque::new())
    }

    /// 条件不满足时的标准处理: 登记, 或在最后一步注销
    pub(crate) fn park<T>(&mut self, step: Step) -> Attempt<T> {
        match step {
            Step::Register(task) => {
                if self.register(task) {
                    Attempt::Parked
                } else {
                    Attempt::Busy
                }
            }
            Step::Final(task) => {
                self.remove(task);
                Attempt::Expired
            }
        }
    }
}

/// 在临界区外唤醒一批任务
pub(crate) fn wake_all(kernel: &dyn Kernel, tasks: Deque<TaskId, { config::MAX_WAITERS }>) {
    for task in tasks {
        kernel.wake(task);
    }
}

/// 阻塞循环中的一步
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// 条件不满足时登记到等待链表
    Register(TaskId),
    /// 超时前最后一次检查, 条件不满足时必须注销
    Final(TaskId),
}

impl Step {
    pub(crate) fn task(self) -> TaskId {
        match self {
            Step::Register(task) | Step::Final(task) => task,
        }
    }
}

/// 一次尝试的结果
pub(crate) enum Attempt<T> {
    /// 条件满足; 可附带一个需要在临界区外唤醒的任务
    Ready(T, Option<TaskId>),
    /// 已登记到等待链表
    Parked,
    /// 等待链表已满, 按 tick 轮询
    Busy,
    /// `Step::Final` 时条件仍不满足
    Expired,
}

/// 等待超时
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Elapsed;

/// 相对超时的截止点, 对 tick 回绕安全
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    start: TickType,
    wait: TickType,
}

impl Deadline {
    pub(crate) fn after(kernel: &dyn Kernel, wait: TickType) -> Self {
        Self { start: kernel.tick_count(), wait }
    }

    /// 剩余 tick, `None` 表示永久等待
    pub(crate) fn remaining(&self, kernel: &dyn Kernel) -> Option<TickType> {
        if self.wait == WAIT_FOREVER {
            return None;
        }
        let elapsed = kernel.tick_count().wrapping_sub(self.start);
        Some(self.wait.saturating_sub(elapsed))
    }
}

/// 通用阻塞等待
///
/// `attempt` 必须在一个临界区内完成检查与登记/注销。
/// 条件满足时返回的唤醒目标会在临界区外交给内核。
pub(crate) fn wait_until<T>(
    wait: TickType,
    mut attempt: impl FnMut(Step) -> Attempt<T>,
) -> Result<T, Elapsed> {
    let kernel = super::get();
    debug_assert_msg!(!kernel.in_isr(), "blocking sync call from interrupt context");

    let task = kernel.current_task();
    let deadline = Deadline::after(kernel, wait);

    loop {
        let remaining = deadline.remaining(kernel);

        let step = if remaining == Some(0) {
            Step::Final(task)
        } else {
            Step::Register(task)
        };

        let poll_interval = match attempt(step) {
            Attempt::Ready(value, wake) => {
                if let Some(waiter) = wake {
                    kernel.wake(waiter);
                }
                return Ok(value);
            }
            Attempt::Expired => return Err(Elapsed),
            Attempt::Parked => remaining,
            Attempt::Busy => {
                log_trace!("wait list full, polling");
                Some(remaining.map_or(1, |ticks| ticks.min(1)))
            }
        };

        if step == Step::Final(task) {
            // attempt 在 Final 时只能返回 Ready 或 Expired
            return Err(Elapsed);
        }

        kernel.suspend(poll_interval);
    }
}
