//! 主机端口 (feature `std`)
//!
//! 用 std 线程模拟内核任务, 便于仿真与测试:
//! - 每个线程首次使用时分配一个 [`TaskId`]
//! - 挂起/唤醒映射为 `thread::park_timeout` / `Thread::unpark`
//!   (unpark 先于 park 时 park 立即返回, 满足唤醒许可语义)
//! - tick 源为 `embassy_time::Instant`, 按 [`config::TICK_RATE_HZ`] 换算
//! - [`StdKernel::interrupt`] 在当前线程上模拟一次中断

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, Thread};
use std::time::Duration;
use std::vec::Vec;

use portable_atomic::{AtomicU32, Ordering};

use crate::config;
use crate::sync::isr::IsrContext;

use super::{Kernel, TaskId, TickType};

/// 进程内唯一的主机内核实例
pub static HOST_KERNEL: StdKernel = StdKernel::new();

static NEXT_TASK_ID: AtomicU32 = AtomicU32::new(1);

/// 安装主机内核 (可重复调用)
pub fn install() -> &'static StdKernel {
    // 只有 HOST_KERNEL 这一个实例, 重复安装同一实例总是成功
    let _ = super::install(&HOST_KERNEL);
    &HOST_KERNEL
}

/// 基于 std 线程的内核实现
pub struct StdKernel {
    threads: Mutex<BTreeMap<TaskId, Thread>>,
    deferred: Mutex<Vec<TaskId>>,
}

struct TaskSlot {
    id: TaskId,
}

impl TaskSlot {
    fn register() -> Self {
        let id = TaskId::new(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed));
        lock(&HOST_KERNEL.threads).insert(id, thread::current());
        TaskSlot { id }
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        lock(&HOST_KERNEL.threads).remove(&self.id);
    }
}

thread_local! {
    static CURRENT_TASK: TaskSlot = TaskSlot::register();
    static IN_ISR: Cell<bool> = const { Cell::new(false) };
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StdKernel {
    const fn new() -> Self {
        Self {
            threads: Mutex::new(BTreeMap::new()),
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// 在当前线程上模拟一次中断
    ///
    /// 闭包内 `in_isr()` 为真; 返回后执行中断尾声 (延迟唤醒)。
    pub fn interrupt<R>(&self, handler: impl FnOnce(&IsrContext) -> R) -> R {
        IN_ISR.with(|flag| flag.set(true));

        // SAFETY: 当前线程已标记为中断上下文, 且上下文不会逃出本函数
        let cx = unsafe { IsrContext::enter() };
        let result = handler(&cx);

        IN_ISR.with(|flag| flag.set(false));
        cx.exit();
        result
    }

    /// 等待延迟唤醒的任务数
    pub fn deferred_wakes(&self) -> usize {
        lock(&self.deferred).len()
    }
}

impl Kernel for StdKernel {
    fn tick_count(&self) -> TickType {
        let ticks = embassy_time::Instant::now().as_ticks() as u128
            * config::TICK_RATE_HZ as u128
            / embassy_time::TICK_HZ as u128;
        // tick 计数按 32 位回绕
        ticks as TickType
    }

    fn current_task(&self) -> TaskId {
        CURRENT_TASK.with(|slot| slot.id)
    }

    fn suspend(&self, timeout: Option<TickType>) {
        match timeout {
            None => thread::park(),
            Some(ticks) => {
                let micros = ticks as u64 * 1_000_000 / config::TICK_RATE_HZ as u64;
                thread::park_timeout(Duration::from_micros(micros));
            }
        }
    }

    fn wake(&self, task: TaskId) {
        let thread = lock(&self.threads).get(&task).cloned();
        if let Some(thread) = thread {
            thread.unpark();
        }
    }

    fn pend_wake_from_isr(&self, task: TaskId) {
        lock(&self.deferred).push(task);
    }

    fn yield_from_isr(&self) {
        let pending = core::mem::take(&mut *lock(&self.deferred));
        for task in pending {
            self.wake(task);
        }
    }

    fn in_isr(&self) -> bool {
        IN_ISR.with(|flag| flag.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids_are_per_thread() {
        let kernel = install();
        let here = kernel.current_task();
        assert_eq!(here, kernel.current_task());

        let there = thread::spawn(|| HOST_KERNEL.current_task()).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_wake_before_suspend_returns_immediately() {
        let kernel = install();
        kernel.wake(kernel.current_task());

        let start = kernel.tick_count();
        kernel.suspend(Some(5_000));
        assert!(kernel.tick_count().wrapping_sub(start) < 1_000);
    }

    #[test]
    fn test_interrupt_sets_isr_flag() {
        let kernel = install();
        assert!(!kernel.in_isr());
        let inside = kernel.interrupt(|_cx| HOST_KERNEL.in_isr());
        assert!(inside);
        assert!(!kernel.in_isr());
    }

    #[test]
    fn test_interrupt_epilogue_wakes_deferred_task() {
        let kernel = install();
        let parked = std::sync::Arc::new(portable_atomic::AtomicBool::new(false));
        let (tx, rx) = std::sync::mpsc::channel();

        let flag = parked.clone();
        let sleeper = thread::spawn(move || {
            tx.send(HOST_KERNEL.current_task()).unwrap();
            let start = HOST_KERNEL.tick_count();
            flag.store(true, Ordering::SeqCst);
            HOST_KERNEL.suspend(Some(5_000));
            HOST_KERNEL.tick_count().wrapping_sub(start)
        });
        let task = rx.recv().unwrap();
        while !parked.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }

        let pended = kernel.interrupt(|cx| cx.defer_wake(Some(task)));
        assert!(pended);
        assert!(sleeper.join().unwrap() < 1_000);
    }

    #[test]
    fn test_suspend_timeout_elapses() {
        let kernel = install();
        let start = kernel.tick_count();
        kernel.suspend(Some(20));
        // park_timeout 可能提前返回, 这里只检查不会无限挂起
        assert!(kernel.tick_count().wrapping_sub(start) < 5_000);
    }
}
