//! 值变化通知
//!
//! [`Signal`] 保存一个最新值, 任意数量的 [`Watch`] 观察它。
//! 每个观察者记住自己上次看到的值, 值变化后 `wait` 返回新值;
//! 新建观察者的第一次 `wait` 立即返回当前值。
//!
//! 只比较值而不计数: 两次等待之间值被改掉又改回, 观察者看不到变化。
//!
//! # Example
//! ```ignore
//! static LINK_UP: Signal<bool> = Signal::new(false);
//!
//! // 驱动
//! LINK_UP.set(true);
//!
//! // 观察者任务
//! let mut watch = LINK_UP.watch();
//! loop {
//!     let up = watch.wait_for(WAIT_FOREVER)?;
//!     log_info!("link up: {}", up);
//! }
//! ```

use core::cell::RefCell;
use core::future::poll_fn;
use core::task::Poll;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::waitqueue::MultiWakerRegistration;
use heapless::Deque;

use crate::config;
use crate::kernel::wait::{self, Attempt, WaitList};
use crate::kernel::{self, TaskId, TickType};

use super::isr::IsrContext;

/// 观察者等待超时
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WatchTimeout;

struct SignalState<T> {
    value: T,
    waiters: WaitList,
    wakers: MultiWakerRegistration<{ config::MAX_ASYNC_WAITERS }>,
}

impl<T: Copy + PartialEq> SignalState<T> {
    /// 写入新值; 值有变化时返回要唤醒的阻塞观察者
    fn store(&mut self, value: T) -> Option<Deque<TaskId, { config::MAX_WAITERS }>> {
        if self.value == value {
            return None;
        }
        self.value = value;
        self.wakers.wake();
        Some(self.waiters.drain())
    }
}

/// 可观察的共享值
pub struct Signal<T> {
    state: BlockingMutex<CriticalSectionRawMutex, RefCell<SignalState<T>>>,
}

impl<T: Copy + PartialEq> Signal<T> {
    pub const fn new(init: T) -> Self {
        Self {
            state: BlockingMutex::new(RefCell::new(SignalState {
                value: init,
                waiters: WaitList::new(),
                wakers: MultiWakerRegistration::new(),
            })),
        }
    }

    pub fn get(&self) -> T {
        self.state.lock(|state| state.borrow().value)
    }

    /// 写入新值, 值有变化时唤醒所有观察者
    pub fn set(&self, value: T) {
        let waiters = self.state.lock(|state| state.borrow_mut().store(value));
        if let Some(waiters) = waiters {
            if !waiters.is_empty() {
                wait::wake_all(kernel::get(), waiters);
            }
        }
    }

    /// 中断中写入新值, 返回是否有观察者等待延迟唤醒
    pub fn set_from_isr(&self, cx: &IsrContext, value: T) -> bool {
        let Some(waiters) = self.state.lock(|state| state.borrow_mut().store(value)) else {
            return false;
        };

        let mut need_wake = false;
        for task in waiters {
            need_wake |= cx.defer_wake(Some(task));
        }
        need_wake
    }

    /// 新建观察者
    pub fn watch(&self) -> Watch<'_, T> {
        Watch { signal: self, seen: None }
    }

    /// 阻塞等待中的观察者数
    pub fn watchers_waiting(&self) -> usize {
        self.state.lock(|state| state.borrow().waiters.len())
    }
}

/// [`Signal`] 的观察者
pub struct Watch<'s, T> {
    signal: &'s Signal<T>,
    seen: Option<T>,
}

impl<T: Copy + PartialEq> Watch<'_, T> {
    /// 上一次等到的值
    pub fn seen(&self) -> Option<T> {
        self.seen
    }

    /// 不等待; 值有变化时返回新值
    pub fn try_changed(&mut self) -> Option<T> {
        let value = self.signal.get();
        if self.seen == Some(value) {
            return None;
        }
        self.seen = Some(value);
        Some(value)
    }

    /// 阻塞等待值变化, 最多 `wait` tick
    pub fn wait_for(&mut self, wait: TickType) -> Result<T, WatchTimeout> {
        let signal = self.signal;
        let seen = self.seen;

        let value = wait::wait_until(wait, |step| {
            signal.state.lock(|state| {
                let mut state = state.borrow_mut();
                if seen != Some(state.value) {
                    state.waiters.remove(step.task());
                    return Attempt::Ready(state.value, None);
                }
                state.waiters.park(step)
            })
        })
        .map_err(|_| WatchTimeout)?;

        self.seen = Some(value);
        Ok(value)
    }

    /// 异步等待值变化
    pub async fn wait(&mut self) -> T {
        let signal = self.signal;
        let seen = self.seen;

        let value = poll_fn(|cx| {
            signal.state.lock(|state| {
                let mut state = state.borrow_mut();
                if seen != Some(state.value) {
                    return Poll::Ready(state.value);
                }
                state.wakers.register(cx.waker());
                Poll::Pending
            })
        })
        .await;

        self.seen = Some(value);
        value
    }
}
