//! 定长消息队列
//!
//! 固定容量的环形队列, 每个元素是 `item_size` 字节的不透明数据。
//! 任务端、中断端与异步端共享同一个 FIFO, 元素按成功发送的顺序被接收。
//!
//! | 接口 | 阻塞 | 上下文 |
//! |---|---|---|
//! | [`Queue::send_to_back`] / [`Queue::receive`] | 最多 `wait` tick | 任务 |
//! | [`Queue::try_send`] / [`Queue::try_receive`] | 否 | 任务 |
//! | [`Queue::send_async`] / [`Queue::receive_async`] | 异步等待 | async 任务 |
//! | [`QueueIsr`] | 否 | 中断 |
//!
//! # Example
//! ```ignore
//! let queue = Queue::create(4, 4)?;
//! queue.send_to_back(&1u32.to_le_bytes(), WAIT_FOREVER)?;
//!
//! let mut out = [0u8; 4];
//! queue.receive(&mut out, ms_to_ticks(100))?;
//! ```

use core::cell::RefCell;
use core::future::poll_fn;
use core::task::Poll;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::waitqueue::MultiWakerRegistration;

use crate::config;
use crate::kernel::wait::{self, Attempt, WaitList};
use crate::kernel::{self, TaskId, TickType};
use crate::util::log::*;

use super::isr::{IsrContext, IsrResult};
use super::ringbuffer::ByteRing;
use super::CreateError;

/// 队列操作错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QueueError {
    /// 等待超时
    Timeout,
    /// 队列已满且不等待
    Full,
    /// 队列为空且不等待
    Empty,
    /// 缓冲区长度与元素大小不符
    ItemSize,
}

struct QueueState {
    ring: ByteRing,
    count: usize,
    capacity: usize,
    item_size: usize,
    rx_waiters: WaitList,
    tx_waiters: WaitList,
    rx_wakers: MultiWakerRegistration<{ config::MAX_ASYNC_WAITERS }>,
    tx_wakers: MultiWakerRegistration<{ config::MAX_ASYNC_WAITERS }>,
}

impl QueueState {
    fn is_full(&self) -> bool {
        self.count == self.capacity
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// 追加到队尾, 返回需要唤醒的接收任务
    fn push(&mut self, item: &[u8]) -> Option<TaskId> {
        self.ring.write(item);
        self.count += 1;
        self.rx_wakers.wake();
        self.rx_waiters.pop()
    }

    /// 从队头取出, 返回需要唤醒的发送任务
    fn pop(&mut self, out: &mut [u8]) -> Option<TaskId> {
        self.ring.read(out);
        self.count -= 1;
        self.tx_wakers.wake();
        self.tx_waiters.pop()
    }

    /// 丢弃队头元素
    fn drop_oldest(&mut self) {
        self.ring.discard(self.item_size);
        self.count -= 1;
    }
}

/// 定长消息队列
pub struct Queue {
    capacity: usize,
    item_size: usize,
    state: BlockingMutex<CriticalSectionRawMutex, RefCell<QueueState>>,
}

impl Queue {
    /// 创建容量为 `capacity`、元素大小为 `item_size` 字节的队列
    ///
    /// `item_size` 为 0 时队列只计数, 可当作计数信号量使用。
    pub fn create(capacity: usize, item_size: usize) -> Result<Self, CreateError> {
        if capacity == 0 {
            log_warn!("queue capacity must be non-zero");
            return Err(CreateError::InvalidParameter);
        }
        let bytes = capacity
            .checked_mul(item_size)
            .ok_or(CreateError::InvalidParameter)?;

        let ring = ByteRing::with_capacity(bytes)?;
        log_debug!("queue created: {} x {} bytes", capacity, item_size);

        Ok(Self {
            capacity,
            item_size,
            state: BlockingMutex::new(RefCell::new(QueueState {
                ring,
                count: 0,
                capacity,
                item_size,
                rx_waiters: WaitList::new(),
                tx_waiters: WaitList::new(),
                rx_wakers: MultiWakerRegistration::new(),
                tx_wakers: MultiWakerRegistration::new(),
            })),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    fn check_item(&self, len: usize) -> Result<(), QueueError> {
        if len == self.item_size {
            Ok(())
        } else {
            Err(QueueError::ItemSize)
        }
    }

    /// 发送到队尾, 队列满时最多等待 `wait` tick
    pub fn send_to_back(&self, item: &[u8], wait: TickType) -> Result<(), QueueError> {
        self.check_item(item.len())?;

        let result = wait::wait_until(wait, |step| {
            self.state.lock(|state| {
                let mut state = state.borrow_mut();
                if state.is_full() {
                    return state.tx_waiters.park(step);
                }
                state.tx_waiters.remove(step.task());
                let waiter = state.push(item);
                Attempt::Ready((), waiter)
            })
        });

        result.map_err(|_| if wait == 0 { QueueError::Full } else { QueueError::Timeout })
    }

    /// 从队头接收, 队列空时最多等待 `wait` tick
    ///
    /// 超时时队列保持不变。
    pub fn receive(&self, out: &mut [u8], wait: TickType) -> Result<(), QueueError> {
        self.check_item(out.len())?;

        let result = wait::wait_until(wait, |step| {
            self.state.lock(|state| {
                let mut state = state.borrow_mut();
                if state.is_empty() {
                    return state.rx_waiters.park(step);
                }
                state.rx_waiters.remove(step.task());
                let waiter = state.pop(out);
                Attempt::Ready((), waiter)
            })
        });

        result.map_err(|_| if wait == 0 { QueueError::Empty } else { QueueError::Timeout })
    }

    #[inline]
    pub fn try_send(&self, item: &[u8]) -> Result<(), QueueError> {
        self.send_to_back(item, 0)
    }

    #[inline]
    pub fn try_receive(&self, out: &mut [u8]) -> Result<(), QueueError> {
        self.receive(out, 0)
    }

    /// 异步发送, 队列满时挂起当前 future
    pub async fn send_async(&self, item: &[u8]) -> Result<(), QueueError> {
        self.check_item(item.len())?;

        let waiter = poll_fn(|cx| {
            self.state.lock(|state| {
                let mut state = state.borrow_mut();
                if state.is_full() {
                    state.tx_wakers.register(cx.waker());
                    return Poll::Pending;
                }
                Poll::Ready(state.push(item))
            })
        })
        .await;

        if let Some(task) = waiter {
            kernel::get().wake(task);
        }
        Ok(())
    }

    /// 异步接收, 队列空时挂起当前 future
    pub async fn receive_async(&self, out: &mut [u8]) -> Result<(), QueueError> {
        self.check_item(out.len())?;

        let waiter = poll_fn(|cx| {
            self.state.lock(|state| {
                let mut state = state.borrow_mut();
                if state.is_empty() {
                    state.rx_wakers.register(cx.waker());
                    return Poll::Pending;
                }
                Poll::Ready(state.pop(out))
            })
        })
        .await;

        if let Some(task) = waiter {
            kernel::get().wake(task);
        }
        Ok(())
    }

    /// 队列中的元素个数
    pub fn len(&self) -> usize {
        self.state.lock(|state| state.borrow().count)
    }

    pub fn spaces_available(&self) -> usize {
        self.capacity - self.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    /// 阻塞在接收上的任务数
    pub fn receivers_waiting(&self) -> usize {
        self.state.lock(|state| state.borrow().rx_waiters.len())
    }

    /// 阻塞在发送上的任务数
    pub fn senders_waiting(&self) -> usize {
        self.state.lock(|state| state.borrow().tx_waiters.len())
    }

    /// 中断端句柄
    pub fn isr(&self) -> QueueIsr<'_> {
        QueueIsr { queue: self }
    }

    /// 删除队列, 释放存储
    pub fn delete(self) {
        let waiting = self.receivers_waiting() + self.senders_waiting();
        debug_assert_msg!(waiting == 0, "queue deleted while tasks are blocked on it");
        drop(self);
    }
}

/// 队列的中断端句柄
///
/// 所有操作都不会挂起; 需要唤醒的任务登记为延迟唤醒,
/// 并通过返回值和 [`IsrContext`] 同时报告。
#[derive(Clone, Copy)]
pub struct QueueIsr<'q> {
    queue: &'q Queue,
}

impl QueueIsr<'_> {
    /// 发送到队尾, 队列满时立即失败
    pub fn send_to_back_from_isr(self, cx: &IsrContext, item: &[u8]) -> IsrResult<(), QueueError> {
        if let Err(err) = self.queue.check_item(item.len()) {
            return IsrResult::err(err, false);
        }

        let pushed = self.queue.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.is_full() {
                return Err(QueueError::Full);
            }
            Ok(state.push(item))
        });

        match pushed {
            Ok(waiter) => IsrResult::ok((), cx.defer_wake(waiter)),
            Err(err) => IsrResult::err(err, false),
        }
    }

    /// 发送到队尾, 队列满时覆盖最旧的元素
    ///
    /// 成功返回 `true` 表示有元素被覆盖。
    pub fn send_overwriting_from_isr(self, cx: &IsrContext, item: &[u8]) -> IsrResult<bool, QueueError> {
        if let Err(err) = self.queue.check_item(item.len()) {
            return IsrResult::err(err, false);
        }

        let (overwritten, waiter) = self.queue.state.lock(|state| {
            let mut state = state.borrow_mut();
            let overwritten = state.is_full();
            if overwritten {
                state.drop_oldest();
            }
            (overwritten, state.push(item))
        });

        IsrResult::ok(overwritten, cx.defer_wake(waiter))
    }

    /// 从队头接收, 队列空时立即失败
    pub fn receive_from_isr(self, cx: &IsrContext, out: &mut [u8]) -> IsrResult<(), QueueError> {
        if let Err(err) = self.queue.check_item(out.len()) {
            return IsrResult::err(err, false);
        }

        let popped = self.queue.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.is_empty() {
                return Err(QueueError::Empty);
            }
            Ok(state.pop(out))
        });

        match popped {
            Ok(waiter) => IsrResult::ok((), cx.defer_wake(waiter)),
            Err(err) => IsrResult::err(err, false),
        }
    }
}
