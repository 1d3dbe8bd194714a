//! 字节流缓冲区
//!
//! 单个环形字节缓冲区加一个触发水位 (trigger level):
//! - 进入接收时缓冲区非空, 立即读出现有数据
//! - 接收方一旦阻塞, 只有缓冲字节数达到触发水位才会被唤醒
//! - [`StreamBuffer::flush`] 让阻塞的接收方立即取走不足水位的数据
//! - [`StreamBuffer::close`] 之后发送失败, 接收方读完剩余数据后得到 `Closed`
//! - 接收超时时返回已缓冲的部分数据, 缓冲区为空才报超时
//!
//! 发送方等待 `min(len, capacity)` 字节的空间后写入尽可能多的数据,
//! 超时时写入放得下的部分, 一字节都写不进才报超时。
//!
//! 多个任务等待时: 每次读出都唤醒全部发送方各自重新判断空间;
//! 读出或写入后缓冲仍达到水位, 就接着唤醒下一个接收方。
//!
//! # Example
//! ```ignore
//! let stream = StreamBuffer::create(256, 16)?;
//!
//! // 生产者
//! stream.send(&frame, WAIT_FOREVER)?;
//!
//! // 消费者: 至少凑满 16 字节才被唤醒
//! let mut buf = [0u8; 64];
//! let n = stream.receive(&mut buf, ms_to_ticks(50))?;
//! ```

use core::cell::RefCell;
use core::future::poll_fn;
use core::task::Poll;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::waitqueue::MultiWakerRegistration;
use heapless::Deque;

use crate::config;
use crate::kernel::wait::{self, Attempt, Step, WaitList};
use crate::kernel::{self, TaskId, TickType};
use crate::util::log::*;

use super::isr::{IsrContext, IsrResult};
use super::ringbuffer::ByteRing;
use super::CreateError;

/// 流缓冲区操作错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StreamError {
    /// 等待超时
    Timeout,
    /// 流已关闭
    Closed,
    /// 没有空间且不等待
    Full,
    /// 没有数据且不等待
    Empty,
    /// 触发水位超过容量
    TriggerLevel,
}

type Transfer = Result<usize, StreamError>;

struct StreamState {
    ring: ByteRing,
    trigger: usize,
    flushed: bool,
    closed: bool,
    rx_waiters: WaitList,
    tx_waiters: WaitList,
    rx_wakers: MultiWakerRegistration<{ config::MAX_ASYNC_WAITERS }>,
    tx_wakers: MultiWakerRegistration<{ config::MAX_ASYNC_WAITERS }>,
}

impl StreamState {
    /// 接收能否立即完成; `blocked` 表示接收方已经阻塞过
    fn readable(&self, blocked: bool) -> bool {
        if self.closed || (self.flushed && !self.ring.is_empty()) {
            return true;
        }
        if blocked {
            self.ring.len() >= self.trigger
        } else {
            !self.ring.is_empty()
        }
    }

    /// 写入并在达到水位时选出要唤醒的接收方
    fn put(&mut self, data: &[u8]) -> (usize, Handoff) {
        let written = self.ring.write(data);
        let mut handoff = Handoff::none();
        if written > 0 {
            handoff.receiver = self.wake_trigger();
        }
        (written, handoff)
    }

    /// 读出数据; 已关闭且读空时返回 `Closed`
    ///
    /// 所有阻塞的发送方都被唤醒重新判断空间 (请求大小各不相同),
    /// 剩余数据仍达到水位时再唤醒下一个接收方。
    fn take(&mut self, out: &mut [u8]) -> (Transfer, Handoff) {
        if self.ring.is_empty() {
            return (Err(StreamError::Closed), Handoff::none());
        }
        let read = self.ring.read(out);
        self.flushed = false;
        self.tx_wakers.wake();

        let handoff = Handoff {
            receiver: self.wake_trigger(),
            senders: self.tx_waiters.drain(),
        };
        (Ok(read), handoff)
    }

    fn wake_trigger(&mut self) -> Option<TaskId> {
        if self.ring.len() < self.trigger {
            return None;
        }
        self.rx_wakers.wake();
        self.rx_waiters.pop()
    }
}

/// 一次传输后要在临界区外唤醒的任务
struct Handoff {
    receiver: Option<TaskId>,
    senders: Deque<TaskId, { config::MAX_WAITERS }>,
}

impl Handoff {
    const fn none() -> Self {
        Self { receiver: None, senders: Deque::new() }
    }

    fn wake(self) {
        if self.receiver.is_none() && self.senders.is_empty() {
            return;
        }
        let kernel = kernel::get();
        if let Some(task) = self.receiver {
            kernel.wake(task);
        }
        wait::wake_all(kernel, self.senders);
    }

    /// 中断中登记延迟唤醒, 返回是否有任务登记
    fn defer(self, cx: &IsrContext) -> bool {
        let mut need_wake = cx.defer_wake(self.receiver);
        for task in self.senders {
            need_wake |= cx.defer_wake(Some(task));
        }
        need_wake
    }
}

/// 字节流缓冲区
pub struct StreamBuffer {
    capacity: usize,
    state: BlockingMutex<CriticalSectionRawMutex, RefCell<StreamState>>,
}

impl StreamBuffer {
    /// 创建容量为 `capacity` 字节的流缓冲区
    ///
    /// 触发水位为 0 时按 1 处理, 超过容量返回 `InvalidParameter`。
    pub fn create(capacity: usize, trigger_level: usize) -> Result<Self, CreateError> {
        if capacity == 0 || trigger_level > capacity {
            log_warn!("invalid stream buffer size {} / trigger {}", capacity, trigger_level);
            return Err(CreateError::InvalidParameter);
        }

        let ring = ByteRing::with_capacity(capacity)?;
        log_debug!("stream buffer created: {} bytes", capacity);

        Ok(Self {
            capacity,
            state: BlockingMutex::new(RefCell::new(StreamState {
                ring,
                trigger: trigger_level.max(1),
                flushed: false,
                closed: false,
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

    /// 发送字节, 空间不足时最多等待 `wait` tick
    ///
    /// 返回实际写入的字节数, 可能少于 `data.len()`。
    pub fn send(&self, data: &[u8], wait: TickType) -> Result<usize, StreamError> {
        let needed = data.len().min(self.capacity);

        let result = wait::wait_until(wait, |step| {
            self.state.lock(|state| {
                let mut state = state.borrow_mut();
                let task = step.task();

                if state.closed {
                    state.tx_waiters.remove(task);
                    return Attempt::Ready((Err(StreamError::Closed), Handoff::none()), None);
                }

                let space = state.ring.available_write();
                let timed_out = matches!(step, Step::Final(_));
                if space >= needed || (timed_out && space > 0) {
                    state.tx_waiters.remove(task);
                    let (written, handoff) = state.put(data);
                    return Attempt::Ready((Ok(written), handoff), None);
                }

                state.tx_waiters.park(step)
            })
        });

        match result {
            Ok((transfer, handoff)) => {
                handoff.wake();
                transfer
            }
            Err(_) if wait == 0 => Err(StreamError::Full),
            Err(_) => Err(StreamError::Timeout),
        }
    }

    /// 接收字节, 最多等待 `wait` tick
    ///
    /// 返回读出的字节数。
    pub fn receive(&self, out: &mut [u8], wait: TickType) -> Result<usize, StreamError> {
        if out.is_empty() {
            return Ok(0);
        }

        let mut blocked = false;
        let result = wait::wait_until(wait, |step| {
            self.state.lock(|state| {
                let mut state = state.borrow_mut();
                let task = step.task();
                let timed_out = matches!(step, Step::Final(_));

                if state.readable(blocked) || (timed_out && !state.ring.is_empty()) {
                    state.rx_waiters.remove(task);
                    return Attempt::Ready(state.take(out), None);
                }

                blocked = true;
                state.rx_waiters.park(step)
            })
        });

        match result {
            Ok((transfer, handoff)) => {
                handoff.wake();
                transfer
            }
            Err(_) if wait == 0 => Err(StreamError::Empty),
            Err(_) => Err(StreamError::Timeout),
        }
    }

    #[inline]
    pub fn try_send(&self, data: &[u8]) -> Result<usize, StreamError> {
        self.send(data, 0)
    }

    #[inline]
    pub fn try_receive(&self, out: &mut [u8]) -> Result<usize, StreamError> {
        self.receive(out, 0)
    }

    /// 异步发送
    pub async fn send_async(&self, data: &[u8]) -> Result<usize, StreamError> {
        let needed = data.len().min(self.capacity);

        let (transfer, handoff) = poll_fn(|cx| {
            self.state.lock(|state| {
                let mut state = state.borrow_mut();
                if state.closed {
                    return Poll::Ready((Err(StreamError::Closed), Handoff::none()));
                }
                if state.ring.available_write() < needed {
                    state.tx_wakers.register(cx.waker());
                    return Poll::Pending;
                }
                let (written, handoff) = state.put(data);
                Poll::Ready((Ok(written), handoff))
            })
        })
        .await;

        handoff.wake();
        transfer
    }

    /// 异步接收
    pub async fn receive_async(&self, out: &mut [u8]) -> Result<usize, StreamError> {
        if out.is_empty() {
            return Ok(0);
        }

        let mut blocked = false;
        let (transfer, handoff) = poll_fn(|cx| {
            self.state.lock(|state| {
                let mut state = state.borrow_mut();
                if state.readable(blocked) {
                    return Poll::Ready(state.take(out));
                }
                blocked = true;
                state.rx_wakers.register(cx.waker());
                Poll::Pending
            })
        })
        .await;

        handoff.wake();
        transfer
    }

    /// 让阻塞的接收方立即取走缓冲区中的数据 (即使不足触发水位)
    ///
    /// 缓冲区为空时无效果; 标志在下一次成功读取后清除。
    pub fn flush(&self) {
        let waiters = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.ring.is_empty() {
                return None;
            }
            state.flushed = true;
            state.rx_wakers.wake();
            Some(state.rx_waiters.drain())
        });

        if let Some(waiters) = waiters {
            wait::wake_all(kernel::get(), waiters);
        }
    }

    /// 关闭流, 唤醒所有等待方
    pub fn close(&self) {
        let (receivers, senders) = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.closed = true;
            state.rx_wakers.wake();
            state.tx_wakers.wake();
            (state.rx_waiters.drain(), state.tx_waiters.drain())
        });

        log_debug!("stream buffer closed");
        let kernel = kernel::get();
        wait::wake_all(kernel, receivers);
        wait::wake_all(kernel, senders);
    }

    /// 清空数据并重新打开, 唤醒所有等待方重新判断条件
    pub fn reset(&self) {
        let (receivers, senders) = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.ring.clear();
            state.flushed = false;
            state.closed = false;
            state.rx_wakers.wake();
            state.tx_wakers.wake();
            (state.rx_waiters.drain(), state.tx_waiters.drain())
        });

        let kernel = kernel::get();
        wait::wake_all(kernel, receivers);
        wait::wake_all(kernel, senders);
    }

    /// 修改触发水位, 0 按 1 处理
    pub fn set_trigger_level(&self, level: usize) -> Result<(), StreamError> {
        if level > self.capacity {
            return Err(StreamError::TriggerLevel);
        }

        let waiter = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.trigger = level.max(1);
            state.wake_trigger()
        });

        if let Some(task) = waiter {
            kernel::get().wake(task);
        }
        Ok(())
    }

    pub fn trigger_level(&self) -> usize {
        self.state.lock(|state| state.borrow().trigger)
    }

    /// 已缓冲的字节数
    pub fn bytes_available(&self) -> usize {
        self.state.lock(|state| state.borrow().ring.len())
    }

    pub fn spaces_available(&self) -> usize {
        self.state.lock(|state| state.borrow().ring.available_write())
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock(|state| state.borrow().closed)
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
    pub fn isr(&self) -> StreamIsr<'_> {
        StreamIsr { stream: self }
    }
}

/// 流缓冲区的中断端句柄
#[derive(Clone, Copy)]
pub struct StreamIsr<'s> {
    stream: &'s StreamBuffer,
}

impl StreamIsr<'_> {
    /// 写入放得下的部分, 一字节都放不下时返回 `Full`
    pub fn send_from_isr(self, cx: &IsrContext, data: &[u8]) -> IsrResult<usize, StreamError> {
        let sent = self.stream.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.closed {
                return Err(StreamError::Closed);
            }
            if !data.is_empty() && state.ring.is_full() {
                return Err(StreamError::Full);
            }
            Ok(state.put(data))
        });

        match sent {
            Ok((written, handoff)) => IsrResult::ok(written, handoff.defer(cx)),
            Err(err) => IsrResult::err(err, false),
        }
    }

    /// 读出现有数据, 没有数据时返回 `Empty` (已关闭时 `Closed`)
    pub fn receive_from_isr(self, cx: &IsrContext, out: &mut [u8]) -> IsrResult<usize, StreamError> {
        let received = self.stream.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.ring.is_empty() {
                return Err(if state.closed { StreamError::Closed } else { StreamError::Empty });
            }
            Ok(state.take(out))
        });

        match received {
            Ok((transfer, handoff)) => IsrResult {
                result: transfer,
                need_wake: handoff.defer(cx),
            },
            Err(err) => IsrResult::err(err, false),
        }
    }
}
