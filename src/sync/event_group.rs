//! 事件标志组
//!
//! 一个 [`EventBits`] 字中的低 24 位可用 (高 8 位保留给内核控制位)。
//! 任务等待其中任意一位或全部位被置位, 并可选在返回时清除所等待的位。
//!
//! 置位时在同一临界区内判定所有等待者: 同一次置位满足的等待者全部返回,
//! 它们要求清除的位在判定结束后才统一清除。
//!
//! 对象本身不分配内存, 可直接放在 `static` 中:
//! ```ignore
//! static EVENTS: EventGroup = EventGroup::new(0);
//! const RX_DONE: EventBits = 1 << 0;
//! const TX_DONE: EventBits = 1 << 1;
//!
//! // 中断或其他任务
//! EVENTS.set(RX_DONE);
//!
//! // 处理任务
//! let fired = EVENTS.wait_for_any_and_clear(RX_DONE | TX_DONE, WAIT_FOREVER)?;
//! ```

use core::cell::RefCell;
use core::convert::Infallible;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use heapless::{Deque, Vec};

use crate::config;
use crate::kernel::wait::{self, Attempt, Step};
use crate::kernel::{self, TaskId, TickType};
use crate::util::log::*;

use super::isr::{IsrContext, IsrResult};

/// 事件标志字
pub type EventBits = u32;

/// 可用的标志位
pub const EVENT_BITS_MASK: EventBits = 0x00FF_FFFF;

/// 等待超时, 附带超时时刻的标志值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EventTimeout {
    pub bits: EventBits,
}

/// 等待条件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WaitFor {
    /// 任意一位
    Any,
    /// 全部位
    All,
}

impl WaitFor {
    fn matches(self, bits: EventBits, wanted: EventBits) -> bool {
        match self {
            WaitFor::Any => bits & wanted != 0,
            WaitFor::All => bits & wanted == wanted,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    task: TaskId,
    wanted: EventBits,
    mode: WaitFor,
    clear: bool,
    /// 被置位操作满足时的标志值
    fired: Option<EventBits>,
}

struct GroupState {
    bits: EventBits,
    waiters: Vec<Waiter, { config::MAX_WAITERS }>,
}

impl GroupState {
    /// 置位并判定所有等待者, 返回置位后的值与被满足的任务
    fn set(&mut self, bits: EventBits) -> (EventBits, Deque<TaskId, { config::MAX_WAITERS }>) {
        self.bits |= bits;

        let mut to_clear = 0;
        let mut woken = Deque::new();
        for waiter in self.waiters.iter_mut().filter(|waiter| waiter.fired.is_none()) {
            if waiter.mode.matches(self.bits, waiter.wanted) {
                waiter.fired = Some(self.bits);
                if waiter.clear {
                    to_clear |= waiter.wanted;
                }
                // 容量与等待表相同
                let _ = woken.push_back(waiter.task);
            }
        }

        self.bits &= !to_clear;
        (self.bits, woken)
    }

    fn position(&self, task: TaskId) -> Option<usize> {
        self.waiters.iter().position(|waiter| waiter.task == task)
    }

    /// 阻塞循环中的一次检查
    fn attempt(&mut self, step: Step, wanted: EventBits, mode: WaitFor, clear: bool) -> Attempt<EventBits> {
        let task = step.task();

        if let Some(index) = self.position(task) {
            if let Some(fired) = self.waiters[index].fired {
                self.waiters.swap_remove(index);
                return Attempt::Ready(fired, None);
            }
            if let Step::Final(_) = step {
                self.waiters.swap_remove(index);
                return Attempt::Expired;
            }
            return Attempt::Parked;
        }

        if mode.matches(self.bits, wanted) {
            let fired = self.bits;
            if clear {
                self.bits &= !wanted;
            }
            return Attempt::Ready(fired, None);
        }

        match step {
            Step::Final(_) => Attempt::Expired,
            Step::Register(task) => {
                let waiter = Waiter { task, wanted, mode, clear, fired: None };
                if self.waiters.push(waiter).is_ok() {
                    Attempt::Parked
                } else {
                    Attempt::Busy
                }
            }
        }
    }
}

/// 事件标志组
pub struct EventGroup {
    state: BlockingMutex<CriticalSectionRawMutex, RefCell<GroupState>>,
}

impl EventGroup {
    pub const fn new(initial: EventBits) -> Self {
        Self {
            state: BlockingMutex::new(RefCell::new(GroupState {
                bits: initial & EVENT_BITS_MASK,
                waiters: Vec::new(),
            })),
        }
    }

    /// 当前标志值
    pub fn get(&self) -> EventBits {
        self.state.lock(|state| state.borrow().bits)
    }

    /// 置位, 返回置位并处理完等待者之后的标志值
    ///
    /// 被满足且要求清除的等待者会让返回值中对应的位已经清零。
    pub fn set(&self, bits: EventBits) -> EventBits {
        debug_assert_msg!(bits & !EVENT_BITS_MASK == 0, "event bits overlap the control byte");

        let (now, woken) = self.state.lock(|state| state.borrow_mut().set(bits & EVENT_BITS_MASK));
        if !woken.is_empty() {
            wait::wake_all(kernel::get(), woken);
        }
        now
    }

    /// 中断中置位, 被满足的等待者登记为延迟唤醒
    pub fn set_from_isr(&self, cx: &IsrContext, bits: EventBits) -> IsrResult<EventBits, Infallible> {
        debug_assert_msg!(bits & !EVENT_BITS_MASK == 0, "event bits overlap the control byte");

        let (now, woken) = self.state.lock(|state| state.borrow_mut().set(bits & EVENT_BITS_MASK));
        let mut need_wake = false;
        for task in woken {
            need_wake |= cx.defer_wake(Some(task));
        }
        IsrResult::ok(now, need_wake)
    }

    /// 清除, 返回清除之前的标志值
    pub fn clear(&self, bits: EventBits) -> EventBits {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let before = state.bits;
            state.bits &= !bits;
            before
        })
    }

    /// 等待 `wanted` 中的位, 最多 `wait` tick
    ///
    /// 返回条件满足时的标志值 (清除之前)。
    pub fn wait_bits(
        &self,
        wanted: EventBits,
        mode: WaitFor,
        clear: bool,
        wait: TickType,
    ) -> Result<EventBits, EventTimeout> {
        debug_assert_msg!(wanted != 0, "waiting for an empty event mask");
        debug_assert_msg!(wanted & !EVENT_BITS_MASK == 0, "event bits overlap the control byte");

        let mut last = 0;
        let result = wait::wait_until(wait, |step| {
            self.state.lock(|state| {
                let mut state = state.borrow_mut();
                let attempt = state.attempt(step, wanted, mode, clear);
                last = state.bits;
                attempt
            })
        });

        result.map_err(|_| EventTimeout { bits: last })
    }

    /// 等待任意一位, 返回前清除所等待的位
    pub fn wait_for_any_and_clear(&self, wanted: EventBits, wait: TickType) -> Result<EventBits, EventTimeout> {
        self.wait_bits(wanted, WaitFor::Any, true, wait)
    }

    /// 等待全部位, 不清除
    pub fn wait_for_all(&self, wanted: EventBits, wait: TickType) -> Result<EventBits, EventTimeout> {
        self.wait_bits(wanted, WaitFor::All, false, wait)
    }

    /// 同步点: 置位 `set` 后等待 `wait_for` 全部置位, 返回前清除 `wait_for`
    ///
    /// 置位、判定与登记在同一临界区内完成, 最后到达的任务不会错过其他参与者。
    pub fn sync(&self, set: EventBits, wait_for: EventBits, wait: TickType) -> Result<EventBits, EventTimeout> {
        debug_assert_msg!(wait_for != 0, "waiting for an empty event mask");
        debug_assert_msg!(
            (set | wait_for) & !EVENT_BITS_MASK == 0,
            "event bits overlap the control byte"
        );

        let kernel = kernel::get();
        let task = kernel.current_task();

        let (first, woken) = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let before = state.bits;
            let (_, woken) = state.set(set & EVENT_BITS_MASK);

            let view = before | set;
            if view & wait_for == wait_for {
                state.bits &= !wait_for;
                return (Some(Ok(view)), woken);
            }
            if wait == 0 {
                return (Some(Err(EventTimeout { bits: state.bits })), woken);
            }

            let waiter = Waiter {
                task,
                wanted: wait_for,
                mode: WaitFor::All,
                clear: true,
                fired: None,
            };
            if state.waiters.push(waiter).is_err() {
                log_warn!("event group wait table full, sync falls back to polling");
            }
            (None, woken)
        });

        if !woken.is_empty() {
            wait::wake_all(kernel, woken);
        }
        match first {
            Some(result) => result,
            None => self.wait_bits(wait_for, WaitFor::All, true, wait),
        }
    }

    /// 阻塞等待中的任务数
    pub fn waiters(&self) -> usize {
        self.state.lock(|state| state.borrow().waiters.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{host, Kernel, WAIT_FOREVER};
    use std::thread;
    use std::time::Duration;

    const RX: EventBits = 1 << 0;
    const TX: EventBits = 1 << 1;
    const ERR: EventBits = 1 << 2;

    fn wait_for(mut condition: impl FnMut() -> bool) {
        while !condition() {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_set_and_clear_report_values() {
        host::install();
        let events = EventGroup::new(ERR);

        assert_eq!(events.set(RX), RX | ERR);
        assert_eq!(events.clear(ERR), RX | ERR);
        assert_eq!(events.get(), RX);
        assert_eq!(EventGroup::new(0xFF00_0001).get(), 1);
    }

    #[test]
    fn test_wait_any_and_clear_only_clears_wanted() {
        host::install();
        static EVENTS: EventGroup = EventGroup::new(RX | ERR);

        assert_eq!(EVENTS.wait_for_any_and_clear(RX | TX, 0), Ok(RX | ERR));
        assert_eq!(EVENTS.get(), ERR);
        assert_eq!(
            EVENTS.wait_for_any_and_clear(RX | TX, 0),
            Err(EventTimeout { bits: ERR })
        );
    }

    #[test]
    fn test_wait_timeout_reports_bits() {
        let kernel = host::install();
        let events = EventGroup::new(RX);

        let start = kernel.tick_count();
        assert_eq!(events.wait_for_all(RX | TX, 20), Err(EventTimeout { bits: RX }));
        assert!(kernel.tick_count().wrapping_sub(start) >= 20);
        assert_eq!(events.waiters(), 0);
    }

    #[test]
    fn test_blocked_waiter_woken_by_set() {
        let kernel = host::install();
        let events = EventGroup::new(0);

        thread::scope(|s| {
            let waiter = s.spawn(|| events.wait_for_all(RX | TX, 2_000));
            wait_for(|| events.waiters() == 1);

            events.set(RX);
            thread::sleep(Duration::from_millis(20));
            assert_eq!(events.waiters(), 1);

            let start = kernel.tick_count();
            events.set(TX);
            assert_eq!(waiter.join().unwrap(), Ok(RX | TX));
            assert!(kernel.tick_count().wrapping_sub(start) < 1_000);
        });

        assert_eq!(events.get(), RX | TX);
    }

    #[test]
    fn test_one_set_satisfies_every_matching_waiter() {
        host::install();
        let events = EventGroup::new(0);

        thread::scope(|s| {
            let clearing = s.spawn(|| events.wait_for_any_and_clear(RX, WAIT_FOREVER));
            wait_for(|| events.waiters() == 1);
            let observing = s.spawn(|| events.wait_for_all(RX | TX, WAIT_FOREVER));
            wait_for(|| events.waiters() == 2);

            // 第一个等待者清除 RX 不影响第二个等待者看到 RX | TX
            assert_eq!(events.set(RX | TX), TX);
            assert_eq!(clearing.join().unwrap(), Ok(RX | TX));
            assert_eq!(observing.join().unwrap(), Ok(RX | TX));
        });

        assert_eq!(events.get(), TX);
    }

    #[test]
    fn test_sync_releases_all_parties() {
        host::install();
        let events = EventGroup::new(0);
        let all = RX | TX | ERR;

        thread::scope(|s| {
            let first = s.spawn(|| events.sync(RX, all, WAIT_FOREVER));
            wait_for(|| events.waiters() == 1);
            let second = s.spawn(|| events.sync(TX, all, WAIT_FOREVER));
            wait_for(|| events.waiters() == 2);

            assert_eq!(events.sync(ERR, all, WAIT_FOREVER), Ok(all));
            assert_eq!(first.join().unwrap(), Ok(all));
            assert_eq!(second.join().unwrap(), Ok(all));
        });

        assert_eq!(events.get(), 0);
        assert_eq!(events.sync(RX, RX | TX, 0), Err(EventTimeout { bits: RX }));
    }

    #[test]
    fn test_isr_set_defers_wake() {
        let kernel = host::install();
        let events = EventGroup::new(0);

        thread::scope(|s| {
            let waiter = s.spawn(|| events.wait_for_any_and_clear(TX, WAIT_FOREVER));
            wait_for(|| events.waiters() == 1);

            let result = kernel.interrupt(|cx| events.set_from_isr(cx, TX | ERR));
            assert_eq!(result.result, Ok(ERR));
            assert!(result.need_wake);
            assert_eq!(waiter.join().unwrap(), Ok(TX | ERR));
        });

        let result = kernel.interrupt(|cx| events.set_from_isr(cx, RX));
        assert!(!result.need_wake);
    }

    #[test]
    #[should_panic(expected = "event bits overlap the control byte")]
    fn test_control_byte_rejected_in_debug() {
        host::install();
        EventGroup::new(0).set(1 << 24);
    }
}
