//! 扁平接口
//!
//! 与内核原生 API 一一对应的自由函数, 便于从既有代码迁移。
//! 新代码优先使用 [`crate::sync`] 中的类型及其 RAII 守卫。
//!
//! 队列收发以 `bool` 报告成败, 需要区分失败原因时直接使用 [`Queue`]。

use crate::kernel::TickType;
use crate::sync::critical::Spinlock;
use crate::sync::isr::IsrContext;
use crate::sync::mutex::{KernelMutex, MutexKind, MutexStorage};
use crate::sync::queue::{Queue, QueueIsr};
use crate::sync::signal::{InitError, GLOBAL_SIGNAL};
use crate::sync::stream_buffer::StreamBuffer;
use crate::sync::CreateError;
use crate::util::log::*;

// ===== 临界区 =====

/// # Safety
/// 见 [`Spinlock::enter`]
#[inline(always)]
pub unsafe fn critical_enter(lock: &Spinlock) {
    lock.enter();
}

/// # Safety
/// 见 [`Spinlock::exit`]
#[inline(always)]
pub unsafe fn critical_exit(lock: &Spinlock) {
    lock.exit();
}

// ===== 递归互斥锁 =====

pub fn mutex_create_recursive() -> Result<KernelMutex, CreateError> {
    KernelMutex::create_recursive()
}

pub fn mutex_lock_recursive(mutex: &KernelMutex) {
    debug_assert_msg!(
        mutex.kind() == MutexKind::Recursive,
        "recursive lock on a non-recursive mutex"
    );
    mutex.lock();
}

pub fn mutex_unlock_recursive(mutex: &KernelMutex) {
    mutex.unlock();
}

pub fn mutex_delete_recursive(mutex: KernelMutex) {
    mutex.delete();
}

// ===== 静态互斥锁 =====

pub fn mutex_create_static(storage: &'static MutexStorage) -> Result<KernelMutex, CreateError> {
    KernelMutex::create_static(storage)
}

pub fn mutex_lock(mutex: &KernelMutex) {
    mutex.lock();
}

pub fn mutex_unlock(mutex: &KernelMutex) {
    mutex.unlock();
}

// ===== 全局信号锁 =====

pub fn signal_init() -> Result<(), InitError> {
    GLOBAL_SIGNAL.init()
}

pub fn signal_lock() {
    GLOBAL_SIGNAL.lock_raw();
}

pub fn signal_unlock() {
    GLOBAL_SIGNAL.unlock();
}

// ===== 队列 =====

pub fn queue_create(capacity: usize, item_size: usize) -> Result<Queue, CreateError> {
    Queue::create(capacity, item_size)
}

pub fn queue_receive(queue: &Queue, out: &mut [u8], wait: TickType) -> bool {
    queue.receive(out, wait).is_ok()
}

pub fn queue_send_to_back(queue: &Queue, item: &[u8], wait: TickType) -> bool {
    queue.send_to_back(item, wait).is_ok()
}

/// 中断中发送到队尾
///
/// 有任务需要延迟唤醒时把 `need_wake` 置为 `true` (从不清除),
/// 同一中断中的多次调用可以共用一个标志。
pub fn queue_send_to_back_from_isr(
    queue: QueueIsr<'_>,
    cx: &IsrContext,
    item: &[u8],
    need_wake: &mut bool,
) -> bool {
    let result = queue.send_to_back_from_isr(cx, item);
    if result.need_wake {
        *need_wake = true;
    }
    result.is_ok()
}

pub fn queue_delete(queue: Queue) {
    queue.delete();
}

// ===== 流缓冲区 =====

pub fn stream_buffer_create(capacity: usize, trigger_level: usize) -> Result<StreamBuffer, CreateError> {
    StreamBuffer::create(capacity, trigger_level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{host, WAIT_FOREVER};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_critical_section_pairing() {
        static LOCK: Spinlock = Spinlock::new();
        unsafe {
            critical_enter(&LOCK);
            assert!(LOCK.is_locked());
            critical_exit(&LOCK);
        }
        assert!(!LOCK.is_locked());
    }

    #[test]
    fn test_recursive_mutex_calls() {
        host::install();
        let mutex = mutex_create_recursive().unwrap();
        mutex_lock_recursive(&mutex);
        mutex_lock_recursive(&mutex);
        mutex_unlock_recursive(&mutex);
        mutex_unlock_recursive(&mutex);
        mutex_delete_recursive(mutex);
    }

    #[test]
    fn test_static_mutex_calls() {
        host::install();
        static STORAGE: MutexStorage = MutexStorage::new();
        let mutex = mutex_create_static(&STORAGE).unwrap();
        mutex_lock(&mutex);
        assert!(mutex.is_locked());
        mutex_unlock(&mutex);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_signal_calls() {
        host::install();
        let _ = signal_init();
        signal_lock();
        signal_unlock();
        assert_eq!(signal_init(), Err(InitError::AlreadyInitialized));
    }

    #[test]
    fn test_queue_calls() {
        let kernel = host::install();
        let queue = queue_create(1, 2).unwrap();

        assert!(queue_send_to_back(&queue, &[1, 2], 0));
        assert!(!queue_send_to_back(&queue, &[3, 4], 0));

        let mut need_wake = false;
        let sent = kernel.interrupt(|cx| {
            queue_send_to_back_from_isr(queue.isr(), cx, &[5, 6], &mut need_wake)
        });
        assert!(!sent);
        assert!(!need_wake);

        let mut out = [0u8; 2];
        assert!(queue_receive(&queue, &mut out, WAIT_FOREVER));
        assert_eq!(out, [1, 2]);
        assert!(!queue_receive(&queue, &mut out, 5));

        queue_delete(queue);
    }

    #[test]
    fn test_isr_flag_accumulates() {
        let kernel = host::install();
        let queue = queue_create(4, 1).unwrap();

        thread::scope(|s| {
            let receiver = s.spawn(|| {
                let mut out = [0u8; 1];
                queue_receive(&queue, &mut out, WAIT_FOREVER)
            });
            while queue.receivers_waiting() == 0 {
                thread::sleep(Duration::from_millis(1));
            }

            let mut need_wake = false;
            kernel.interrupt(|cx| {
                assert!(queue_send_to_back_from_isr(queue.isr(), cx, &[1], &mut need_wake));
                assert!(queue_send_to_back_from_isr(queue.isr(), cx, &[2], &mut need_wake));
            });
            assert!(need_wake);
            assert!(receiver.join().unwrap());
        });
    }

    #[test]
    fn test_stream_buffer_create() {
        assert!(stream_buffer_create(16, 4).is_ok());
        assert_eq!(stream_buffer_create(4, 16).err(), Some(CreateError::InvalidParameter));
    }
}
