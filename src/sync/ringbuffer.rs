//! 字节环形缓冲区
//!
//! 队列与流缓冲区共用的底层存储:
//! - 容量在运行时确定, 存储一次性分配, 之后不再增长
//! - 不做内部同步, 由所属内核对象在临界区内独占访问
//! - 读写以连续切片为单位完成, 回绕时最多拷贝两段

use alloc::boxed::Box;

use crate::mem::{self, AllocError};

/// 运行时容量的字节环形缓冲区
pub struct ByteRing {
    /// 数据存储
    buffer: Box<[u8]>,
    /// 读取位置
    read: usize,
    /// 已缓冲字节数
    len: usize,
}

impl ByteRing {
    /// 分配 `capacity` 字节的空缓冲区
    pub fn with_capacity(capacity: usize) -> Result<Self, AllocError> {
        Ok(Self {
            buffer: mem::try_alloc_bytes(capacity)?,
            read: 0,
            len: 0,
        })
    }

    /// 缓冲区容量
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// 当前字节数
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// 可写入的空间大小
    #[inline(always)]
    pub fn available_write(&self) -> usize {
        self.capacity() - self.len
    }

    /// 写位置
    #[inline(always)]
    fn write_index(&self) -> usize {
        let capacity = self.capacity();
        if capacity == 0 {
            0
        } else {
            (self.read + self.len) % capacity
        }
    }

    /// 写入尽可能多的数据, 返回实际写入的字节数
    pub fn write(&mut self, data: &[u8]) -> usize {
        let total = data.len().min(self.available_write());
        let mut written = 0;

        while written < total {
            let index = self.write_index();
            // 写到回绕点为止, 下一轮从 0 继续
            let contiguous = (self.capacity() - index).min(total - written);
            self.buffer[index..index + contiguous]
                .copy_from_slice(&data[written..written + contiguous]);
            self.len += contiguous;
            written += contiguous;
        }

        written
    }

    /// 读出尽可能多的数据, 返回实际读取的字节数
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let total = out.len().min(self.len);
        let mut read_total = 0;

        while read_total < total {
            let contiguous = (self.capacity() - self.read).min(total - read_total);
            out[read_total..read_total + contiguous]
                .copy_from_slice(&self.buffer[self.read..self.read + contiguous]);
            self.commit_read(contiguous);
            read_total += contiguous;
        }

        read_total
    }

    /// 丢弃最旧的 `len` 字节
    pub fn discard(&mut self, len: usize) {
        self.commit_read(len.min(self.len));
    }

    #[inline(always)]
    fn commit_read(&mut self, len: usize) {
        self.len -= len;
        self.read = if self.len == 0 {
            // 清空时复位, 让后续写入尽量连续
            0
        } else {
            (self.read + len) % self.capacity()
        };
    }

    /// 清空缓冲区
    #[inline]
    pub fn clear(&mut self) {
        self.read = 0;
        self.len = 0;
    }
}
