//! 内存管理模块
//!
//! 内核对象的动态后备存储全部通过这里分配。分配失败以
//! [`AllocError`] 返回, 而不是走全局分配器的 abort 路径,
//! 这样创建函数可以把内存耗尽报告给调用方。

use alloc::boxed::Box;
use alloc::vec::Vec;

/// 分配失败
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AllocError;

/// 分配 `len` 字节的零初始化缓冲区
pub fn try_alloc_bytes(len: usize) -> Result<Box<[u8]>, AllocError> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(len).map_err(|_| AllocError)?;
    buffer.resize(len, 0);
    Ok(buffer.into_boxed_slice())
}

/// 可失败的 `Box::new`
pub fn try_box<T>(value: T) -> Result<Box<T>, AllocError> {
    let mut slot = Vec::new();
    slot.try_reserve_exact(1).map_err(|_| AllocError)?;
    slot.push(value);

    let raw = Box::into_raw(slot.into_boxed_slice()) as *mut T;
    // SAFETY: 长度为 1 的 `[T]` 与 `T` 布局相同, 分配来自同一全局分配器
    Ok(unsafe { Box::from_raw(raw) })
}
