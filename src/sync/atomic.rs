//! 原子计数器与指针 CAS
//!
//! 所有操作都使用 `SeqCst`，任意线程无需额外加锁即可读取。

use std::sync::atomic::{AtomicI32, AtomicPtr, Ordering};

/// 原子计数器
///
/// 用于引用计数和 sticky error 标志。
/// `increment` / `decrement` 返回操作之后的值。
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicI32);

impl AtomicCounter {
    pub const fn new(value: i32) -> Self {
        Self(AtomicI32::new(value))
    }

    #[inline]
    pub fn get(&self) -> i32 {
        self.0.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn increment(&self) -> i32 {
        self.0.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    #[inline]
    pub fn decrement(&self) -> i32 {
        self.0.fetch_sub(1, Ordering::SeqCst).wrapping_sub(1)
    }

    /// 当前值等于 `old` 时替换为 `new`，返回是否替换成功
    #[inline]
    pub fn compare_and_swap(&self, old: i32, new: i32) -> bool {
        self.0
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// 指针 CAS
///
/// 用于 lock-free 地转移裸指针的所有权（例如 process context 的安装与拆除）。
#[inline]
pub fn compare_and_swap_ptr<T>(slot: &AtomicPtr<T>, old: *mut T, new: *mut T) -> bool {
    slot.compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}
