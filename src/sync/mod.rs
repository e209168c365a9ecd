//! 同步原语
//!
//! 包含：
//! - AtomicCounter: 引用计数 / 错误标志
//! - compare_and_swap_ptr: 裸指针所有权转移
//! - RecursiveMutex: 可重入锁
//! - CondMutex: 条件锁（带超时等待）

pub mod atomic;
pub mod mutex;

pub use atomic::{compare_and_swap_ptr, AtomicCounter};
pub use mutex::{CondGuard, CondMutex, RecursiveMutex, WaitResult};
