//! 递归锁与条件锁
//!
//! 基于 parking_lot，平台差异（pthread / Win32）由 parking_lot 屏蔽。

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard, ReentrantMutex, ReentrantMutexGuard};

/// 递归锁：同一线程可以重复获取
///
/// 只提供共享访问；需要修改内部状态时配合 `RefCell` 使用。
#[derive(Debug, Default)]
pub struct RecursiveMutex<T> {
    inner: ReentrantMutex<T>,
}

impl<T> RecursiveMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: ReentrantMutex::new(value),
        }
    }

    #[inline]
    pub fn lock(&self) -> ReentrantMutexGuard<'_, T> {
        self.inner.lock()
    }

    #[inline]
    pub fn try_lock(&self) -> Option<ReentrantMutexGuard<'_, T>> {
        self.inner.try_lock()
    }
}

/// 等待结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Notified,
    TimedOut,
}

/// 条件锁：lock + wait / notify + 超时 wait
///
/// `notify` 最多唤醒一个等待者，没有等待者时是成功的空操作（无广播语义）。
#[derive(Debug, Default)]
pub struct CondMutex<T> {
    data: Mutex<T>,
    cond: Condvar,
}

impl<T> CondMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            data: Mutex::new(value),
            cond: Condvar::new(),
        }
    }

    #[inline]
    pub fn lock(&self) -> CondGuard<'_, T> {
        CondGuard {
            guard: self.data.lock(),
            cond: &self.cond,
        }
    }

    /// 唤醒一个等待者，返回是否真的唤醒了线程
    #[inline]
    pub fn notify(&self) -> bool {
        self.cond.notify_one()
    }
}

/// `CondMutex` 的锁守卫
pub struct CondGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    cond: &'a Condvar,
}

impl<T> CondGuard<'_, T> {
    /// 原子地释放锁并阻塞，直到被 notify；返回前重新持有锁
    pub fn wait(&mut self) {
        self.cond.wait(&mut self.guard);
    }

    /// 同 `wait`，但超时后返回 `TimedOut`
    ///
    /// `timeout_millis <= 0` 时立即返回 `TimedOut`。
    pub fn wait_millis(&mut self, timeout_millis: i64) -> WaitResult {
        if timeout_millis <= 0 {
            return WaitResult::TimedOut;
        }
        let timeout = Duration::from_millis(timeout_millis as u64);
        if self.cond.wait_for(&mut self.guard, timeout).timed_out() {
            WaitResult::TimedOut
        } else {
            WaitResult::Notified
        }
    }
}

impl<T> Deref for CondGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for CondGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
