//! 原子引用计数的共享资源句柄
//!
//! control context 和 process context 各自持有本地句柄，
//! 二者通过同一个 `Shared<T>` 对一个 native 资源的生命周期达成一致：
//!
//! - `create`: 引用计数 = 1
//! - `retain` / `clone`: 原子 +1
//! - `drop`: 原子 -1，降到 0 的那个线程执行 teardown（payload 的 `Drop`）
//!
//! teardown 可能发生在 control 线程，也可能发生在实时线程。

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{fence, Ordering};

use crate::sync::AtomicCounter;

struct SharedInner<T> {
    ref_counter: AtomicCounter,
    payload: T,
}

/// 引用计数句柄
///
/// 每次 `create` / `retain` 都必须对应一次 release（即 drop）。
pub struct Shared<T> {
    ptr: NonNull<SharedInner<T>>,
    _marker: PhantomData<SharedInner<T>>,
}

unsafe impl<T: Send + Sync> Send for Shared<T> {}
unsafe impl<T: Send + Sync> Sync for Shared<T> {}

impl<T> Shared<T> {
    /// 分配共享结构，引用计数为 1
    pub fn create(payload: T) -> Self {
        let inner = Box::new(SharedInner {
            ref_counter: AtomicCounter::new(1),
            payload,
        });
        Self {
            ptr: NonNull::from(Box::leak(inner)),
            _marker: PhantomData,
        }
    }

    #[inline]
    fn inner(&self) -> &SharedInner<T> {
        // 只要本句柄存在，计数 >= 1，分配不会被释放
        unsafe { self.ptr.as_ref() }
    }

    /// 原子 +1，返回新的句柄
    #[inline]
    pub fn retain(&self) -> Self {
        let count = self.inner().ref_counter.increment();
        debug_assert!(count > 1, "retain on released shared handle");
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }

    /// 当前引用计数
    #[inline]
    pub fn ref_count(&self) -> i32 {
        self.inner().ref_counter.get()
    }

    /// 两个句柄是否指向同一个共享结构
    #[inline]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }

    /// payload 的地址
    ///
    /// 作为不透明参数交给 native 回调；不改变引用计数。
    #[inline]
    pub fn as_ptr(&self) -> *const T {
        &self.inner().payload as *const T
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        self.retain()
    }
}

impl<T> Deref for Shared<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.inner().payload
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        if self.inner().ref_counter.decrement() != 0 {
            return;
        }
        // 与其他线程 release 之前的写入同步
        fence(Ordering::Acquire);
        unsafe {
            drop(Box::from_raw(self.ptr.as_ptr()));
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("ref_count", &self.ref_count())
            .field("payload", &self.inner().payload)
            .finish()
    }
}
