//! 实时回调桥
//!
//! 引擎每个周期在自己的实时线程上调用 `process_bridge`，参数为连接共享结构的地址。
//! callback 失败（返回 `Err` 或 panic）时错误被 latch：
//! 消息替换（不拼接）上一次的消息，sticky 标志 +1，唤醒一个在连接上等待的 control 线程。
//! 标志非 0 期间不再调用 callback，直到 control context 调用 `reset_process_error`。
//!
//! 实时线程从不阻塞等待，唯一的锁是 latch 时短暂持有的连接锁。

use std::ffi::c_void;
use std::os::raw::c_int;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;

use crate::client::{Connection, ConnectionShared};

use super::panic_message;

const GENERIC_ERROR: &str = "error in process callback";

/// 交给引擎的 C 回调，永远返回 0
pub extern "C" fn process_bridge(nframes: u32, arg: *mut c_void) -> c_int {
    if arg.is_null() {
        return 0;
    }
    // 引擎只在连接关闭（native close）之前调用，共享结构此时一定存活
    let shared = unsafe { &*(arg as *const ConnectionShared) };

    shared.current_nframes.store(nframes, Ordering::SeqCst);

    let ctx = shared.process_context.load(Ordering::SeqCst);
    if !ctx.is_null()
        && shared.callback_registered.load(Ordering::SeqCst)
        && shared.error_flag.get() == 0
    {
        // 同一连接的回调是串行的，context 在此期间只被本线程访问
        let ctx = unsafe { &mut *ctx };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| ctx.run_callback(nframes)));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(payload) => Some(panic_message(payload.as_ref()).unwrap_or_default()),
        };
        if let Some(message) = failure {
            shared.latch_error(message);
        }
        ctx.end_cycle();
    }

    shared.current_nframes.store(0, Ordering::SeqCst);
    0
}

impl ConnectionShared {
    fn latch_error(&self, mut message: String) {
        if message.is_empty() {
            message = GENERIC_ERROR.to_string();
        }
        {
            let mut latched = self.mutex.lock();
            // 旧消息在这里被丢弃
            latched.message = Some(message);
            self.error_flag.increment();
        }
        self.mutex.notify();
    }
}

impl Connection {
    /// 是否有被 latch 的 process callback 错误
    pub fn has_process_error(&self) -> bool {
        self.shared().error_flag.get() != 0
    }

    /// 最近一次 latch 的错误消息（不清除）
    pub fn process_error(&self) -> Option<String> {
        if !self.has_process_error() {
            return None;
        }
        self.shared().mutex.lock().message.clone()
    }

    /// 清除 sticky 标志并取走消息，之后 callback 恢复调用
    pub fn reset_process_error(&self) -> Option<String> {
        let shared = self.shared();
        let mut latched = shared.mutex.lock();
        let message = latched.message.take();
        let count = shared.error_flag.get();
        if count != 0 {
            // latch 持有同一把锁，这里不会和它交错
            shared.error_flag.compare_and_swap(count, 0);
            crate::verbose!(
                "cleared process error of client '{}' ({} latched)",
                shared.name,
                count
            );
        }
        message
    }
}
