//! 诊断输出开关
//!
//! verbose 关闭时生命周期信息不输出；错误信息始终输出。

use std::sync::atomic::{AtomicBool, Ordering};

static VERBOSE: AtomicBool = AtomicBool::new(false);

pub fn set_verbose(on: bool) {
    VERBOSE.store(on, Ordering::Relaxed);
}

#[inline]
pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

/// 解析 "on" / "off"
pub fn parse_on_off(s: &str) -> Result<bool, String> {
    match s {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(format!("invalid option '{}' (expected 'on' or 'off')", other)),
    }
}

/// verbose 打开时以 info 级别输出
#[macro_export]
macro_rules! verbose {
    ($($arg:tt)*) => {
        if $crate::diag::is_verbose() {
            log::info!($($arg)*);
        }
    };
}

/// 错误输出，不受 verbose 影响
pub fn error_print(message: &str) {
    log::error!("{}", message);
}
