//! 错误类型
//!
//! 实时线程上的错误不走这里：process callback 的失败被 latch 在连接上，
//! 由 control context 通过 `Connection::process_error` 观察。

use crate::backend::Status;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 参数非法（配置错误）
    #[error("bad argument #{position} ({message})")]
    Argument { position: usize, message: String },

    #[error("cannot create client ({0})")]
    ClientOpen(Status),

    #[error("cannot register port")]
    PortRegister,

    /// 资源耗尽
    #[error("cannot create ringbuffer")]
    Allocation,

    /// 跨 context 转移时的归属检查失败
    #[error("{0}")]
    Ownership(String),

    #[error("invalid type '{type_name}' of argument #{position}")]
    InvalidType {
        type_name: &'static str,
        position: usize,
    },

    /// chunk 编译或 top-level 执行失败
    #[error("{0}")]
    Script(String),

    /// 生命周期误用（在错误的对象或 context 上调用）
    #[error("{0}")]
    Lifecycle(&'static str),

    #[error("{0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn argument(position: usize, message: impl Into<String>) -> Self {
        Self::Argument {
            position,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
