//! duojack
//!
//! 实时音频 client 宿主：control context 打开连接、注册 port、创建环形缓冲区，
//! 并在隔离的 process context 中加载每个音频周期执行一次的 routine。
//!
//! - `shared`: 原子引用计数句柄，两个 context 通过它共享 native 资源
//! - `process`: process context、一次性跨 context 值转移、实时回调桥
//! - `ringbuf`: SPSC 无锁消息帧环形缓冲区（稳态下两个 context 之间唯一的通道）
//! - `sync`: 递归锁、条件锁、原子计数器
//! - `backend`: native 音频引擎接口及离线实现

pub mod diag;

pub mod backend;
pub mod client;
pub mod error;
pub mod host;
pub mod port;
pub mod process;
pub mod ringbuf;
pub mod shared;
pub mod sync;

pub use backend::{ClientOptions, OfflineBackend, OfflineConfig, PortFlags, PortType, Status};
pub use client::Connection;
pub use error::{Error, Result};
pub use host::{Host, HostConfig};
pub use port::{Port, PortOptions};
pub use process::{Arg, LoadOptions, ProcessContext, ProcessScope, Routines, Value};
pub use ringbuf::{Frame, NoSpace, RingBuffer};
