//! Native 音频引擎接口
//!
//! JACK 风格：client 打开时返回 status 位，port 属于 client，
//! 引擎在自己的实时线程上每个周期调用一次注册的 C 回调。

pub mod offline;

use std::ffi::c_void;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::os::raw::c_int;
use std::sync::Arc;

use crate::error::Result;

pub use offline::{DriverHandle, OfflineBackend, OfflineConfig};

/// 引擎每个周期调用的回调（C ABI）
pub type ProcessCallbackFn = extern "C" fn(nframes: u32, arg: *mut c_void) -> c_int;

/// client 打开状态位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Status(u32);

impl Status {
    pub const FAILURE: Status = Status(0x01);
    pub const INVALID_OPTION: Status = Status(0x02);
    pub const NAME_NOT_UNIQUE: Status = Status(0x04);
    pub const SERVER_STARTED: Status = Status(0x08);
    pub const SERVER_FAILED: Status = Status(0x10);
    pub const SERVER_ERROR: Status = Status(0x20);
    pub const NO_SUCH_CLIENT: Status = Status(0x40);
    pub const LOAD_FAILURE: Status = Status(0x80);
    pub const INIT_FAILURE: Status = Status(0x100);
    pub const SHM_FAILURE: Status = Status(0x200);
    pub const VERSION_ERROR: Status = Status(0x400);
    pub const BACKEND_ERROR: Status = Status(0x800);
    pub const CLIENT_ZOMBIE: Status = Status(0x1000);

    const NAMES: [(Status, &'static str); 13] = [
        (Status::FAILURE, "failure"),
        (Status::INVALID_OPTION, "invalid_option"),
        (Status::NAME_NOT_UNIQUE, "name_not_unique"),
        (Status::SERVER_STARTED, "server_started"),
        (Status::SERVER_FAILED, "server_failed"),
        (Status::SERVER_ERROR, "server_error"),
        (Status::NO_SUCH_CLIENT, "no_such_client"),
        (Status::LOAD_FAILURE, "load_failure"),
        (Status::INIT_FAILURE, "init_failure"),
        (Status::SHM_FAILURE, "shm_failure"),
        (Status::VERSION_ERROR, "version_error"),
        (Status::BACKEND_ERROR, "backend_error"),
        (Status::CLIENT_ZOMBIE, "client_zombie"),
    ];

    pub const fn empty() -> Self {
        Status(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Status(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Status) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Status {
    type Output = Status;

    fn bitor(self, rhs: Status) -> Status {
        Status(self.0 | rhs.0)
    }
}

impl BitOrAssign for Status {
    fn bitor_assign(&mut self, rhs: Status) {
        self.0 |= rhs.0;
    }
}

/// 以 `|` 连接各个状态名，空状态为 `no_error`
impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "no_error");
        }
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// client 打开选项
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// 名字冲突时失败，而不是自动改名
    pub use_exact_name: bool,
    /// 服务不存在时不自动启动
    pub no_start_server: bool,
    pub server_name: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortType {
    Audio,
    Midi,
}

impl PortType {
    pub fn type_name(self) -> &'static str {
        match self {
            PortType::Audio => "32 bit float mono audio",
            PortType::Midi => "8 bit raw midi",
        }
    }
}

/// port 标志位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortFlags(u32);

impl PortFlags {
    pub const IS_INPUT: PortFlags = PortFlags(0x01);
    pub const IS_OUTPUT: PortFlags = PortFlags(0x02);
    pub const IS_PHYSICAL: PortFlags = PortFlags(0x04);
    pub const CAN_MONITOR: PortFlags = PortFlags(0x08);
    pub const IS_TERMINAL: PortFlags = PortFlags(0x10);

    pub const fn empty() -> Self {
        PortFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: PortFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PortFlags {
    type Output = PortFlags;

    fn bitor(self, rhs: PortFlags) -> PortFlags {
        PortFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for PortFlags {
    fn bitor_assign(&mut self, rhs: PortFlags) {
        self.0 |= rhs.0;
    }
}

/// 音频引擎（服务端）
pub trait AudioBackend: Send + Sync {
    /// 打开 client；失败时返回的 status 含 `FAILURE`
    ///
    /// 成功时的 status 可能带有提示位（例如 `NAME_NOT_UNIQUE` 表示已改名）。
    fn open_client(
        &self,
        name: &str,
        options: &ClientOptions,
    ) -> std::result::Result<(Arc<dyn NativeClient>, Status), Status>;
}

/// 引擎侧的 client
///
/// 只在 control context 调用；实时线程只经过回调进入。
pub trait NativeClient: Send + Sync {
    /// 实际名字（可能已被引擎改名）
    fn name(&self) -> String;
    fn is_realtime(&self) -> bool;
    fn buffer_size(&self) -> u32;
    fn sample_rate(&self) -> u32;
    fn activate(&self) -> Result<()>;
    /// 返回后引擎不再调用本 client 的回调
    fn deactivate(&self) -> Result<()>;
    fn register_port(
        &self,
        short_name: &str,
        port_type: PortType,
        flags: PortFlags,
    ) -> Option<Arc<dyn NativePort>>;
    fn set_process_callback(&self, callback: ProcessCallbackFn, arg: *mut c_void) -> Result<()>;
    fn close(&self);
}

/// 引擎侧的 port
pub trait NativePort: Send + Sync {
    /// 全名 `client:port`
    fn name(&self) -> String;
    fn port_type(&self) -> PortType;
    fn flags(&self) -> PortFlags;
    /// 当前周期的 sample 缓冲区，至少 `nframes` 个 f32
    ///
    /// 只在该 port 所属 client 的回调内有效。
    fn buffer(&self, nframes: u32) -> *mut f32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(Status::empty().to_string(), "no_error");
        assert_eq!(
            (Status::FAILURE | Status::NAME_NOT_UNIQUE).to_string(),
            "failure|name_not_unique"
        );
        assert_eq!(Status::from_bits(0x1001).to_string(), "failure|client_zombie");
        assert_eq!(Status::SERVER_STARTED.to_string(), "server_started");
    }

    #[test]
    fn test_status_contains() {
        let s = Status::FAILURE | Status::SERVER_FAILED;
        assert!(s.contains(Status::FAILURE));
        assert!(!s.contains(Status::INVALID_OPTION));
        assert_eq!(s.bits(), 0x11);
    }

    #[test]
    fn test_port_flags() {
        let mut f = PortFlags::IS_INPUT;
        f |= PortFlags::IS_TERMINAL;
        assert!(f.contains(PortFlags::IS_INPUT | PortFlags::IS_TERMINAL));
        assert!(!f.contains(PortFlags::IS_OUTPUT));
    }

    #[test]
    fn test_port_type_names() {
        assert_eq!(PortType::Audio.type_name(), "32 bit float mono audio");
        assert_eq!(PortType::Midi.type_name(), "8 bit raw midi");
    }
}
