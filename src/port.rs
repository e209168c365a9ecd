//! Port
//!
//! port 的共享结构持有所属连接共享结构的一个引用；
//! 最后一个 port 句柄释放时，连接的引用计数随之 -1。

use std::fmt;
use std::sync::Arc;

use crate::backend::{NativePort, PortFlags, PortType};
use crate::client::{Connection, ConnectionShared};
use crate::error::{Error, Result};
use crate::process::ProcessScope;
use crate::shared::Shared;

/// port 注册选项
#[derive(Debug, Clone, Copy, Default)]
pub struct PortOptions {
    pub is_physical: bool,
    pub can_monitor: bool,
    pub is_terminal: bool,
}

impl PortOptions {
    fn flags(self) -> PortFlags {
        let mut flags = PortFlags::empty();
        if self.is_physical {
            flags |= PortFlags::IS_PHYSICAL;
        }
        if self.can_monitor {
            flags |= PortFlags::CAN_MONITOR;
        }
        if self.is_terminal {
            flags |= PortFlags::IS_TERMINAL;
        }
        flags
    }
}

pub struct PortShared {
    native: Arc<dyn NativePort>,
    connection: Shared<ConnectionShared>,
}

impl Drop for PortShared {
    fn drop(&mut self) {
        crate::verbose!("releasing port '{}'", self.native.name());
    }
}

/// port 本地句柄
pub struct Port {
    shared: Shared<PortShared>,
    in_process_context: bool,
}

impl Connection {
    /// 注册 port，名字为 `client:short_name`
    pub fn register_port(
        &self,
        short_name: &str,
        port_type: PortType,
        direction: PortFlags,
        options: PortOptions,
    ) -> Result<Port> {
        let native = self
            .native()?
            .register_port(short_name, port_type, direction | options.flags())
            .ok_or(Error::PortRegister)?;
        crate::verbose!("registered port '{}'", native.name());

        Ok(Port {
            shared: Shared::create(PortShared {
                native,
                connection: self.shared().retain(),
            }),
            in_process_context: false,
        })
    }

    pub fn input_audio_port(&self, short_name: &str, options: PortOptions) -> Result<Port> {
        self.register_port(short_name, PortType::Audio, PortFlags::IS_INPUT, options)
    }

    pub fn output_audio_port(&self, short_name: &str, options: PortOptions) -> Result<Port> {
        self.register_port(short_name, PortType::Audio, PortFlags::IS_OUTPUT, options)
    }

    pub fn input_midi_port(&self, short_name: &str, options: PortOptions) -> Result<Port> {
        self.register_port(short_name, PortType::Midi, PortFlags::IS_INPUT, options)
    }

    pub fn output_midi_port(&self, short_name: &str, options: PortOptions) -> Result<Port> {
        self.register_port(short_name, PortType::Midi, PortFlags::IS_OUTPUT, options)
    }
}

impl Port {
    pub(crate) fn process_view(&self) -> Self {
        Self {
            shared: self.shared.retain(),
            in_process_context: true,
        }
    }

    pub(crate) fn belongs_to_shared(&self, connection: &Shared<ConnectionShared>) -> bool {
        Shared::ptr_eq(&self.shared.connection, connection)
    }

    pub fn belongs_to(&self, connection: &Connection) -> bool {
        self.belongs_to_shared(connection.shared())
    }

    /// 全名 `client:port`
    pub fn name(&self) -> String {
        self.shared.native.name()
    }

    pub fn short_name(&self) -> String {
        let name = self.name();
        match name.split_once(':') {
            Some((_, short)) => short.to_string(),
            None => name,
        }
    }

    pub fn client_name(&self) -> &str {
        &self.shared.connection.name
    }

    pub fn port_type(&self) -> PortType {
        self.shared.native.port_type()
    }

    pub fn flags(&self) -> PortFlags {
        self.shared.native.flags()
    }

    pub fn is_input(&self) -> bool {
        self.flags().contains(PortFlags::IS_INPUT)
    }

    pub fn is_output(&self) -> bool {
        self.flags().contains(PortFlags::IS_OUTPUT)
    }

    pub fn in_process_context(&self) -> bool {
        self.in_process_context
    }

    pub fn ref_count(&self) -> i32 {
        self.shared.ref_count()
    }

    /// 本周期的 native 缓冲区
    ///
    /// 只有所属连接的 process context 视图、在该连接的 callback 中才能拿到；
    /// midi port 没有 audio 缓冲区。
    fn period_buffer(&self, scope: &ProcessScope<'_>) -> Option<(*mut f32, usize)> {
        let nframes = scope.nframes();
        if !self.in_process_context
            || nframes == 0
            || self.shared.connection.as_ptr() as usize != scope.owner()
            || self.port_type() != PortType::Audio
        {
            return None;
        }
        Some((self.shared.native.buffer(nframes), nframes as usize))
    }

    /// 访问当前周期的 audio 缓冲区
    ///
    /// 需要 callback 的 `scope`，借用期间不能再取得其他缓冲区：
    ///
    /// ```compile_fail
    /// # fn nested(port: &duojack::Port, scope: &mut duojack::ProcessScope<'_>) {
    /// port.with_buffer(scope, |a| port.with_buffer(scope, |b| a.len() + b.len()));
    /// # }
    /// ```
    ///
    /// 不是所属连接的 process 视图（或 midi port）时返回 None。
    pub fn with_buffer<R>(
        &self,
        scope: &mut ProcessScope<'_>,
        f: impl FnOnce(&mut [f32]) -> R,
    ) -> Option<R> {
        let (ptr, len) = self.period_buffer(scope)?;
        // scope 被可变借用，同一周期内不会有第二个切片
        let buffer = unsafe { std::slice::from_raw_parts_mut(ptr, len) };
        Some(f(buffer))
    }

    /// 当前周期的缓冲区清零
    pub fn clear(&self, scope: &mut ProcessScope<'_>) {
        self.with_buffer(scope, |buffer| buffer.fill(0.0));
    }

    /// 从 `source` 复制当前周期的 sample
    ///
    /// `nframes` 为 None 时复制整个周期；超出范围的值被截断到 [0, 周期帧数]。
    pub fn copy_from(&self, scope: &mut ProcessScope<'_>, source: &Port, nframes: Option<i64>) {
        let (dst, current) = match self.period_buffer(scope) {
            Some(buffer) => buffer,
            None => return,
        };
        let (src, _) = match source.period_buffer(scope) {
            Some(buffer) => buffer,
            None => return,
        };
        let count = nframes.map_or(current, |n| n.clamp(0, current as i64) as usize);
        // 同一个 port 时两段重叠
        unsafe { std::ptr::copy(src, dst, count) };
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("name", &self.name())
            .field("ptr", &self.shared.as_ptr())
            .field("in_process_context", &self.in_process_context)
            .finish()
    }
}
