//! Process context
//!
//! 每个连接至多一个 process context，在第一次 `process_load` 时创建，
//! 直到 master 连接关闭时销毁。它与 control context 隔离：
//! 里面只有跨 context 转移过来的值，以及加载时注册的 process callback。
//!
//! 加载流程（全部在 control 线程上）：
//! 1. 转移参数（slot 0 为调用位置 `file:line`，slot 1.. 为参数）
//! 2. 编译 chunk
//! 3. 执行 chunk 的 top-level body 一次（在这里注册 callback）
//! 4. 以指针 CAS 安装到连接上，此后实时线程才能看到它
//!
//! 任何一步失败，部分构建的 context 整体丢弃（已 retain 的句柄随之释放）。

pub mod bridge;
pub mod script;
pub mod transfer;

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe, Location};
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use crate::client::Connection;
use crate::error::{Error, Result};
use crate::port::Port;
use crate::ringbuf::RingBuffer;
use crate::sync::compare_and_swap_ptr;

pub use bridge::process_bridge;
pub use script::{Chunk, Routine, Routines, ScriptEngine, ScriptSource};
pub use transfer::Arg;

/// process callback：每个周期在实时线程上调用一次
pub type ProcessCallback = Box<dyn FnMut(&mut ProcessScope<'_>) -> anyhow::Result<()> + Send>;

/// 加载选项
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// source 是文件路径而不是 chunk 文本
    pub as_file: bool,
}

/// process context 中的值
#[derive(Debug)]
pub enum Value {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
    Connection(Connection),
    Port(Port),
    RingBuffer(RingBuffer),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Connection(_) => "client",
            Value::Port(_) => "port",
            Value::RingBuffer(_) => "ringbuffer",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }
}

/// 传给 process callback 的周期信息
///
/// 只在 callback 执行期间存在；port 的缓冲区访问需要它的 `&mut` 借用，
/// 因此同一时刻至多一个缓冲区切片存活，且只能在实时线程上拿到。
pub struct ProcessScope<'a> {
    owner: usize,
    nframes: u32,
    scratch: &'a mut Vec<u8>,
}

impl ProcessScope<'_> {
    /// 本周期帧数
    #[inline]
    pub fn nframes(&self) -> u32 {
        self.nframes
    }

    #[inline]
    pub(crate) fn owner(&self) -> usize {
        self.owner
    }

    /// 每周期复用的字节缓冲区（周期结束时清空）
    ///
    /// 容量不超过创建时预留的大小时，使用它不会分配。
    #[inline]
    pub fn scratch(&mut self) -> &mut Vec<u8> {
        self.scratch
    }
}

/// 隔离的 process context
pub struct ProcessContext {
    // 所属连接共享结构的地址，只用于比较
    owner: usize,
    slots: Vec<Value>,
    callback: Option<ProcessCallback>,
    scratch: Vec<u8>,
    scratch_bytes: usize,
    scratch_grown: bool,
}

impl ProcessContext {
    fn new(owner: usize, slots: Vec<Value>, scratch_bytes: usize) -> Result<Self> {
        let mut scratch = Vec::new();
        scratch
            .try_reserve_exact(scratch_bytes)
            .map_err(|_| Error::Allocation)?;
        Ok(Self {
            owner,
            slots,
            callback: None,
            scratch,
            scratch_bytes,
            scratch_grown: false,
        })
    }

    #[inline]
    pub(crate) fn owner(&self) -> usize {
        self.owner
    }

    /// 调用位置（`file:line`）
    pub fn label(&self) -> &str {
        match self.slots.first() {
            Some(Value::String(label)) => label,
            _ => "",
        }
    }

    /// 参数个数（不含 slot 0）
    pub fn arg_count(&self) -> usize {
        self.slots.len().saturating_sub(1)
    }

    /// 第 `position` 个参数（从 1 开始；0 为调用位置）
    pub fn arg(&self, position: usize) -> Option<&Value> {
        self.slots.get(position)
    }

    /// 取走第 `position` 个参数，原位置留下 `Nil`
    pub fn take_arg(&mut self, position: usize) -> Value {
        match self.slots.get_mut(position) {
            Some(slot) => std::mem::replace(slot, Value::Nil),
            None => Value::Nil,
        }
    }

    fn expected(&self, position: usize, expected: &str) -> Error {
        let got = self.arg(position).map(Value::type_name).unwrap_or("no value");
        Error::argument(position, format!("{} expected, got {}", expected, got))
    }

    pub fn take_connection(&mut self, position: usize) -> Result<Connection> {
        match self.take_arg(position) {
            Value::Connection(connection) => Ok(connection),
            other => Err(self.put_back(position, other, "client")),
        }
    }

    pub fn take_port(&mut self, position: usize) -> Result<Port> {
        match self.take_arg(position) {
            Value::Port(port) => Ok(port),
            other => Err(self.put_back(position, other, "port")),
        }
    }

    pub fn take_ring_buffer(&mut self, position: usize) -> Result<RingBuffer> {
        match self.take_arg(position) {
            Value::RingBuffer(ring_buffer) => Ok(ring_buffer),
            other => Err(self.put_back(position, other, "ringbuffer")),
        }
    }

    // 类型不符时把值放回原位
    fn put_back(&mut self, position: usize, value: Value, expected: &str) -> Error {
        if let Some(slot) = self.slots.get_mut(position) {
            *slot = value;
        }
        self.expected(position, expected)
    }

    pub fn integer(&self, position: usize) -> Result<i64> {
        match self.arg(position) {
            Some(Value::Integer(i)) => Ok(*i),
            Some(Value::Number(n)) if n.fract() == 0.0 => Ok(*n as i64),
            _ => Err(self.expected(position, "integer")),
        }
    }

    pub fn number(&self, position: usize) -> Result<f64> {
        match self.arg(position) {
            Some(Value::Number(n)) => Ok(*n),
            Some(Value::Integer(i)) => Ok(*i as f64),
            _ => Err(self.expected(position, "number")),
        }
    }

    pub fn string(&self, position: usize) -> Result<&str> {
        match self.arg(position) {
            Some(Value::String(s)) => Ok(s),
            _ => Err(self.expected(position, "string")),
        }
    }

    pub fn boolean(&self, position: usize) -> Result<bool> {
        match self.arg(position) {
            Some(Value::Boolean(b)) => Ok(*b),
            _ => Err(self.expected(position, "boolean")),
        }
    }

    /// 可选参数：缺失或 `Nil` 时为 None
    pub fn optional(&self, position: usize) -> Option<&Value> {
        self.arg(position).filter(|v| !v.is_nil())
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// 返回被替换掉的旧 callback
    fn replace_callback(&mut self, callback: ProcessCallback) -> Option<ProcessCallback> {
        self.callback.replace(callback)
    }

    /// 实时线程上调用
    #[inline]
    pub(crate) fn run_callback(&mut self, nframes: u32) -> anyhow::Result<()> {
        let Self {
            owner,
            callback,
            scratch,
            ..
        } = self;
        match callback {
            Some(callback) => {
                let mut scope = ProcessScope {
                    owner: *owner,
                    nframes,
                    scratch,
                };
                callback(&mut scope)
            }
            None => Ok(()),
        }
    }

    /// 周期结束：清空 scratch
    ///
    /// 不在实时线程上释放内存；callback 撑大的容量保留到 context 销毁。
    #[inline]
    pub(crate) fn end_cycle(&mut self) {
        self.scratch.clear();
        if !self.scratch_grown && self.scratch.capacity() > self.scratch_bytes {
            self.scratch_grown = true;
            log::warn!(
                "process scratch grew past {} bytes to {}",
                self.scratch_bytes,
                self.scratch.capacity()
            );
        }
    }
}

impl Drop for ProcessContext {
    fn drop(&mut self) {
        crate::verbose!("closing process context '{}'", self.label());
    }
}

/// 从 panic payload 中提取消息
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> Option<String> {
    if let Some(s) = payload.downcast_ref::<&str>() {
        Some((*s).to_string())
    } else {
        payload.downcast_ref::<String>().cloned()
    }
}

impl Connection {
    /// 加载 process chunk 并在新的 process context 中执行一次
    ///
    /// 只能在 master 连接上调用，且每个连接只能成功一次。
    /// 调用位置（`file:line`）放在 slot 0。
    #[track_caller]
    pub fn process_load(&self, source: &str, options: LoadOptions, args: &[Arg<'_>]) -> Result<()> {
        let caller = Location::caller();
        let label = format!("{}:{}", caller.file(), caller.line());
        self.load_process_context(label, source, options, args)
    }

    fn load_process_context(
        &self,
        label: String,
        source: &str,
        options: LoadOptions,
        args: &[Arg<'_>],
    ) -> Result<()> {
        if !self.is_master() {
            return Err(Error::Lifecycle(
                "method can only be called on master client object",
            ));
        }
        let shared = self.shared();
        // 持有到安装或丢弃 context 为止，失败路径可以安全地清除 callback_registered
        let _loading = shared
            .load_lock
            .try_lock()
            .ok_or(Error::Lifecycle("process chunk load in progress"))?;
        if !shared.process_context.load(Ordering::SeqCst).is_null() {
            return Err(Error::Lifecycle("process chunk already loaded"));
        }

        let source = if options.as_file {
            ScriptSource::File(PathBuf::from(source))
        } else {
            ScriptSource::Chunk(source.to_string())
        };
        let slots = transfer::transfer(shared, label, args)?;
        let mut ctx = Box::new(ProcessContext::new(
            shared.as_ptr() as usize,
            slots,
            shared.scratch_bytes,
        )?);
        let chunk = shared.scripts.compile(&source)?;

        // top-level body 仍在 control 线程上执行
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| chunk.execute(&mut ctx)));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(payload) => Some(
                panic_message(payload.as_ref())
                    .unwrap_or_else(|| "cannot execute chunk".to_string()),
            ),
        };
        if let Some(message) = failure {
            shared.callback_registered.store(false, Ordering::SeqCst);
            return Err(Error::Script(message));
        }

        let raw = Box::into_raw(ctx);
        if !compare_and_swap_ptr(&shared.process_context, std::ptr::null_mut(), raw) {
            drop(unsafe { Box::from_raw(raw) });
            return Err(Error::Lifecycle("process chunk already loaded"));
        }
        crate::verbose!("loaded process chunk for client '{}'", shared.name);
        Ok(())
    }

    /// 注册 process callback（替换之前的）
    ///
    /// 只能在 process context 视图上、以它所属的 context 调用，
    /// 也就是在 chunk 的 top-level body 中。
    pub fn set_process_callback<F>(&self, ctx: &mut ProcessContext, callback: F) -> Result<()>
    where
        F: FnMut(&mut ProcessScope<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        if !self.in_process_context() {
            return Err(Error::Lifecycle(
                "method can only be called from process context",
            ));
        }
        let shared = self.shared();
        if ctx.owner() != shared.as_ptr() as usize {
            return Err(Error::Lifecycle(
                "process context belongs to another client",
            ));
        }

        let native = self.native()?;
        native.set_process_callback(process_bridge, shared.as_ptr() as *mut c_void)?;

        // 旧 callback 在这里被丢弃
        drop(ctx.replace_callback(Box::new(callback)));
        shared.callback_registered.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{OfflineBackend, OfflineConfig};
    use crate::host::{Host, HostConfig};
    use std::sync::Arc;

    fn host_with(routines: Routines) -> (Host, OfflineBackend) {
        let backend = OfflineBackend::new(OfflineConfig {
            buffer_size: 64,
            ..OfflineConfig::default()
        });
        let host = Host::new(
            Arc::new(backend.clone()),
            Arc::new(routines),
            HostConfig::default(),
        );
        (host, backend)
    }

    #[test]
    fn test_primitive_args_arrive_unchanged() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut routines = Routines::new();
        routines.register("capture", move |ctx: &mut ProcessContext| {
            let mut out = sink.lock();
            out.push(format!("{}", ctx.arg_count()));
            out.push(format!("{}", ctx.integer(1)?));
            out.push(format!("{}", ctx.number(2)?));
            out.push(ctx.string(3)?.to_string());
            out.push(format!("{}", ctx.boolean(4)?));
            out.push(ctx.arg(5).map(Value::type_name).unwrap_or("?").to_string());
            out.push(ctx.label().to_string());
            Ok(())
        });
        let (host, _backend) = host_with(routines);
        let client = host.client_open("prims", &Default::default()).unwrap();

        client
            .process_load(
                "capture",
                LoadOptions::default(),
                &[
                    Arg::from(42i64),
                    Arg::from(3.5f64),
                    Arg::from("abc"),
                    Arg::from(true),
                    Arg::Nil,
                ],
            )
            .unwrap();

        let seen = seen.lock();
        assert_eq!(&seen[..6], &["5", "42", "3.5", "abc", "true", "nil"]);
        assert!(seen[6].contains("mod.rs:"), "label was {}", seen[6]);
    }

    #[test]
    fn test_second_load_fails() {
        let mut routines = Routines::new();
        routines.register("noop", |_ctx: &mut ProcessContext| Ok(()));
        let (host, _backend) = host_with(routines);
        let client = host.client_open("twice", &Default::default()).unwrap();

        client.process_load("noop", LoadOptions::default(), &[]).unwrap();
        let err = client
            .process_load("noop", LoadOptions::default(), &[])
            .unwrap_err();
        assert_eq!(err.to_string(), "process chunk already loaded");
    }

    #[test]
    fn test_load_on_process_view_fails() {
        let view_result = Arc::new(parking_lot::Mutex::new(None));
        let out = Arc::clone(&view_result);
        let mut routines = Routines::new();
        routines.register("nested", move |ctx: &mut ProcessContext| {
            let client = ctx.take_connection(1)?;
            let err = client
                .process_load("nested", LoadOptions::default(), &[])
                .unwrap_err();
            *out.lock() = Some(err.to_string());
            Ok(())
        });
        let (host, _backend) = host_with(routines);
        let client = host.client_open("views", &Default::default()).unwrap();
        client
            .process_load("nested", LoadOptions::default(), &[Arg::from(&client)])
            .unwrap();
        assert_eq!(
            view_result.lock().as_deref(),
            Some("method can only be called on master client object")
        );
    }

    #[test]
    fn test_failed_body_discards_context() {
        let mut routines = Routines::new();
        routines.register("boom", |_ctx: &mut ProcessContext| {
            anyhow::bail!("body failed")
        });
        routines.register("panics", |_ctx: &mut ProcessContext| panic!("body panicked"));
        routines.register("noop", |_ctx: &mut ProcessContext| Ok(()));
        let (host, _backend) = host_with(routines);
        let client = host.client_open("discard", &Default::default()).unwrap();
        let rb = host.ringbuffer(64, false).unwrap();

        let err = client
            .process_load("boom", LoadOptions::default(), &[Arg::from(&rb)])
            .unwrap_err();
        assert_eq!(err.to_string(), "body failed");
        // 已转移的句柄随 context 一起释放
        assert_eq!(rb.ref_count(), 1);

        let err = client
            .process_load("panics", LoadOptions::default(), &[])
            .unwrap_err();
        assert_eq!(err.to_string(), "body panicked");

        // 失败后可以重新加载
        client.process_load("noop", LoadOptions::default(), &[]).unwrap();
    }

    #[test]
    fn test_load_during_load_is_rejected() {
        let master: Arc<parking_lot::Mutex<Option<Arc<Connection>>>> = Arc::default();
        let nested = Arc::new(parking_lot::Mutex::new(None));
        let (m, out) = (Arc::clone(&master), Arc::clone(&nested));
        let mut routines = Routines::new();
        routines.register("outer", move |ctx: &mut ProcessContext| {
            let client = ctx.take_connection(1)?;
            client.set_process_callback(ctx, |_scope| Ok(()))?;
            if let Some(master) = m.lock().take() {
                let err = master
                    .process_load("inner", LoadOptions::default(), &[])
                    .unwrap_err();
                *out.lock() = Some(err.to_string());
            }
            Ok(())
        });
        routines.register("inner", |_ctx: &mut ProcessContext| {
            anyhow::bail!("inner body must not run")
        });
        let (host, _backend) = host_with(routines);
        let client = Arc::new(host.client_open("serial", &Default::default()).unwrap());
        *master.lock() = Some(Arc::clone(&client));

        client
            .process_load("outer", LoadOptions::default(), &[Arg::from(&*client)])
            .unwrap();
        assert_eq!(
            nested.lock().as_deref(),
            Some("process chunk load in progress")
        );
        // 被拒绝的加载没有清掉已注册的 callback
        assert!(client.callback_registered());
        assert!(client.has_process_context());
    }

    #[test]
    fn test_callback_only_from_own_process_view() {
        let outcome = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let out = Arc::clone(&outcome);
        let mut routines = Routines::new();
        routines.register("register", move |ctx: &mut ProcessContext| {
            let client = ctx.take_connection(1)?;
            client.set_process_callback(ctx, |_scope| Ok(()))?;
            // 替换
            client.set_process_callback(ctx, |_scope| Ok(()))?;
            out.lock().push(ctx.has_callback());
            Ok(())
        });
        let (host, _backend) = host_with(routines);
        let client = host.client_open("owner", &Default::default()).unwrap();

        client
            .process_load("register", LoadOptions::default(), &[Arg::from(&client)])
            .unwrap();
        assert_eq!(*outcome.lock(), vec![true]);
        assert!(client.callback_registered());
    }

    #[test]
    fn test_end_cycle_keeps_grown_capacity() {
        let mut ctx = ProcessContext::new(0, vec![Value::String("x:1".into())], 16).unwrap();
        ctx.scratch.extend_from_slice(&[7u8; 100]);
        let capacity = ctx.scratch.capacity();
        let ptr = ctx.scratch.as_ptr();

        ctx.end_cycle();
        assert!(ctx.scratch.is_empty());
        assert_eq!(ctx.scratch.capacity(), capacity);
        assert!(ctx.scratch_grown);

        // 下一周期复用同一块内存
        ctx.scratch.extend_from_slice(&[1u8; 100]);
        assert_eq!(ctx.scratch.as_ptr(), ptr);
        ctx.end_cycle();
        assert!(ctx.optional(1).is_none());
        assert_eq!(ctx.label(), "x:1");
    }

    #[test]
    fn test_take_wrong_type_keeps_value() {
        let outcome = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let out = Arc::clone(&outcome);
        let mut routines = Routines::new();
        routines.register("types", move |ctx: &mut ProcessContext| {
            let err = ctx.take_port(1).unwrap_err();
            out.lock().push(err.to_string());
            out.lock().push(ctx.arg(1).map(Value::type_name).unwrap_or("?").to_string());
            let err = ctx.string(7).unwrap_err();
            out.lock().push(err.to_string());
            Ok(())
        });
        let (host, _backend) = host_with(routines);
        let client = host.client_open("types", &Default::default()).unwrap();
        let rb = host.ringbuffer(16, false).unwrap();
        client
            .process_load("types", LoadOptions::default(), &[Arg::from(&rb)])
            .unwrap();

        let outcome = outcome.lock();
        assert_eq!(outcome[0], "bad argument #1 (port expected, got ringbuffer)");
        assert_eq!(outcome[1], "ringbuffer");
        assert_eq!(outcome[2], "bad argument #7 (string expected, got no value)");
    }
}
