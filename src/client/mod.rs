//! 连接（client）
//!
//! `Host::client_open` 返回 master 连接，它独占 native client 的生命周期：
//! 关闭顺序为 deactivate → 销毁 process context → native close → 释放共享结构。
//! process context 中的连接是非 master 视图，只能注册 callback，不能关闭或加载。
//!
//! 同一个连接的所有视图共享 `ConnectionShared`，其中：
//! - native client 槽位只在 control 侧使用，有自己的锁，实时线程不碰
//! - 条件锁保护 latch 的错误消息，`sleep` 在它上面等待
//! - process context 以裸指针持有，空指针表示尚未加载

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{AudioBackend, ClientOptions, NativeClient, Status};
use crate::diag::error_print;
use crate::error::{Error, Result};
use crate::process::{ProcessContext, ScriptEngine};
use crate::shared::Shared;
use crate::sync::{AtomicCounter, CondMutex, WaitResult};

/// latch 的 process callback 错误
#[derive(Debug, Default)]
pub(crate) struct LatchedError {
    pub(crate) message: Option<String>,
}

/// 连接的共享部分
pub struct ConnectionShared {
    pub(crate) name: String,
    native: Mutex<Option<Arc<dyn NativeClient>>>,
    pub(crate) mutex: CondMutex<LatchedError>,
    pub(crate) error_flag: AtomicCounter,
    pub(crate) process_context: AtomicPtr<ProcessContext>,
    pub(crate) callback_registered: AtomicBool,
    // 串行化 process_load
    pub(crate) load_lock: Mutex<()>,
    // 只在回调执行期间非 0
    pub(crate) current_nframes: AtomicU32,
    activated: AtomicBool,
    pub(crate) scripts: Arc<dyn ScriptEngine>,
    pub(crate) scratch_bytes: usize,
    buffer_size: u32,
    sample_rate: u32,
    is_realtime: bool,
}

impl Drop for ConnectionShared {
    fn drop(&mut self) {
        let ctx = self.process_context.swap(std::ptr::null_mut(), Ordering::SeqCst);
        if !ctx.is_null() {
            drop(unsafe { Box::from_raw(ctx) });
        }
        crate::verbose!("released client '{}'", self.name);
    }
}

/// 连接本地句柄
pub struct Connection {
    shared: Shared<ConnectionShared>,
    is_master: bool,
    in_process_context: bool,
}

impl Connection {
    pub(crate) fn open(
        backend: &dyn AudioBackend,
        scripts: Arc<dyn ScriptEngine>,
        name: &str,
        options: &ClientOptions,
        scratch_bytes: usize,
    ) -> Result<Self> {
        let (native, status) = backend
            .open_client(name, options)
            .map_err(Error::ClientOpen)?;

        let actual = native.name();
        if status.contains(Status::NAME_NOT_UNIQUE) {
            crate::verbose!("client name '{}' not unique, opened as '{}'", name, actual);
        }
        if status.contains(Status::SERVER_STARTED) {
            crate::verbose!("server started");
        }

        let shared = ConnectionShared {
            name: actual,
            buffer_size: native.buffer_size(),
            sample_rate: native.sample_rate(),
            is_realtime: native.is_realtime(),
            native: Mutex::new(Some(native)),
            mutex: CondMutex::new(LatchedError::default()),
            error_flag: AtomicCounter::new(0),
            process_context: AtomicPtr::new(std::ptr::null_mut()),
            callback_registered: AtomicBool::new(false),
            load_lock: Mutex::new(()),
            current_nframes: AtomicU32::new(0),
            activated: AtomicBool::new(false),
            scripts,
            scratch_bytes,
        };
        crate::verbose!("created client '{}'", shared.name);

        Ok(Self {
            shared: Shared::create(shared),
            is_master: true,
            in_process_context: false,
        })
    }

    /// 为 process context 生成非 master 视图（引用计数 +1）
    pub(crate) fn process_view(&self) -> Self {
        Self {
            shared: self.shared.retain(),
            is_master: false,
            in_process_context: true,
        }
    }

    #[inline]
    pub(crate) fn shared(&self) -> &Shared<ConnectionShared> {
        &self.shared
    }

    /// native client；连接关闭后返回错误
    pub(crate) fn native(&self) -> Result<Arc<dyn NativeClient>> {
        self.shared
            .native
            .lock()
            .clone()
            .ok_or(Error::Lifecycle("client is closed"))
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_master(&self) -> bool {
        self.is_master
    }

    pub fn in_process_context(&self) -> bool {
        self.in_process_context
    }

    pub fn is_closed(&self) -> bool {
        self.shared.native.lock().is_none()
    }

    pub fn ref_count(&self) -> i32 {
        self.shared.ref_count()
    }

    pub fn is_realtime(&self) -> bool {
        self.shared.is_realtime
    }

    pub fn buffer_size(&self) -> u32 {
        self.shared.buffer_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    /// 当前周期帧数
    ///
    /// 只对 process context 视图有意义；control 侧句柄总是 0，
    /// 即使实时线程此刻正在执行 callback。
    pub fn current_nframes(&self) -> u32 {
        if !self.in_process_context {
            return 0;
        }
        self.shared.current_nframes.load(Ordering::SeqCst)
    }

    pub fn has_process_context(&self) -> bool {
        !self.shared.process_context.load(Ordering::SeqCst).is_null()
    }

    pub fn callback_registered(&self) -> bool {
        self.shared.callback_registered.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.shared.activated.load(Ordering::SeqCst)
    }

    pub fn activate(&self) -> Result<()> {
        self.native()?
            .activate()
            .map_err(|_| Error::Backend("cannot activate client".to_string()))?;
        self.shared.activated.store(true, Ordering::SeqCst);
        crate::verbose!("activated client '{}'", self.name());
        Ok(())
    }

    pub fn deactivate(&self) -> Result<()> {
        self.native()?
            .deactivate()
            .map_err(|_| Error::Backend("cannot deactivate client".to_string()))?;
        self.shared.activated.store(false, Ordering::SeqCst);
        crate::verbose!("deactivated client '{}'", self.name());
        Ok(())
    }

    /// 在连接的条件锁上等待，直到超时或被 process callback 的错误 latch 唤醒
    ///
    /// `seconds <= 0` 时立即返回。只能在 master 上调用。
    pub fn sleep(&self, seconds: f64) -> Result<WaitResult> {
        if !self.is_master {
            return Err(Error::Lifecycle(
                "method can only be called on master client object",
            ));
        }
        let millis = (seconds * 1000.0) as i64;
        let mut guard = self.shared.mutex.lock();
        Ok(guard.wait_millis(millis))
    }

    /// 关闭连接（只能在 master 上调用，可重复调用）
    pub fn close(&self) -> Result<()> {
        if !self.is_master {
            return Err(Error::Lifecycle("can only close master client object"));
        }
        self.teardown();
        Ok(())
    }

    fn teardown(&self) {
        let native = match self.shared.native.lock().take() {
            Some(native) => native,
            None => return,
        };
        let shared = &self.shared;

        let mut stopped = true;
        if shared.activated.swap(false, Ordering::SeqCst) {
            match native.deactivate() {
                Ok(()) => crate::verbose!("deactivated client '{}'", shared.name),
                Err(e) => {
                    error_print(&format!("cannot deactivate client '{}': {}", shared.name, e));
                    stopped = false;
                }
            }
        }
        if !stopped {
            // 引擎可能仍在调用回调：先关闭 native，再销毁 context
            native.close();
        }

        shared.callback_registered.store(false, Ordering::SeqCst);
        let ctx = shared.process_context.swap(std::ptr::null_mut(), Ordering::SeqCst);
        if !ctx.is_null() {
            drop(unsafe { Box::from_raw(ctx) });
        }

        if stopped {
            native.close();
        }
        crate::verbose!("closed client '{}'", shared.name);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.is_master {
            self.teardown();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.shared.name)
            .field("ptr", &self.shared.as_ptr())
            .field("is_master", &self.is_master)
            .field("in_process_context", &self.in_process_context)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{OfflineBackend, OfflineConfig};
    use crate::host::{Host, HostConfig};
    use crate::process::{Arg, LoadOptions, Routines};
    use std::sync::atomic::AtomicUsize;

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup() -> (Host, OfflineBackend, Arc<AtomicUsize>) {
        let backend = OfflineBackend::new(OfflineConfig::default());
        let dropped = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&dropped);
        let mut routines = Routines::new();
        routines.register("hold", move |ctx: &mut ProcessContext| {
            let client = ctx.take_connection(1)?;
            let tracked = Tracked(Arc::clone(&counter));
            client.set_process_callback(ctx, move |_scope| {
                let _keep = &tracked;
                Ok(())
            })?;
            Ok(())
        });
        routines.register("try_close", |ctx: &mut ProcessContext| {
            let client = ctx.take_connection(1)?;
            assert!(!client.is_master());
            anyhow::ensure!(client.close().is_err(), "process view closed the client");
            Ok(())
        });
        let host = Host::new(
            Arc::new(backend.clone()),
            Arc::new(routines),
            HostConfig::default(),
        );
        (host, backend, dropped)
    }

    #[test]
    fn test_open_failure_reports_status() {
        let (host, _backend, _) = setup();
        let _a = host.client_open("dup", &ClientOptions::default()).unwrap();
        let options = ClientOptions {
            use_exact_name: true,
            ..ClientOptions::default()
        };
        let err = host.client_open("dup", &options).unwrap_err();
        assert_eq!(err.to_string(), "cannot create client (failure|name_not_unique)");
    }

    #[test]
    fn test_close_tears_down_context_and_native() {
        let (host, backend, dropped) = setup();
        let client = host.client_open("closer", &ClientOptions::default()).unwrap();
        client
            .process_load("hold", LoadOptions::default(), &[Arg::from(&client)])
            .unwrap();
        client.activate().unwrap();
        assert_eq!(backend.run_cycle(64), 1);

        client.close().unwrap();
        assert!(client.is_closed());
        assert!(!client.has_process_context());
        assert!(!client.is_active());
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert!(backend.client_names().is_empty());
        assert_eq!(backend.run_cycle(64), 0);

        // 重复关闭无副作用；关闭后的操作报错
        client.close().unwrap();
        assert!(client.activate().is_err());
    }

    #[test]
    fn test_drop_master_closes() {
        let (host, backend, dropped) = setup();
        {
            let client = host.client_open("scoped", &ClientOptions::default()).unwrap();
            client
                .process_load("hold", LoadOptions::default(), &[Arg::from(&client)])
                .unwrap();
        }
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert!(backend.client_names().is_empty());
    }

    #[test]
    fn test_process_view_cannot_close() {
        let (host, _backend, _) = setup();
        let client = host.client_open("viewer", &ClientOptions::default()).unwrap();
        client
            .process_load("try_close", LoadOptions::default(), &[Arg::from(&client)])
            .unwrap();
        assert!(!client.is_closed());
    }

    #[test]
    fn test_sleep_times_out() {
        let (host, _backend, _) = setup();
        let client = host.client_open("sleepy", &ClientOptions::default()).unwrap();
        assert_eq!(client.sleep(0.01).unwrap(), WaitResult::TimedOut);
        assert_eq!(client.sleep(-1.0).unwrap(), WaitResult::TimedOut);
    }

    #[test]
    fn test_queries() {
        let (host, _backend, _) = setup();
        let client = host.client_open("q", &ClientOptions::default()).unwrap();
        assert_eq!(client.name(), "q");
        assert_eq!(client.buffer_size(), 256);
        assert_eq!(client.sample_rate(), 48000);
        assert!(!client.is_realtime());
        assert_eq!(client.current_nframes(), 0);
        assert!(client.is_master());
        assert_eq!(client.ref_count(), 1);
    }
}
