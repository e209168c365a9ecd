//! 进程内的离线音频引擎
//!
//! 行为上模拟一个 JACK 服务：
//! - client 名字唯一，冲突时改名（或按 `use_exact_name` 失败）
//! - port 名为 `client:port`，每个 port 持有一个周期长度的 sample 缓冲区
//! - 每个周期按注册顺序调用所有已激活 client 的回调
//!
//! 周期可以由调用方同步驱动（`run_cycle`），也可以由内部 driver 线程
//! 按 buffer_size / sample_rate 的节奏驱动（`spawn_driver`）。
//!
//! 整个周期在服务锁内执行；`deactivate` / `close` 拿到服务锁即表示
//! 没有正在执行的回调，之后也不会再被调用。

use std::cell::{RefCell, UnsafeCell};
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{
    AudioBackend, ClientOptions, NativeClient, NativePort, PortFlags, PortType,
    ProcessCallbackFn, Status,
};
use crate::error::{Error, Result};
use crate::sync::RecursiveMutex;

/// client 名字最大长度（含结尾 NUL）
pub const CLIENT_NAME_SIZE: usize = 64;
/// port 全名最大长度（含结尾 NUL）
pub const PORT_NAME_SIZE: usize = 256;

/// 离线引擎配置
#[derive(Debug, Clone)]
pub struct OfflineConfig {
    /// 每周期帧数
    pub buffer_size: u32,
    pub sample_rate: u32,
    pub server_name: String,
    /// 非 None 时，每周期向所有 audio 输入 port 写入该频率的正弦波
    pub test_tone_hz: Option<f32>,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            buffer_size: 256,
            sample_rate: 48000,
            server_name: "default".to_string(),
            test_tone_hz: None,
        }
    }
}

/// 已注册的回调
#[derive(Clone, Copy)]
struct RegisteredCallback {
    function: ProcessCallbackFn,
    arg: *mut c_void,
}

// arg 的线程安全由注册方保证
unsafe impl Send for RegisteredCallback {}

#[derive(Default)]
struct ServerState {
    clients: Vec<Arc<OfflineClient>>,
}

struct Server {
    config: OfflineConfig,
    // 可重入：回调内可以再次进入服务（例如查询 client 列表）
    state: RecursiveMutex<RefCell<ServerState>>,
    cycles: AtomicU64,
    frame_time: AtomicU64,
}

/// 离线引擎句柄（可 clone，共享同一个服务）
#[derive(Clone)]
pub struct OfflineBackend {
    server: Arc<Server>,
}

impl OfflineBackend {
    pub fn new(config: OfflineConfig) -> Self {
        Self {
            server: Arc::new(Server {
                config,
                state: RecursiveMutex::new(RefCell::new(ServerState::default())),
                cycles: AtomicU64::new(0),
                frame_time: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.server.config
    }

    /// 已执行的周期数
    pub fn cycles(&self) -> u64 {
        self.server.cycles.load(Ordering::Acquire)
    }

    /// 当前所有 client 的名字（按打开顺序）
    pub fn client_names(&self) -> Vec<String> {
        let guard = self.server.state.lock();
        let state = guard.borrow();
        state.clients.iter().map(|c| c.name.clone()).collect()
    }

    fn find_port(&self, full_name: &str) -> Option<Arc<OfflinePort>> {
        let guard = self.server.state.lock();
        let state = guard.borrow();
        state
            .clients
            .iter()
            .flat_map(|c| c.ports.lock().clone())
            .find(|p| p.name == full_name)
    }

    /// 周期之外写入某个 port 的缓冲区（例如准备输入数据）
    pub fn fill_port(&self, full_name: &str, samples: &[f32]) -> bool {
        let _cycle = self.server.state.lock();
        match self.find_port(full_name) {
            Some(port) => {
                let n = samples.len().min(port.samples.len());
                // 持有服务锁，周期不会并发执行
                unsafe {
                    std::ptr::copy_nonoverlapping(samples.as_ptr(), port.base(), n);
                }
                true
            }
            None => false,
        }
    }

    /// 周期之外读出某个 port 缓冲区的前 `nframes` 个 sample
    pub fn port_samples(&self, full_name: &str, nframes: u32) -> Option<Vec<f32>> {
        let _cycle = self.server.state.lock();
        let port = self.find_port(full_name)?;
        let n = (nframes as usize).min(port.samples.len());
        let mut out = vec![0.0f32; n];
        unsafe {
            std::ptr::copy_nonoverlapping(port.base(), out.as_mut_ptr(), n);
        }
        Some(out)
    }

    /// 执行一个周期，返回被调用的回调个数
    ///
    /// `nframes` 被限制在 buffer_size 以内。
    pub fn run_cycle(&self, nframes: u32) -> usize {
        let server = &self.server;
        let nframes = nframes.min(server.config.buffer_size);

        let guard = server.state.lock();
        let jobs: Vec<RegisteredCallback> = {
            let state = guard.borrow();
            let frame_time = server.frame_time.load(Ordering::Relaxed);
            let mut jobs = Vec::with_capacity(state.clients.len());
            for client in state.clients.iter() {
                if !client.active.load(Ordering::Acquire) {
                    continue;
                }
                if let Some(hz) = server.config.test_tone_hz {
                    client.write_test_tone(hz, server.config.sample_rate, frame_time, nframes);
                }
                if let Some(callback) = *client.callback.lock() {
                    jobs.push(callback);
                }
            }
            jobs
        };

        // RefCell 借用已释放，回调内可以重入服务
        for job in &jobs {
            (job.function)(nframes, job.arg);
        }

        server.frame_time.fetch_add(nframes as u64, Ordering::Relaxed);
        server.cycles.fetch_add(1, Ordering::Release);
        drop(guard);

        jobs.len()
    }

    /// 启动 driver 线程，按周期节奏调用 `run_cycle`
    pub fn spawn_driver(&self) -> Result<DriverHandle> {
        let running = Arc::new(AtomicBool::new(true));
        let backend = self.clone();
        let flag = Arc::clone(&running);

        let buffer_size = self.server.config.buffer_size;
        let sample_rate = self.server.config.sample_rate.max(1);
        let period = Duration::from_secs_f64(buffer_size as f64 / sample_rate as f64);

        let thread = thread::Builder::new()
            .name("offline-rt".to_string())
            .spawn(move || {
                log::debug!("Offline driver started, period {:?}", period);
                let mut next = Instant::now();
                while flag.load(Ordering::Acquire) {
                    backend.run_cycle(buffer_size);
                    next += period;
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else {
                        // 落后太多时不追赶
                        next = now;
                    }
                }
                log::debug!("Offline driver stopped");
            })?;

        Ok(DriverHandle {
            running,
            thread: Some(thread),
        })
    }

    fn unique_name(state: &ServerState, name: &str) -> Option<String> {
        let taken = |candidate: &str| state.clients.iter().any(|c| c.name == candidate);
        if !taken(name) {
            return Some(name.to_string());
        }
        (1..100)
            .map(|i| format!("{}-{:02}", name, i))
            .find(|candidate| candidate.len() < CLIENT_NAME_SIZE && !taken(candidate.as_str()))
    }
}

impl AudioBackend for OfflineBackend {
    fn open_client(
        &self,
        name: &str,
        options: &ClientOptions,
    ) -> std::result::Result<(Arc<dyn NativeClient>, Status), Status> {
        let server = &self.server;

        if name.is_empty() || name.len() >= CLIENT_NAME_SIZE {
            return Err(Status::FAILURE | Status::INVALID_OPTION);
        }
        if let Some(ref server_name) = options.server_name {
            if *server_name != server.config.server_name {
                // 离线模式下不能再启动另一个服务
                return Err(if options.no_start_server {
                    Status::FAILURE | Status::SERVER_FAILED
                } else {
                    Status::FAILURE | Status::SERVER_ERROR
                });
            }
        }
        if let Some(ref session_id) = options.session_id {
            log::debug!("Ignoring session id '{}' for client '{}'", session_id, name);
        }

        let guard = server.state.lock();
        let mut state = guard.borrow_mut();

        let mut status = Status::empty();
        let actual = match Self::unique_name(&state, name) {
            Some(actual) if actual == name => actual,
            Some(_) if options.use_exact_name => {
                return Err(Status::FAILURE | Status::NAME_NOT_UNIQUE)
            }
            Some(actual) => {
                status |= Status::NAME_NOT_UNIQUE;
                actual
            }
            None => return Err(Status::FAILURE | Status::NAME_NOT_UNIQUE),
        };

        let client = Arc::new(OfflineClient {
            name: actual,
            server: Arc::downgrade(server),
            buffer_size: server.config.buffer_size,
            sample_rate: server.config.sample_rate,
            active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            callback: Mutex::new(None),
            ports: Mutex::new(Vec::new()),
        });
        state.clients.push(Arc::clone(&client));

        Ok((client, status))
    }
}

/// driver 线程句柄；drop 时停止并 join
pub struct DriverHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DriverHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Offline driver thread panicked");
            }
        }
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct OfflineClient {
    name: String,
    server: Weak<Server>,
    buffer_size: u32,
    sample_rate: u32,
    active: AtomicBool,
    closed: AtomicBool,
    callback: Mutex<Option<RegisteredCallback>>,
    ports: Mutex<Vec<Arc<OfflinePort>>>,
}

impl OfflineClient {
    /// 在服务锁内执行（与周期互斥）
    fn with_server_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        match self.server.upgrade() {
            Some(server) => {
                let _cycle = server.state.lock();
                f()
            }
            None => f(),
        }
    }

    fn write_test_tone(&self, hz: f32, sample_rate: u32, frame_time: u64, nframes: u32) {
        let step = std::f64::consts::TAU * hz as f64 / sample_rate.max(1) as f64;
        for port in self.ports.lock().iter() {
            if port.port_type != PortType::Audio || !port.flags.contains(PortFlags::IS_INPUT) {
                continue;
            }
            let n = (nframes as usize).min(port.samples.len());
            let base = port.base();
            for i in 0..n {
                let phase = step * (frame_time + i as u64) as f64;
                // 周期内由服务独占
                unsafe { *base.add(i) = (phase.sin() * 0.5) as f32 };
            }
        }
    }
}

impl NativeClient for OfflineClient {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn is_realtime(&self) -> bool {
        false
    }

    fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn activate(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Backend("cannot activate client".to_string()));
        }
        self.with_server_lock(|| self.active.store(true, Ordering::Release));
        Ok(())
    }

    fn deactivate(&self) -> Result<()> {
        // 拿到服务锁即表示当前没有正在执行的周期
        self.with_server_lock(|| self.active.store(false, Ordering::Release));
        Ok(())
    }

    fn register_port(
        &self,
        short_name: &str,
        port_type: PortType,
        flags: PortFlags,
    ) -> Option<Arc<dyn NativePort>> {
        if self.closed.load(Ordering::Acquire) || short_name.is_empty() {
            return None;
        }
        let full_name = format!("{}:{}", self.name, short_name);
        if full_name.len() >= PORT_NAME_SIZE {
            return None;
        }

        let mut ports = self.ports.lock();
        if ports.iter().any(|p| p.name == full_name) {
            return None;
        }

        let mut samples = Vec::with_capacity(self.buffer_size as usize);
        samples.resize_with(self.buffer_size as usize, || UnsafeCell::new(0.0f32));
        let port = Arc::new(OfflinePort {
            name: full_name,
            port_type,
            flags,
            samples: samples.into_boxed_slice(),
        });
        ports.push(Arc::clone(&port));
        Some(port)
    }

    fn set_process_callback(&self, callback: ProcessCallbackFn, arg: *mut c_void) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Backend("client is closed".to_string()));
        }
        if self.active.load(Ordering::Acquire) {
            return Err(Error::Backend(
                "cannot set process callback on an active client".to_string(),
            ));
        }
        *self.callback.lock() = Some(RegisteredCallback {
            function: callback,
            arg,
        });
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(server) = self.server.upgrade() {
            let guard = server.state.lock();
            self.active.store(false, Ordering::Release);
            guard
                .borrow_mut()
                .clients
                .retain(|c| !std::ptr::eq(Arc::as_ptr(c), self));
        }
        self.callback.lock().take();
        self.ports.lock().clear();
    }
}

struct OfflinePort {
    name: String,
    port_type: PortType,
    flags: PortFlags,
    samples: Box<[UnsafeCell<f32>]>,
}

// 缓冲区只在周期内（服务锁下）被访问
unsafe impl Send for OfflinePort {}
unsafe impl Sync for OfflinePort {}

impl OfflinePort {
    #[inline]
    fn base(&self) -> *mut f32 {
        self.samples.as_ptr() as *mut f32
    }
}

impl NativePort for OfflinePort {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn port_type(&self) -> PortType {
        self.port_type
    }

    fn flags(&self) -> PortFlags {
        self.flags
    }

    fn buffer(&self, nframes: u32) -> *mut f32 {
        debug_assert!(nframes as usize <= self.samples.len());
        self.base()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::raw::c_int;
    use std::sync::atomic::AtomicU32;

    extern "C" fn count_frames(nframes: u32, arg: *mut c_void) -> c_int {
        let counter = unsafe { &*(arg as *const AtomicU32) };
        counter.fetch_add(nframes, Ordering::SeqCst);
        0
    }

    fn backend() -> OfflineBackend {
        OfflineBackend::new(OfflineConfig {
            buffer_size: 64,
            ..OfflineConfig::default()
        })
    }

    #[test]
    fn test_duplicate_name_is_renamed() {
        let backend = backend();
        let (a, status) = backend.open_client("synth", &ClientOptions::default()).unwrap();
        assert!(status.is_empty());
        let (b, status) = backend.open_client("synth", &ClientOptions::default()).unwrap();
        assert_eq!(status, Status::NAME_NOT_UNIQUE);
        assert_eq!(a.name(), "synth");
        assert_eq!(b.name(), "synth-01");
        assert_eq!(backend.client_names(), vec!["synth", "synth-01"]);
    }

    #[test]
    fn test_exact_name_conflict_fails() {
        let backend = backend();
        let _a = backend.open_client("synth", &ClientOptions::default()).unwrap();
        let options = ClientOptions {
            use_exact_name: true,
            ..ClientOptions::default()
        };
        let status = backend.open_client("synth", &options).err().unwrap();
        assert_eq!(status, Status::FAILURE | Status::NAME_NOT_UNIQUE);
    }

    #[test]
    fn test_invalid_names_and_server() {
        let backend = backend();
        assert_eq!(backend.config().server_name, "default");
        let long = "x".repeat(CLIENT_NAME_SIZE);
        let status = backend.open_client(&long, &ClientOptions::default()).err().unwrap();
        assert_eq!(status, Status::FAILURE | Status::INVALID_OPTION);

        let options = ClientOptions {
            no_start_server: true,
            server_name: Some("other".to_string()),
            ..ClientOptions::default()
        };
        let status = backend.open_client("a", &options).err().unwrap();
        assert_eq!(status, Status::FAILURE | Status::SERVER_FAILED);

        let options = ClientOptions {
            server_name: Some(backend.config().server_name.clone()),
            ..ClientOptions::default()
        };
        assert!(backend.open_client("a", &options).is_ok());
    }

    #[test]
    fn test_callbacks_run_only_when_active() {
        let backend = backend();
        let (client, _) = backend.open_client("c", &ClientOptions::default()).unwrap();
        let counter = AtomicU32::new(0);
        client
            .set_process_callback(count_frames, &counter as *const AtomicU32 as *mut c_void)
            .unwrap();

        assert_eq!(backend.run_cycle(32), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        client.activate().unwrap();
        assert_eq!(backend.run_cycle(32), 1);
        // 超过 buffer_size 的请求被截断
        assert_eq!(backend.run_cycle(1000), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 32 + 64);

        assert!(client
            .set_process_callback(count_frames, std::ptr::null_mut())
            .is_err());

        client.deactivate().unwrap();
        assert_eq!(backend.run_cycle(32), 0);
        assert_eq!(backend.cycles(), 4);
    }

    #[test]
    fn test_close_removes_client() {
        let backend = backend();
        let (client, _) = backend.open_client("gone", &ClientOptions::default()).unwrap();
        client.close();
        assert!(backend.client_names().is_empty());
        assert!(client.activate().is_err());
        assert!(client
            .register_port("in", PortType::Audio, PortFlags::IS_INPUT)
            .is_none());
    }

    #[test]
    fn test_port_names_and_buffers() {
        let backend = backend();
        let (client, _) = backend.open_client("fx", &ClientOptions::default()).unwrap();
        let port = client
            .register_port("in_1", PortType::Audio, PortFlags::IS_INPUT)
            .unwrap();
        assert_eq!(port.name(), "fx:in_1");
        assert!(client
            .register_port("in_1", PortType::Audio, PortFlags::IS_INPUT)
            .is_none());

        assert!(backend.fill_port("fx:in_1", &[0.25; 8]));
        assert_eq!(backend.port_samples("fx:in_1", 4), Some(vec![0.25; 4]));
        assert!(!backend.fill_port("fx:nope", &[0.0]));
    }

    #[test]
    fn test_test_tone_fills_inputs() {
        let backend = OfflineBackend::new(OfflineConfig {
            buffer_size: 64,
            test_tone_hz: Some(1000.0),
            ..OfflineConfig::default()
        });
        let (client, _) = backend.open_client("tone", &ClientOptions::default()).unwrap();
        client
            .register_port("in", PortType::Audio, PortFlags::IS_INPUT)
            .unwrap();
        client.activate().unwrap();
        backend.run_cycle(64);

        let samples = backend.port_samples("tone:in", 64).unwrap();
        assert_eq!(samples[0], 0.0);
        assert!(samples.iter().any(|s| *s > 0.4));
        assert!(samples.iter().all(|s| s.abs() <= 0.5));
    }

    #[test]
    fn test_driver_runs_cycles() {
        let backend = backend();
        let mut driver = backend.spawn_driver().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while backend.cycles() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        driver.stop();
        assert!(!driver.is_running());
        assert!(backend.cycles() >= 3);
    }
}
