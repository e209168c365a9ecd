//! 入口：持有音频引擎和脚本引擎，创建连接与环形缓冲区

use std::sync::Arc;

use crate::backend::{AudioBackend, ClientOptions};
use crate::client::Connection;
use crate::diag;
use crate::error::Result;
use crate::process::ScriptEngine;
use crate::ringbuf::RingBuffer;

/// 默认每周期 scratch 预留字节数
pub const DEFAULT_SCRATCH_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// 输出生命周期诊断信息
    pub verbose: bool,
    /// process callback 每周期可复用的 scratch 预留大小
    pub scratch_bytes: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            scratch_bytes: DEFAULT_SCRATCH_BYTES,
        }
    }
}

pub struct Host {
    backend: Arc<dyn AudioBackend>,
    scripts: Arc<dyn ScriptEngine>,
    config: HostConfig,
}

impl Host {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        scripts: Arc<dyn ScriptEngine>,
        config: HostConfig,
    ) -> Self {
        diag::set_verbose(config.verbose);
        Self {
            backend,
            scripts,
            config,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// 打开连接，返回 master
    pub fn client_open(&self, name: &str, options: &ClientOptions) -> Result<Connection> {
        Connection::open(
            self.backend.as_ref(),
            Arc::clone(&self.scripts),
            name,
            options,
            self.config.scratch_bytes,
        )
    }

    /// 创建环形缓冲区；`size` 必须 > 0
    pub fn ringbuffer(&self, size: i64, pinned: bool) -> Result<RingBuffer> {
        RingBuffer::new(size, pinned)
    }

    pub fn set_verbose(&mut self, on: bool) {
        self.config.verbose = on;
        diag::set_verbose(on);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{OfflineBackend, OfflineConfig};
    use crate::error::Error;
    use crate::process::{Arg, LoadOptions, ProcessContext, Routines};
    use std::time::{Duration, Instant};

    /// 端到端：control 侧创建 ring buffer 和 port，process 侧每周期
    /// 写入一帧（tag = 周期序号，payload = 输入峰值），control 侧读出
    #[test]
    fn test_meter_roundtrip_through_ring_buffer() {
        let backend = OfflineBackend::new(OfflineConfig {
            buffer_size: 64,
            test_tone_hz: Some(750.0),
            ..OfflineConfig::default()
        });
        let mut routines = Routines::new();
        routines.register("meter", |ctx: &mut ProcessContext| {
            let client = ctx.take_connection(1)?;
            let input = ctx.take_port(2)?;
            let rb = ctx.take_ring_buffer(3)?;
            let mut cycle = 0i32;
            client.set_process_callback(ctx, move |scope| {
                cycle += 1;
                let peak = input
                    .with_buffer(scope, |b| b.iter().fold(0.0f32, |m, s| m.max(s.abs())))
                    .unwrap_or(0.0);
                let payload = scope.scratch();
                payload.extend_from_slice(&peak.to_le_bytes());
                // 满了就丢
                let _ = rb.write(cycle, payload);
                Ok(())
            })?;
            Ok(())
        });

        let host = Host::new(
            Arc::new(backend.clone()),
            Arc::new(routines),
            HostConfig::default(),
        );
        let client = host.client_open("meter", &ClientOptions::default()).unwrap();
        let input = client.input_audio_port("in", Default::default()).unwrap();
        let rb = host.ringbuffer(4096, true).unwrap();
        client
            .process_load(
                "meter",
                LoadOptions::default(),
                &[Arg::from(&client), Arg::from(&input), Arg::from(&rb)],
            )
            .unwrap();
        client.activate().unwrap();

        let mut driver = backend.spawn_driver().unwrap();
        let mut frames = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while frames.len() < 10 && Instant::now() < deadline {
            match rb.read() {
                Some(frame) => frames.push(frame),
                None => std::thread::sleep(Duration::from_millis(1)),
            }
        }
        driver.stop();

        assert_eq!(frames.len(), 10);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.tag, i as i32 + 1);
            let peak = f32::from_le_bytes([
                frame.payload[0],
                frame.payload[1],
                frame.payload[2],
                frame.payload[3],
            ]);
            assert!(peak > 0.3 && peak <= 0.5, "peak {}", peak);
        }
        assert!(!client.has_process_error());

        client.close().unwrap();
        assert_eq!(rb.ref_count(), 1);
    }

    #[test]
    fn test_quiet_host_turns_verbose_off() {
        let loud = Host::new(
            Arc::new(OfflineBackend::new(OfflineConfig::default())),
            Arc::new(Routines::new()),
            HostConfig {
                verbose: true,
                ..HostConfig::default()
            },
        );
        assert!(loud.config().verbose);

        let quiet = Host::new(
            Arc::new(OfflineBackend::new(OfflineConfig::default())),
            Arc::new(Routines::new()),
            HostConfig::default(),
        );
        assert!(!quiet.config().verbose);
        assert!(!diag::is_verbose());
    }

    #[test]
    fn test_ringbuffer_size_checked() {
        let host = Host::new(
            Arc::new(OfflineBackend::new(OfflineConfig::default())),
            Arc::new(Routines::new()),
            HostConfig::default(),
        );
        assert!(matches!(host.ringbuffer(0, false), Err(Error::Argument { .. })));
        assert_eq!(host.ringbuffer(100, false).unwrap().capacity(), 128);
        assert_eq!(host.config().scratch_bytes, DEFAULT_SCRATCH_BYTES);
    }
}
