//! duojack - 离线引擎上的演示宿主
//!
//! 打开一个连接，注册输入 / 输出 port，加载内置 routine，
//! 由离线引擎的 driver 线程按周期驱动；control 线程从环形缓冲区读出
//! process context 发来的消息帧并打印。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};

use duojack::backend::Status;
use duojack::diag::parse_on_off;
use duojack::{
    Arg, ClientOptions, Host, HostConfig, LoadOptions, OfflineBackend, OfflineConfig,
    PortOptions, ProcessContext, Routines,
};

/// 消息帧 tag
const TAG_PEAK: i32 = 1;
const TAG_FRAMES: i32 = 2;

#[derive(Parser)]
#[command(name = "duojack")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Lifecycle diagnostics (on|off)
    #[arg(long, global = true, default_value = "off", value_parser = parse_on_off, action = clap::ArgAction::Set)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a built-in routine on the offline engine
    Run {
        /// Routine loaded into the process context
        #[arg(short, long, value_enum, default_value_t = RoutineName::Meter)]
        routine: RoutineName,

        /// Seconds to run (until Ctrl+C if 0)
        #[arg(short, long, default_value = "3")]
        seconds: f64,

        /// Frames per period
        #[arg(short, long, default_value = "256")]
        buffer_size: u32,

        /// Sample rate in Hz
        #[arg(long, default_value = "48000")]
        sample_rate: u32,

        /// Ring buffer size in bytes
        #[arg(long, default_value = "8192")]
        rbuf_size: i64,

        /// Test tone fed to input ports (Hz)
        #[arg(long, default_value = "440")]
        tone: f32,

        /// Periods before the 'fail' routine errors out
        #[arg(long, default_value = "100")]
        fail_after: i64,
    },

    /// Render a client status word (e.g. 0x05)
    Status {
        bits: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RoutineName {
    /// Send the input peak of every period
    Meter,
    /// Copy input to output, report frame counts
    Passthrough,
    /// Fail after N periods
    Fail,
}

impl RoutineName {
    fn as_str(self) -> &'static str {
        match self {
            RoutineName::Meter => "meter",
            RoutineName::Passthrough => "passthrough",
            RoutineName::Fail => "fail",
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    match cli.command {
        Commands::Run {
            routine,
            seconds,
            buffer_size,
            sample_rate,
            rbuf_size,
            tone,
            fail_after,
        } => {
            let backend = OfflineBackend::new(OfflineConfig {
                buffer_size,
                sample_rate,
                test_tone_hz: Some(tone),
                ..OfflineConfig::default()
            });
            let config = HostConfig {
                verbose: cli.verbose,
                ..HostConfig::default()
            };
            run(backend, config, routine, seconds, rbuf_size, fail_after)?;
        }
        Commands::Status { bits } => {
            let bits = parse_bits(&bits)?;
            println!("{}", Status::from_bits(bits));
        }
    }

    Ok(())
}

fn parse_bits(s: &str) -> anyhow::Result<u32> {
    let bits = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16)?,
        None => s.parse()?,
    };
    Ok(bits)
}

/// 两次报告之间的峰值
#[derive(Debug, Default)]
struct PeakHold {
    peak: f32,
}

impl PeakHold {
    fn observe(&mut self, value: f32) {
        self.peak = self.peak.max(value);
    }

    /// 取出并清零
    fn take(&mut self) -> f32 {
        std::mem::take(&mut self.peak)
    }
}

/// 内置 routine
///
/// 参数约定：#1 client，#2 输入 port，#3 输出 port，#4 环形缓冲区，#5 失败周期数
fn builtin_routines() -> Routines {
    let mut routines = Routines::new();

    routines.register("meter", |ctx: &mut ProcessContext| {
        let client = ctx.take_connection(1)?;
        let input = ctx.take_port(2)?;
        let rb = ctx.take_ring_buffer(4)?;
        client.set_process_callback(ctx, move |scope| {
            let peak = input
                .with_buffer(scope, |b| b.iter().fold(0.0f32, |m, s| m.max(s.abs())))
                .unwrap_or(0.0);
            let payload = scope.scratch();
            payload.extend_from_slice(&peak.to_le_bytes());
            // 环满时丢弃本周期的测量
            let _ = rb.write(TAG_PEAK, payload);
            Ok(())
        })?;
        Ok(())
    });

    routines.register("passthrough", |ctx: &mut ProcessContext| {
        let client = ctx.take_connection(1)?;
        let input = ctx.take_port(2)?;
        let output = ctx.take_port(3)?;
        let rb = ctx.take_ring_buffer(4)?;
        client.set_process_callback(ctx, move |scope| {
            output.copy_from(scope, &input, None);
            let _ = rb.write(TAG_FRAMES, &scope.nframes().to_le_bytes());
            Ok(())
        })?;
        Ok(())
    });

    routines.register("fail", |ctx: &mut ProcessContext| {
        let client = ctx.take_connection(1)?;
        let limit = ctx.integer(5)?;
        anyhow::ensure!(limit > 0, "period count must be positive");
        let mut periods = 0i64;
        client.set_process_callback(ctx, move |_scope| {
            periods += 1;
            if periods >= limit {
                anyhow::bail!("deliberate failure after {} periods", periods);
            }
            Ok(())
        })?;
        Ok(())
    });

    routines
}

fn run(
    backend: OfflineBackend,
    config: HostConfig,
    routine: RoutineName,
    seconds: f64,
    rbuf_size: i64,
    fail_after: i64,
) -> anyhow::Result<()> {
    let host = Host::new(
        Arc::new(backend.clone()),
        Arc::new(builtin_routines()),
        config,
    );

    let client = host.client_open("duojack", &ClientOptions::default())?;
    let input = client.input_audio_port("in", PortOptions::default())?;
    let output = client.output_audio_port("out", PortOptions::default())?;
    let rb = host.ringbuffer(rbuf_size, true)?;

    client.process_load(
        routine.as_str(),
        LoadOptions::default(),
        &[
            Arg::from(&client),
            Arg::from(&input),
            Arg::from(&output),
            Arg::from(&rb),
            Arg::from(fail_after),
        ],
    )?;
    client.activate()?;

    println!(
        "Client '{}' running '{}' ({} frames @ {} Hz)",
        client.name(),
        routine.as_str(),
        client.buffer_size(),
        client.sample_rate()
    );
    println!("Press Ctrl+C to stop");

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let mut driver = backend.spawn_driver()?;
    let started = Instant::now();
    let limit = (seconds > 0.0).then(|| Duration::from_secs_f64(seconds));

    let mut payload = Vec::with_capacity(64);
    let mut frames_seen = 0u64;
    let mut peak = PeakHold::default();
    let mut last_report = Instant::now();

    while running.load(Ordering::SeqCst) {
        if let Some(limit) = limit {
            if started.elapsed() >= limit {
                break;
            }
        }

        // 被 latch 唤醒或超时
        client.sleep(0.05)?;
        if let Some(message) = client.reset_process_error() {
            eprintln!("Process error: {}", message);
            break;
        }

        while let Some(tag) = rb.read_into(&mut payload) {
            frames_seen += 1;
            match tag {
                TAG_PEAK if payload.len() == 4 => {
                    let value = f32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    peak.observe(value);
                }
                TAG_FRAMES => {}
                other => log::warn!("Unexpected frame tag {}", other),
            }
        }

        if last_report.elapsed() >= Duration::from_millis(500) {
            last_report = Instant::now();
            match routine {
                RoutineName::Meter => {
                    println!("peak {:>6.3}  ({} frames)", peak.take(), frames_seen)
                }
                _ => println!("{} frames, {} periods", frames_seen, backend.cycles()),
            }
        }
    }

    driver.stop();
    client.close()?;
    println!("Stopped after {} periods", backend.cycles());
    Ok(())
}
