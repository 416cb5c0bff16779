//! outflow - 实时音频输出管线
//!
//! 设计目标：
//! - 时序绝对稳定：信号量流控 + 实时回调内零分配零无界锁
//! - 传输命令无可闻毛刺：状态机应答式 pause/stop
//! - 设备变更在线重建：至多一个回调周期的静音

#![allow(dead_code, unused_mut)]

mod audio;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use crate::audio::device::open_platform_backend;
use crate::audio::{AudioOutput, DeviceBackend, OutputConfig};

/// Outflow - Real-time audio output pipeline
#[derive(Parser)]
#[command(name = "outflow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Ring buffer latency in milliseconds
    #[arg(short, long, default_value = "2000")]
    buffer_ms: u32,

    /// Select output device by ID (use 'info' command to inspect)
    #[arg(short, long)]
    device: Option<u32>,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show audio device information
    Info,

    /// Play a test tone through the output pipeline
    Play {
        /// Tone frequency in Hz
        #[arg(short, long, default_value = "440.0")]
        freq: f64,

        /// Playback duration in seconds
        #[arg(short, long, default_value = "5.0")]
        seconds: f64,

        /// Linear volume (0.0 - 1.0)
        #[arg(long, default_value = "0.5")]
        volume: f64,

        /// Enable the graphic equalizer
        #[arg(long)]
        eq: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let buffer_ms = cli.buffer_ms;
    let device = cli.device;

    match cli.command {
        Some(Commands::Play {
            freq,
            seconds,
            volume,
            eq,
        }) => play_tone(buffer_ms, device, freq, seconds, volume, eq),
        Some(Commands::Info) | None => show_device_info(device),
    }
}

fn show_device_info(device: Option<u32>) -> anyhow::Result<()> {
    let backend = open_platform_backend(device)?;
    let descriptor = backend.descriptor();
    let format = backend.native_format()?;

    println!("Output device");
    println!("=============");
    println!("Name:        {}", descriptor.name);
    println!("ID:          {}", descriptor.id);
    println!("Sample rate: {} Hz", format.sample_rate);
    println!("Channels:    {}", format.channels);
    println!("Period:      {} frames", backend.period_frames());

    Ok(())
}

fn play_tone(
    buffer_ms: u32,
    device: Option<u32>,
    freq: f64,
    seconds: f64,
    volume: f64,
    eq: bool,
) -> anyhow::Result<()> {
    let config = OutputConfig {
        latency_ms: buffer_ms,
        device_id: device,
        ..OutputConfig::default()
    };

    let mut output = AudioOutput::new(config);
    output.setup()?;
    output.set_volume(volume);
    output.set_equalizer_enabled(eq);

    let stop_flag = Arc::new(AtomicBool::new(false));
    {
        let stop_flag = Arc::clone(&stop_flag);
        ctrlc::set_handler(move || {
            stop_flag.store(true, Ordering::SeqCst);
        })?;
    }

    // 生产者线程：正弦测试音，阻塞写入即背压
    let mut producer = output.producer()?;
    let stream = producer.format();
    let producer_stop = Arc::clone(&stop_flag);
    let producer_thread = std::thread::Builder::new()
        .name("producer".to_string())
        .spawn(move || {
            let channels = stream.channels as usize;
            let step = std::f64::consts::TAU * freq / stream.sample_rate;
            let mut phase = 0.0f64;
            let mut block = vec![0.0f32; 1024 * channels];

            while !producer_stop.load(Ordering::SeqCst) {
                for frame in block.chunks_mut(channels) {
                    let sample = (phase.sin() * 0.8) as f32;
                    phase = (phase + step) % std::f64::consts::TAU;
                    for slot in frame.iter_mut() {
                        *slot = sample;
                    }
                }
                if producer.write_frames(&block) < block.len() {
                    // 管线已停止
                    break;
                }
            }
        })?;

    output.start()?;
    log::info!("Playing {:.0}Hz test tone for {:.1}s", freq, seconds);

    let deadline = Instant::now() + Duration::from_secs_f64(seconds);
    while Instant::now() < deadline && !stop_flag.load(Ordering::SeqCst) {
        // 设备事件在控制线程消化
        output.handle_device_events()?;
        std::thread::sleep(Duration::from_millis(100));
    }

    stop_flag.store(true, Ordering::SeqCst);
    output.stop();
    let _ = producer_thread.join();

    println!("{}", output.stats_report());
    Ok(())
}
