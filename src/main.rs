//! Roger Render - 渲染核心演示程序
//!
//! 用 symphonia 解码文件，通过虚拟设备驱动渲染器：
//! - 暂停状态下预缓冲，缓冲区填满后开始播放
//! - 解码线程按图时钟提前 `buffer_ms` 送样本
//! - Ctrl+C 触发 flush 并停止

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use roger_renderer::audio::timing::frames_to_time;
use roger_renderer::audio::{DspFormat, RefTime, VirtualDeviceConfig, ONE_MILLISECOND, ONE_SECOND};
use roger_renderer::decode::AudioDecoder;
use roger_renderer::renderer::{
    AudioRenderer, PresentationClock, RenderState, RendererConfig, RendererSettings, SlavedClock,
    VirtualDeviceManager,
};

/// Roger Render - audio render core demo
#[derive(Parser)]
#[command(name = "roger-render")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render an audio file through a virtual device
    Play {
        /// Audio file to play
        file: PathBuf,

        /// Exclusive mode (device keeps the integer input format)
        #[arg(long)]
        exclusive: bool,

        /// Feed the device from a dedicated realtime thread
        #[arg(long)]
        realtime: bool,

        /// Device buffer size in milliseconds
        #[arg(short, long, default_value = "200")]
        buffer_ms: u32,

        /// Linear volume in [0, 1]
        #[arg(long, default_value = "1.0")]
        volume: f32,

        /// Start position in seconds
        #[arg(long)]
        start: Option<f64>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// List the internal sample formats
    Formats,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let verbose = matches!(cli.command, Commands::Play { verbose: true, .. });
    let filter = if verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match cli.command {
        Commands::Formats => {
            show_formats();
            Ok(())
        }
        Commands::Play {
            file,
            exclusive,
            realtime,
            buffer_ms,
            volume,
            start,
            ..
        } => play(
            &file,
            &PlayOptions {
                exclusive,
                realtime,
                buffer_ms,
                volume,
                start,
            },
        ),
    }
}

fn show_formats() {
    println!("=== Sample Formats ===\n");
    for format in DspFormat::ALL {
        let kind = if format.is_float() { "float" } else { "integer" };
        println!(
            "  {:<8} {} bytes  {:>2} bits  {}",
            format.name(),
            format.sample_size(),
            format.bits(),
            kind
        );
    }
}

struct PlayOptions {
    exclusive: bool,
    realtime: bool,
    buffer_ms: u32,
    volume: f32,
    start: Option<f64>,
}

fn play(file: &PathBuf, options: &PlayOptions) -> anyhow::Result<()> {
    let mut decoder = AudioDecoder::open(file).with_context(|| format!("Opening {}", file.display()))?;
    if let Some(start) = options.start {
        decoder.seek(start)?;
    }

    let info = decoder.info().clone();
    let format = decoder.format();
    println!("Roger Render - Loading: {}", file.display());
    println!(
        "  {} / {} | {} Hz | {} ch | {}",
        info.format,
        info.codec,
        info.sample_rate,
        info.channels,
        info.bit_depth
            .map(|b| format!("{}-bit", b))
            .unwrap_or_else(|| "unknown depth".to_string())
    );

    let settings = Arc::new(RendererSettings::new());
    settings.set_output_device(None, options.exclusive, options.buffer_ms);
    settings.set_volume(options.volume);

    let manager = VirtualDeviceManager::new(VirtualDeviceConfig {
        realtime: options.realtime,
        ..VirtualDeviceConfig::default()
    });
    let monitor = manager.monitor();

    let clock = Arc::new(SlavedClock::new());
    let renderer = Arc::new(AudioRenderer::new(
        settings,
        clock.clone(),
        Box::new(manager),
        RendererConfig::default(),
    ));

    if !renderer.check_format(&format) {
        bail!("Unsupported input format {:?}", format.tag);
    }
    renderer.set_format(format);
    renderer.new_segment(1.0);

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        let renderer = renderer.clone();
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
            renderer.begin_flush();
        })?;
    }

    // 流时间 0 对应的图时间，播放开始前为 i64::MIN
    let start_time = Arc::new(AtomicI64::new(i64::MIN));
    let lead = options.buffer_ms as RefTime * ONE_MILLISECOND;
    // 分段时间从 seek 位置算起
    let stream_offset = frames_to_time(decoder.position_frames(), info.sample_rate);
    let eof = Arc::new(AtomicBool::new(false));

    renderer.pause();

    let feeder = {
        let renderer = renderer.clone();
        let clock = clock.clone();
        let running = running.clone();
        let start_time = start_time.clone();
        let eof = eof.clone();
        thread::Builder::new()
            .name("decode".to_string())
            .spawn(move || -> anyhow::Result<bool> {
                while let Some(mut sample) = decoder.next_sample()? {
                    sample.start = sample.start.map(|t| t - stream_offset);

                    if !wait_for_lead(&*clock, &start_time, sample.start.unwrap_or(0), lead, &running) {
                        return Ok(false);
                    }
                    if !renderer.enqueue(&sample) {
                        return Ok(false);
                    }
                }
                eof.store(true, Ordering::SeqCst);
                Ok(renderer.finish(true))
            })?
    };

    // 预缓冲：缓冲区填满（或数据已送完）后开始播放
    print!("Buffering...");
    io::stdout().flush()?;
    let buffer_filled = renderer.buffer_filled();
    while running.load(Ordering::SeqCst)
        && !eof.load(Ordering::SeqCst)
        && !feeder.is_finished()
        && !buffer_filled.wait(Duration::from_millis(50))
    {}

    if running.load(Ordering::SeqCst) {
        let now = clock.graph_time();
        start_time.store(now, Ordering::SeqCst);
        renderer.play(now);
        println!("\rPlaying. Press Ctrl+C to stop.");
    }

    let total_secs = info.duration_secs.unwrap_or(0.0);
    while !feeder.is_finished() {
        let elapsed = match start_time.load(Ordering::SeqCst) {
            i64::MIN => 0,
            start => (clock.graph_time() - start).max(0),
        };
        let position = elapsed as f64 / ONE_SECOND as f64 + options.start.unwrap_or(0.0);
        let underruns = monitor.current().map(|c| c.underrun_frames()).unwrap_or(0);
        print!(
            "\r  {:02}:{:05.2} / {:02}:{:05.2}  |  Underrun frames: {}  ",
            (position / 60.0) as u32,
            position % 60.0,
            (total_secs / 60.0) as u32,
            total_secs % 60.0,
            underruns
        );
        io::stdout().flush()?;
        thread::sleep(Duration::from_millis(100));
    }
    println!();

    let completed = match feeder.join() {
        Ok(result) => result?,
        Err(_) => bail!("Decode thread panicked"),
    };
    if !completed {
        println!("Playback interrupted.");
    }

    if let Some(device) = renderer.device_info() {
        println!(
            "\nDevice: {} | {} | {}{}",
            device.friendly_name,
            device
                .dsp_format
                .map(|f| f.name())
                .unwrap_or("bitstream"),
            if device.exclusive { "exclusive" } else { "shared" },
            if device.realtime { " | realtime feed" } else { "" }
        );
        let processors = renderer.active_processors();
        if !processors.is_empty() {
            println!("Processors: {}", processors.join(", "));
        }
        println!("{}", device.stats);
    }

    if renderer.state() != RenderState::Stopped {
        renderer.stop();
    }
    Ok(())
}

/// 按图时钟限制提前量：样本开始时间最多领先当前播放位置 `lead`
///
/// 暂停预缓冲期间不限制。被中断返回 false。
fn wait_for_lead(
    clock: &dyn PresentationClock,
    start_time: &AtomicI64,
    sample_start: RefTime,
    lead: RefTime,
    running: &AtomicBool,
) -> bool {
    loop {
        if !running.load(Ordering::SeqCst) {
            return false;
        }

        let start = start_time.load(Ordering::SeqCst);
        if start == i64::MIN {
            return true;
        }

        let ahead = start + sample_start - clock.graph_time();
        if ahead <= lead {
            return true;
        }
        thread::sleep(Duration::from_millis(((ahead - lead) / ONE_MILLISECOND).clamp(1, 20) as u64));
    }
}
