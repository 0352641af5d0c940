//! 渲染器
//!
//! 整合样本校正、DSP 链、时钟校正和设备生命周期。
//!
//! 线程模型：
//! - 宿主的数据线程调用 enqueue/finish
//! - 控制线程调用 play/pause/stop/flush
//! - 实时设备另有一个投喂线程（由 DeviceFeeder 持有）
//!
//! 所有状态由一把锁保护；任何可能阻塞的等待（设备缓冲区满、等待播完）
//! 都在锁外进行，并可被 flush 事件打断。
//!
//! 调用顺序约定（先 set_format 再 enqueue，Stopped 状态下不送数据，
//! Running 时不 end_flush）在所有构建中都会检查，违反即 panic。

pub mod clock;
pub mod correction;
pub mod manager;
pub mod settings;

pub use clock::{PresentationClock, SlavedClock};
pub use correction::{BasicSampleCorrection, MediaSample, SampleCorrection};
pub use manager::{DeviceManager, DeviceMonitor, VirtualDeviceManager};
pub use settings::{DeviceSettings, RendererSettings, Settings};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::audio::timing::to_duration;
use crate::audio::{
    ChunkError, DeviceFeeder, DspFormat, FeederConfig, ManualResetEvent, RefTime, SampleChunk,
    StatsReport, WaveFormat,
};
use crate::dsp::{DspChain, StreamParams};

/// 渲染器配置
#[derive(Clone, Debug)]
pub struct RendererConfig {
    /// 时钟校正死区：偏差不超过该值时不调整
    pub clock_dead_band: RefTime,
    pub feeder: FeederConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            // 100µs
            clock_dead_band: 1000,
            feeder: FeederConfig::default(),
        }
    }
}

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    Stopped,
    Paused,
    Running,
}

/// 当前设备的快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub friendly_name: String,
    pub wave_format: WaveFormat,
    pub dsp_format: Option<DspFormat>,
    pub exclusive: bool,
    pub realtime: bool,
    pub bitstream: bool,
    pub default_device: bool,
    pub buffer_duration_ms: u32,
    pub stats: StatsReport,
}

struct RendererState {
    state: RenderState,
    device: Option<DeviceFeeder>,
    device_manager: Box<dyn DeviceManager>,
    input_format: Option<WaveFormat>,
    rate: f64,
    external_clock: bool,
    start_time: RefTime,
    start_clock_offset: RefTime,
    device_settings_serial: u32,
    sample_correction: Box<dyn SampleCorrection>,
    dsp: DspChain,
}

/// 音频渲染器
pub struct AudioRenderer {
    state: Mutex<RendererState>,
    flush: ManualResetEvent,
    buffer_filled: Arc<ManualResetEvent>,
    settings: Arc<dyn Settings>,
    clock: Arc<dyn PresentationClock>,
    config: RendererConfig,
}

impl AudioRenderer {
    pub fn new(
        settings: Arc<dyn Settings>,
        clock: Arc<dyn PresentationClock>,
        device_manager: Box<dyn DeviceManager>,
        config: RendererConfig,
    ) -> Self {
        Self {
            state: Mutex::new(RendererState {
                state: RenderState::Stopped,
                device: None,
                device_manager,
                input_format: None,
                rate: 1.0,
                external_clock: false,
                start_time: 0,
                start_clock_offset: 0,
                device_settings_serial: 0,
                sample_correction: Box::new(BasicSampleCorrection::new()),
                dsp: DspChain::default(),
            }),
            flush: ManualResetEvent::new(),
            buffer_filled: Arc::new(ManualResetEvent::new()),
            settings,
            clock,
            config,
        }
    }

    /// 替换 DSP 链
    pub fn with_dsp_chain(mut self, dsp: DspChain) -> Self {
        self.state.get_mut().dsp = dsp;
        self
    }

    /// 替换样本校正阶段
    pub fn with_sample_correction(mut self, correction: Box<dyn SampleCorrection>) -> Self {
        self.state.get_mut().sample_correction = correction;
        self
    }

    // ---- 数据路径 ----

    /// 送入一个样本
    ///
    /// 返回 false 表示等待被 flush 打断；设备失败不算失败，
    /// 渲染器会退回 null 设备模式继续按时钟消耗数据。
    pub fn enqueue(&self, sample: &MediaSample) -> bool {
        let mut chunk = {
            let mut st = self.state.lock();
            assert!(st.input_format.is_some(), "enqueue before set_format");
            assert_ne!(st.state, RenderState::Stopped, "enqueue while stopped");

            self.check_device_settings(&mut st);

            if st.device.is_none() {
                self.create_device(&mut st);
            }

            match self.prepare_chunk(&mut st, sample) {
                Ok(chunk) => chunk,
                Err(e) => {
                    log::warn!("Dropping audio device: {}", e);
                    self.clear_device(&mut st);
                    SampleChunk::default()
                }
            }
        };

        self.push(&mut chunk)
    }

    fn prepare_chunk(&self, st: &mut RendererState, sample: &MediaSample) -> Result<SampleChunk, ChunkError> {
        let mut chunk = st.sample_correction.process_sample(sample)?;

        if st.device.is_some() && st.state == RenderState::Running {
            self.apply_clock_correction(st);
        }

        if let Some(dsp_format) = st.device.as_ref().and_then(|d| d.device().dsp_format) {
            st.dsp.process(&mut chunk)?;
            chunk.convert_to(dsp_format)?;
        }

        Ok(chunk)
    }

    /// 流结束
    ///
    /// 吐出 DSP 链缓存的数据；`block_until_end` 时等待设备播完。
    pub fn finish(&self, block_until_end: bool) -> bool {
        let (mut chunk, block) = {
            let mut st = self.state.lock();
            assert_ne!(st.state, RenderState::Stopped, "finish while stopped");

            // 没有设备就没有可等的
            let block = block_until_end && st.device.is_some();

            let chunk = match Self::finish_chunk(&mut st) {
                Ok(chunk) => chunk,
                Err(e) => {
                    log::warn!("Failed to drain processors: {}", e);
                    SampleChunk::default()
                }
            };
            (chunk, block)
        };

        self.push(&mut chunk) && (!block || self.wait_until_drained())
    }

    fn finish_chunk(st: &mut RendererState) -> Result<SampleChunk, ChunkError> {
        let mut chunk = SampleChunk::default();
        if let Some(dsp_format) = st.device.as_ref().and_then(|d| d.device().dsp_format) {
            st.dsp.finish(&mut chunk)?;
            chunk.convert_to(dsp_format)?;
        }
        Ok(chunk)
    }

    /// 等待设备播放位置到达结束位置
    ///
    /// 运行状态下位置连续两次不变视为停滞，直接返回。
    fn wait_until_drained(&self) -> bool {
        // 之后不会再有数据，时钟不再跟随设备
        self.clock.unslave_from_audio();

        let mut target = None;
        let mut previous = None;

        loop {
            let (actual, end) = {
                let mut st = self.state.lock();

                let reading = match &st.device {
                    None => return true,
                    Some(device) => device.position().map(|p| (p, device.expected_end())),
                };

                let (actual, expected_end) = match reading {
                    Ok(reading) => reading,
                    Err(e) => {
                        log::warn!("Device failed while draining: {}", e);
                        self.clear_device(&mut st);
                        return true;
                    }
                };

                // 实时设备排空后会继续补静音，结束位置取第一次读数
                let end = *target.get_or_insert(expected_end);

                if actual >= end {
                    return true;
                }

                if previous == Some(actual) && st.state == RenderState::Running {
                    log::debug!("Device position stalled at {}, not waiting for drain", actual);
                    return true;
                }
                previous = Some(actual);

                (actual, end)
            };

            let wait = to_duration(end - actual).max(Duration::from_millis(1));
            if self.flush.wait(wait) {
                return false;
            }
        }
    }

    /// 把块交给设备
    ///
    /// 设备缓冲区满时在锁外睡眠（缓冲区时长的 1/4），可被 flush 打断。
    /// 没有设备时模拟 null 设备：按图时钟等待到样本结束时间。
    fn push(&self, chunk: &mut SampleChunk) -> bool {
        if chunk.is_empty() {
            return true;
        }

        let mut sleep = Duration::ZERO;
        let mut first = true;

        loop {
            if !first && self.flush.wait(sleep) {
                return false;
            }
            first = false;

            let mut st = self.state.lock();
            // 等待期间被 stop 等同于被打断
            if st.state == RenderState::Stopped {
                return false;
            }

            let result = st.device.as_ref().map(|device| {
                sleep = Duration::from_millis((device.device().buffer_duration_ms / 4).max(1) as u64);
                device.push(chunk, Some(&self.buffer_filled))
            });

            match result {
                Some(Ok(())) => {
                    if chunk.is_empty() {
                        return true;
                    }
                    continue;
                }
                Some(Err(e)) => {
                    log::warn!("Audio device failed, switching to null device: {}", e);
                    self.clear_device(&mut st);
                }
                None => {}
            }

            // null 设备：没有缓冲区可填，不拖延 Paused→Running
            self.buffer_filled.set();
            sleep = Duration::from_millis(1);

            if st.state == RenderState::Running
                && self.clock.graph_time() > st.start_time + st.sample_correction.last_sample_end()
            {
                return true;
            }
        }
    }

    // ---- 控制 ----

    /// 打断所有阻塞中的 push/finish 等待
    pub fn begin_flush(&self) {
        self.flush.set();
    }

    /// 清空设备缓冲区，恢复正常运行（不能在 Running 状态调用）
    pub fn end_flush(&self) {
        let mut st = self.state.lock();
        assert_ne!(st.state, RenderState::Running, "end_flush while running");

        let reset = st.device.as_ref().map(|device| device.reset());
        match reset {
            Some(Ok(())) => {
                self.buffer_filled.reset();
                st.sample_correction.new_buffer();
            }
            Some(Err(e)) => {
                log::warn!("Failed to reset audio device: {}", e);
                self.clear_device(&mut st);
            }
            None => {}
        }

        self.flush.reset();
    }

    /// 输入格式能否处理（PCM 直接处理；其他格式看能否 bitstreaming）
    pub fn check_format(&self, format: &WaveFormat) -> bool {
        if DspFormat::from_wave_format(format).is_some() {
            return true;
        }

        if !self.settings.output_device().exclusive || !self.settings.allow_bitstreaming() {
            return false;
        }

        let mut st = self.state.lock();
        st.device_manager
            .bitstream_format_supported(format, self.settings.as_ref())
    }

    pub fn set_format(&self, format: WaveFormat) {
        let mut st = self.state.lock();
        log::info!(
            "Input format: {:?}, {} Hz, {} channels, {} bits",
            format.tag,
            format.sample_rate,
            format.channels,
            format.bits_per_sample
        );
        st.input_format = Some(format);
        st.sample_correction.new_format(&format);
        self.clear_device(&mut st);
    }

    pub fn new_segment(&self, rate: f64) {
        let mut st = self.state.lock();
        st.start_clock_offset = 0;
        st.rate = rate;
        st.sample_correction.new_segment(rate);

        if st.device.is_some() {
            self.initialize_processors(&mut st);
        }
    }

    /// 开始播放；`start_time` 是流时间 0 对应的图时间
    pub fn play(&self, start_time: RefTime) {
        let mut st = self.state.lock();
        assert_ne!(st.state, RenderState::Running, "play while running");
        st.state = RenderState::Running;
        st.start_time = start_time;
        log::info!("Play at {}", start_time);
        self.start_device(&mut st);
    }

    pub fn pause(&self) {
        let mut st = self.state.lock();
        st.state = RenderState::Paused;
        log::info!("Pause");

        let stopped = st.device.as_ref().map(|device| {
            self.clock.unslave_from_audio();
            device.stop()
        });
        if let Some(Err(e)) = stopped {
            log::warn!("Failed to stop audio device: {}", e);
            self.clear_device(&mut st);
        }
    }

    pub fn stop(&self) {
        let mut st = self.state.lock();
        st.state = RenderState::Stopped;
        log::info!("Stop");
        self.clear_device(&mut st);
    }

    /// 切换内部/外部图时钟；切换会丢弃当前设备
    pub fn set_external_clock(&self, external: bool) {
        let mut st = self.state.lock();
        if st.external_clock != external {
            self.clear_device(&mut st);
        }
        st.external_clock = external;
    }

    pub fn on_external_clock(&self) -> bool {
        self.state.lock().external_clock
    }

    // ---- 查询 ----

    pub fn state(&self) -> RenderState {
        self.state.lock().state
    }

    pub fn input_format(&self) -> Option<WaveFormat> {
        self.state.lock().input_format
    }

    /// 设备缓冲区已填满事件，宿主据此完成 Paused→Running 预缓冲
    pub fn buffer_filled(&self) -> Arc<ManualResetEvent> {
        Arc::clone(&self.buffer_filled)
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        let st = self.state.lock();
        st.device.as_ref().map(|feeder| {
            let device = feeder.device();
            DeviceInfo {
                friendly_name: device.friendly_name.clone(),
                wave_format: device.wave_format,
                dsp_format: device.dsp_format,
                exclusive: device.exclusive,
                realtime: device.realtime,
                bitstream: device.is_bitstream(),
                default_device: device.default_device,
                buffer_duration_ms: device.buffer_duration_ms,
                stats: feeder.stats(),
            }
        })
    }

    pub fn active_processors(&self) -> Vec<&'static str> {
        let st = self.state.lock();
        match &st.device {
            Some(device) if st.input_format.is_some() && !device.device().is_bitstream() => {
                st.dsp.active_names()
            }
            _ => Vec::new(),
        }
    }

    // ---- 设备生命周期（调用方持有锁） ----

    /// 设备相关设置变化时丢弃设备；只有处理参数变化时重新初始化 DSP
    fn check_device_settings(&self, st: &mut RendererState) {
        let serial = self.settings.serial();
        if serial == st.device_settings_serial {
            return;
        }
        let Some(feeder) = &st.device else {
            return;
        };

        let wanted = self.settings.output_device();
        let device = feeder.device();
        let changed = device.exclusive != wanted.exclusive
            || device.buffer_duration_ms != wanted.buffer_ms
            || match wanted.device_name.as_deref() {
                Some(name) if !name.is_empty() => name != device.friendly_name,
                _ => !device.default_device,
            };

        if changed {
            log::info!("Output device settings changed, recreating device");
            self.clear_device(st);
        } else {
            st.device_settings_serial = serial;
            self.initialize_processors(st);
        }
    }

    fn start_device(&self, st: &mut RendererState) {
        debug_assert_eq!(st.state, RenderState::Running);

        let started = st.device.as_ref().map(|device| {
            self.clock
                .slave_to_audio(device.clock(), st.start_time + st.start_clock_offset);
            device.start()
        });

        match started {
            Some(Ok(())) => st.start_clock_offset = 0,
            Some(Err(e)) => {
                log::warn!("Failed to start audio device: {}", e);
                self.clear_device(st);
            }
            None => {}
        }
    }

    fn create_device(&self, st: &mut RendererState) {
        debug_assert!(st.device.is_none());
        let Some(format) = st.input_format else {
            return;
        };

        st.device_settings_serial = self.settings.serial();

        match st
            .device_manager
            .create_device(&format, self.settings.as_ref(), &self.config.feeder)
        {
            Ok(feeder) => {
                log::info!("Created audio device {:?}", feeder.device());
                st.device = Some(feeder);
                st.sample_correction.new_buffer();
                self.initialize_processors(st);

                // 流中途创建设备：时钟起点后移到已输出音频的结束位置
                st.start_clock_offset = st.sample_correction.last_sample_end();

                if st.state == RenderState::Running {
                    self.start_device(st);
                }
            }
            Err(e) => {
                log::warn!("Failed to create audio device, using null device: {}", e);
            }
        }
    }

    fn clear_device(&self, st: &mut RendererState) {
        let Some(device) = st.device.take() else {
            return;
        };

        // 先释放时钟持有的设备引用
        self.clock.unslave_from_audio();
        if let Err(e) = device.stop() {
            log::debug!("Failed to stop audio device: {}", e);
        }
        self.buffer_filled.reset();
        st.sample_correction.new_buffer();

        log::info!("Released audio device '{}'", device.device().friendly_name);
        drop(device);
        st.device_manager.release_device();
    }

    fn apply_clock_correction(&self, st: &mut RendererState) {
        debug_assert!(st.device.is_some());
        debug_assert_eq!(st.state, RenderState::Running);

        let offset = st.sample_correction.timings_error() - self.clock.slaved_clock_offset();
        if offset.abs() > self.config.clock_dead_band {
            self.clock.offset_slaved_clock(offset);
            log::debug!("Offset internal clock by {:.3} ms", offset as f64 / 10000.0);
        }
    }

    fn initialize_processors(&self, st: &mut RendererState) {
        let (Some(input), Some(feeder)) = (st.input_format, st.device.as_ref()) else {
            return;
        };
        let device = feeder.device();
        let Some(device_format) = device.dsp_format else {
            return;
        };

        let params = StreamParams {
            input_rate: input.sample_rate,
            input_channels: input.channels,
            output_rate: device.wave_format.sample_rate,
            output_channels: device.wave_format.channels,
            device_format,
            exclusive: device.exclusive,
            external_clock: st.external_clock,
            playback_rate: st.rate,
            volume: self.settings.volume(),
            crossfeed: self.settings.crossfeed_enabled(),
            limiter: self.settings.limiter_enabled(),
        };
        st.dsp.initialize(&params);
    }
}

impl Drop for AudioRenderer {
    fn drop(&mut self) {
        if self.state.get_mut().state != RenderState::Stopped {
            self.stop();
        }
    }
}
