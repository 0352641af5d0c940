//! 输出设备句柄
//!
//! 渲染核心不直接操作驱动，只通过 [`DeviceBackend`] 能力接口访问设备。
//! [`DeviceHandle`] 把后端和协商好的格式/标志捆绑在一起，
//! 由唯一的 [`DeviceFeeder`](super::feeder::DeviceFeeder) 独占持有。

use std::sync::Arc;

use super::error::DeviceResult;
use super::format::{DspFormat, WaveFormat};
use super::timing::{device_ticks_to_time, RefTime};

/// 写入设备缓冲区的数据来源
#[derive(Debug, Clone, Copy)]
pub enum WriteSource<'a> {
    /// 交织样本，长度必须等于 `frames * block_align`
    Data(&'a [u8]),
    /// 让设备自己填充静音
    Silence,
}

/// 设备后端能力接口
///
/// 所有方法只取 `&self`：投喂线程和控制线程会并发调用，
/// 实现方自行保证内部同步。
pub trait DeviceBackend: Send + Sync {
    /// 设备缓冲区总帧数
    fn buffer_size(&self) -> DeviceResult<u32>;

    /// 缓冲区中尚未播放的帧数
    fn current_padding(&self) -> DeviceResult<u32>;

    /// 获取 `frames` 帧可写区域，填入数据并提交
    fn write(&self, frames: u32, source: WriteSource<'_>) -> DeviceResult<()>;

    fn start(&self) -> DeviceResult<()>;
    fn stop(&self) -> DeviceResult<()>;

    /// 丢弃缓冲区中所有未播放数据（设备必须已停止）
    fn reset(&self) -> DeviceResult<()>;

    /// 设备时钟频率（tick/秒）
    fn clock_frequency(&self) -> DeviceResult<u64>;

    /// 设备时钟位置（tick）
    fn clock_position(&self) -> DeviceResult<u64>;

    /// 设备报告的流延迟
    fn stream_latency(&self) -> DeviceResult<RefTime>;
}

/// 打开的输出设备
pub struct DeviceHandle {
    backend: Arc<dyn DeviceBackend>,

    /// 设备原生格式
    pub wave_format: WaveFormat,
    /// DSP 输出格式；`None` 表示 bitstreaming（数据原样送往设备）
    pub dsp_format: Option<DspFormat>,
    pub friendly_name: String,
    /// 独占模式
    pub exclusive: bool,
    /// 需要专用投喂线程提前填充
    pub realtime: bool,
    /// 系统默认设备
    pub default_device: bool,
    /// 缓冲区时长（毫秒）
    pub buffer_duration_ms: u32,
}

impl DeviceHandle {
    /// 包装后端，DSP 格式由原生格式推导
    pub fn new(backend: Arc<dyn DeviceBackend>, wave_format: WaveFormat) -> Self {
        Self {
            backend,
            dsp_format: DspFormat::from_wave_format(&wave_format),
            wave_format,
            friendly_name: String::new(),
            exclusive: false,
            realtime: false,
            default_device: false,
            buffer_duration_ms: 0,
        }
    }

    #[inline]
    pub fn backend(&self) -> &dyn DeviceBackend {
        self.backend.as_ref()
    }

    #[inline]
    pub fn is_bitstream(&self) -> bool {
        self.dsp_format.is_none()
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.wave_format.sample_rate
    }

    /// 交给从属时钟的设备时钟
    ///
    /// 克隆出的时钟共享后端所有权，必须在 feeder 销毁前释放。
    pub fn clock(&self) -> DeviceClock {
        DeviceClock {
            backend: Arc::clone(&self.backend),
        }
    }

    /// 后端是否只被本句柄引用
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.backend) == 1
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("name", &self.friendly_name)
            .field("wave_format", &self.wave_format)
            .field("dsp_format", &self.dsp_format)
            .field("exclusive", &self.exclusive)
            .field("realtime", &self.realtime)
            .field("buffer_duration_ms", &self.buffer_duration_ms)
            .finish()
    }
}

/// 设备时钟
pub struct DeviceClock {
    backend: Arc<dyn DeviceBackend>,
}

impl DeviceClock {
    /// 当前播放位置（参考时间）
    pub fn time(&self) -> DeviceResult<RefTime> {
        let frequency = self.backend.clock_frequency()?;
        let position = self.backend.clock_position()?;
        Ok(device_ticks_to_time(position, frequency))
    }
}

impl std::fmt::Debug for DeviceClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DeviceClock")
    }
}
