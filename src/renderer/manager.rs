//! 设备管理
//!
//! 渲染器通过 [`DeviceManager`] 获取和释放设备。
//! 自带的 [`VirtualDeviceManager`] 打开进程内虚拟设备。

use std::sync::Arc;

use parking_lot::Mutex;

use super::settings::Settings;
use crate::audio::{
    open_virtual_device, DeviceError, DeviceFeeder, DeviceResult, DspFormat, FeederConfig,
    VirtualDeviceConfig, VirtualDeviceControl, WaveFormat,
};

/// 设备管理器接口
pub trait DeviceManager: Send {
    /// 按输入格式和当前设置打开设备
    fn create_device(
        &mut self,
        format: &WaveFormat,
        settings: &dyn Settings,
        config: &FeederConfig,
    ) -> DeviceResult<DeviceFeeder>;

    /// 渲染器已释放设备
    fn release_device(&mut self);

    /// 输入格式能否原样送往设备
    fn bitstream_format_supported(&mut self, format: &WaveFormat, settings: &dyn Settings) -> bool;
}

/// 当前虚拟设备的观察端，供宿主在管理器移交给渲染器后使用
#[derive(Clone, Default)]
pub struct DeviceMonitor {
    current: Arc<Mutex<Option<VirtualDeviceControl>>>,
}

impl DeviceMonitor {
    pub fn current(&self) -> Option<VirtualDeviceControl> {
        self.current.lock().clone()
    }
}

/// 虚拟设备管理器
///
/// 共享模式下设备格式为 Float；独占模式下使用输入的整数格式
/// （Pcm8 提升为 Pcm16）。非 PCM 输入只能在独占模式下 bitstreaming。
pub struct VirtualDeviceManager {
    config: VirtualDeviceConfig,
    monitor: DeviceMonitor,
    created: usize,
}

impl VirtualDeviceManager {
    pub fn new(config: VirtualDeviceConfig) -> Self {
        Self {
            config,
            monitor: DeviceMonitor::default(),
            created: 0,
        }
    }

    pub fn monitor(&self) -> DeviceMonitor {
        self.monitor.clone()
    }

    /// 已打开过的设备数
    pub fn created(&self) -> usize {
        self.created
    }

    fn device_format(format: &WaveFormat, exclusive: bool) -> Option<WaveFormat> {
        let input = DspFormat::from_wave_format(format)?;
        let dsp = match (exclusive, input) {
            (false, _) => DspFormat::Float,
            (true, DspFormat::Pcm8) => DspFormat::Pcm16,
            // 设备上的 24-bit 是 MSB 对齐的 4 字节容器
            (true, DspFormat::Pcm24) => {
                return Some(WaveFormat {
                    valid_bits: 24,
                    ..WaveFormat::for_dsp(DspFormat::Pcm32, format.sample_rate, format.channels)
                })
            }
            (true, format) => format,
        };
        Some(WaveFormat::for_dsp(dsp, format.sample_rate, format.channels))
    }
}

impl DeviceManager for VirtualDeviceManager {
    fn create_device(
        &mut self,
        format: &WaveFormat,
        settings: &dyn Settings,
        config: &FeederConfig,
    ) -> DeviceResult<DeviceFeeder> {
        let device_settings = settings.output_device();

        let wave_format = match Self::device_format(format, device_settings.exclusive) {
            Some(wave_format) => wave_format,
            None if self.bitstream_format_supported(format, settings) => *format,
            None => {
                return Err(DeviceError::Driver(format!(
                    "Unsupported input format {:?}",
                    format.tag
                )))
            }
        };

        let name = device_settings
            .device_name
            .clone()
            .filter(|n| !n.is_empty());
        let device_config = VirtualDeviceConfig {
            name: name.clone().unwrap_or_else(|| self.config.name.clone()),
            buffer_ms: device_settings.buffer_ms,
            exclusive: device_settings.exclusive,
            ..self.config.clone()
        };

        let (mut device, control) = open_virtual_device(wave_format, &device_config);
        device.default_device = name.is_none();

        let feeder = DeviceFeeder::new(device, config.clone())?;
        *self.monitor.current.lock() = Some(control);
        self.created += 1;
        Ok(feeder)
    }

    fn release_device(&mut self) {
        self.monitor.current.lock().take();
    }

    fn bitstream_format_supported(&mut self, format: &WaveFormat, settings: &dyn Settings) -> bool {
        DspFormat::from_wave_format(format).is_none()
            && settings.output_device().exclusive
            && settings.allow_bitstreaming()
            && format.block_align() > 0
    }
}
