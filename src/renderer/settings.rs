//! 渲染器设置
//!
//! 宿主的设置存储只通过 [`Settings`] 接口访问；
//! 每次修改都会递增序列号，渲染器据此发现设备相关设置的变化。

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

/// 输出设备选择
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceSettings {
    /// 设备名；`None` 或空串表示系统默认设备
    pub device_name: Option<String>,
    pub exclusive: bool,
    /// 缓冲区时长（毫秒）
    pub buffer_ms: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            device_name: None,
            exclusive: false,
            buffer_ms: 200,
        }
    }
}

/// 设置提供者
pub trait Settings: Send + Sync {
    /// 修改序列号
    fn serial(&self) -> u32;

    fn output_device(&self) -> DeviceSettings;

    fn allow_bitstreaming(&self) -> bool;

    fn crossfeed_enabled(&self) -> bool;

    fn limiter_enabled(&self) -> bool;

    /// 线性音量 [0, 1]
    fn volume(&self) -> f32;
}

#[derive(Clone, Debug)]
struct SettingsValues {
    device: DeviceSettings,
    allow_bitstreaming: bool,
    crossfeed: bool,
    limiter: bool,
    volume: f32,
}

/// 进程内设置
pub struct RendererSettings {
    serial: AtomicU32,
    values: Mutex<SettingsValues>,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            serial: AtomicU32::new(0),
            values: Mutex::new(SettingsValues {
                device: DeviceSettings::default(),
                allow_bitstreaming: true,
                crossfeed: false,
                limiter: false,
                volume: 1.0,
            }),
        }
    }
}

impl RendererSettings {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, f: impl FnOnce(&mut SettingsValues)) {
        let mut values = self.values.lock();
        f(&mut values);
        self.serial.fetch_add(1, Ordering::AcqRel);
    }

    pub fn set_output_device(&self, device_name: Option<String>, exclusive: bool, buffer_ms: u32) {
        self.update(|v| {
            v.device = DeviceSettings {
                device_name,
                exclusive,
                buffer_ms,
            }
        });
    }

    pub fn set_allow_bitstreaming(&self, allow: bool) {
        self.update(|v| v.allow_bitstreaming = allow);
    }

    pub fn set_crossfeed_enabled(&self, enabled: bool) {
        self.update(|v| v.crossfeed = enabled);
    }

    pub fn set_limiter_enabled(&self, enabled: bool) {
        self.update(|v| v.limiter = enabled);
    }

    pub fn set_volume(&self, volume: f32) {
        self.update(|v| v.volume = volume.clamp(0.0, 1.0));
    }
}

impl Settings for RendererSettings {
    fn serial(&self) -> u32 {
        self.serial.load(Ordering::Acquire)
    }

    fn output_device(&self) -> DeviceSettings {
        self.values.lock().device.clone()
    }

    fn allow_bitstreaming(&self) -> bool {
        self.values.lock().allow_bitstreaming
    }

    fn crossfeed_enabled(&self) -> bool {
        self.values.lock().crossfeed
    }

    fn limiter_enabled(&self) -> bool {
        self.values.lock().limiter
    }

    fn volume(&self) -> f32 {
        self.values.lock().volume
    }
}
