//! 音频核心模块
//!
//! 包含：
//! - Format: 样本格式和格式转换
//! - Chunk: 在途样本块（写时复制）
//! - Timing: 100ns 参考时间
//! - Device: 设备能力接口和句柄
//! - Feeder: 设备投喂（实时投喂线程）
//! - Stats: 投喂统计
//! - VirtualDevice: 按墙钟推进的进程内设备

pub mod chunk;
pub mod device;
pub mod error;
pub mod event;
pub mod feeder;
pub mod format;
pub mod stats;
pub mod timing;
pub mod virtual_device;

#[cfg(test)]
pub(crate) mod mock;

pub use chunk::SampleChunk;
pub use device::{DeviceBackend, DeviceClock, DeviceHandle, WriteSource};
pub use error::{ChunkError, DeviceError, DeviceResult};
pub use event::ManualResetEvent;
pub use feeder::{DeviceFeeder, FeederConfig};
pub use format::{DspFormat, FormatTag, SubFormat, WaveFormat};
pub use stats::{FeederStats, StatsReport};
pub use timing::{RefTime, ONE_MILLISECOND, ONE_SECOND};
pub use virtual_device::{open_virtual_device, VirtualDeviceConfig, VirtualDeviceControl};
