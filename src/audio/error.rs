//! 渲染核心错误类型

use thiserror::Error;

use super::format::DspFormat;

/// 样本块分配/转换错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    /// 平台无法提供内存
    #[error("Failed to allocate {bytes} bytes for sample chunk")]
    Alloc { bytes: usize },

    /// 目标格式不可作为 DSP/设备格式（Pcm8 只能作为源格式）
    #[error("Cannot convert to {0}: source-only format")]
    UnsupportedTarget(DspFormat),
}

/// 设备错误
///
/// 渲染器遇到任何设备错误都会丢弃当前设备，退回 null 设备模拟，
/// 因此这里只区分日志需要的类别。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// 设备被拔出或失效
    #[error("Audio device disconnected")]
    Disconnected,

    /// 设备格式或配置被系统改变
    #[error("Audio device reconfigured")]
    Reconfigured,

    /// 驱动报告的其他错误
    #[error("Audio driver error: {0}")]
    Driver(String),

    /// 请求写入的帧数超过设备缓冲区剩余空间
    #[error("Requested {requested} frames, only {available} available")]
    BufferTooLarge { requested: u32, available: u32 },

    /// 实时投喂线程已退出，该 feeder 必须被丢弃
    #[error("Device feeding thread has stopped")]
    FeederStopped,

    /// 投喂路径上的内存分配失败
    #[error(transparent)]
    Alloc(#[from] ChunkError),
}

/// 设备操作结果
pub type DeviceResult<T> = Result<T, DeviceError>;
