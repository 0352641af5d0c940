//! 时间单位与换算
//!
//! 渲染核心统一使用 100ns 为单位的参考时间（RefTime），
//! 设备时钟、样本时间戳、帧计数都换算到这个单位再比较。

use std::time::Duration;

/// 参考时间：100ns tick 计数（有符号，允许表示负偏移）
pub type RefTime = i64;

/// 1 秒 = 10_000_000 tick
pub const ONE_SECOND: RefTime = 10_000_000;

/// 1 毫秒 = 10_000 tick
pub const ONE_MILLISECOND: RefTime = 10_000;

/// 计算 `a * b / c`，中间结果使用 128 位避免溢出
///
/// 向零截断。`c == 0` 时返回 0（设备时钟频率未知时不至于 panic）。
#[inline]
pub fn mul_div(a: i64, b: i64, c: i64) -> i64 {
    if c == 0 {
        return 0;
    }
    let r = (a as i128) * (b as i128) / (c as i128);
    r.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// 帧数 → 参考时间
#[inline]
pub fn frames_to_time(frames: u64, sample_rate: u32) -> RefTime {
    mul_div(frames as i64, ONE_SECOND, sample_rate as i64)
}

/// 参考时间 → 帧数（负值按 0 处理）
#[inline]
pub fn time_to_frames(time: RefTime, sample_rate: u32) -> u64 {
    mul_div(sample_rate as i64, time.max(0), ONE_SECOND) as u64
}

/// 设备时钟读数（tick, 频率）→ 参考时间
#[inline]
pub fn device_ticks_to_time(position: u64, frequency: u64) -> RefTime {
    mul_div(position as i64, ONE_SECOND, frequency as i64)
}

/// 参考时间 → `Duration`（负值按 0 处理）
#[inline]
pub fn to_duration(time: RefTime) -> Duration {
    Duration::from_nanos(time.max(0) as u64 * 100)
}

/// `Duration` → 参考时间
#[inline]
pub fn from_duration(duration: Duration) -> RefTime {
    (duration.as_nanos() / 100).min(i64::MAX as u128) as RefTime
}
