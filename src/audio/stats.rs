//! 投喂统计模块
//!
//! 在投喂路径上收集计数，全部是 Relaxed 原子操作，
//! 投喂线程和 push 调用方可以同时更新

use std::sync::atomic::{AtomicU64, Ordering};

/// 投喂统计收集器
#[derive(Default)]
pub struct FeederStats {
    chunks_written: AtomicU64,
    frames_written: AtomicU64,
    partial_writes: AtomicU64,

    silence_insertions: AtomicU64,
    silence_frames: AtomicU64,

    // 反压丢弃
    dropped_chunks: AtomicU64,
    dropped_frames: AtomicU64,

    // 待投喂队列最高水位（帧）
    queue_high_water: AtomicU64,
}

impl FeederStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次数据写入
    ///
    /// `remaining > 0` 表示设备空间不够，块只写了一部分
    #[inline]
    pub fn record_write(&self, frames: u32, remaining: usize) {
        self.frames_written
            .fetch_add(frames as u64, Ordering::Relaxed);
        if remaining == 0 {
            self.chunks_written.fetch_add(1, Ordering::Relaxed);
        } else {
            self.partial_writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_silence(&self, frames: u32) {
        self.silence_insertions.fetch_add(1, Ordering::Relaxed);
        self.silence_frames
            .fetch_add(frames as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_drop(&self, frames: usize) {
        self.dropped_chunks.fetch_add(1, Ordering::Relaxed);
        self.dropped_frames
            .fetch_add(frames as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_queue_level(&self, frames: u64) {
        self.queue_high_water.fetch_max(frames, Ordering::Relaxed);
    }

    #[inline]
    pub fn dropped_chunks(&self) -> u64 {
        self.dropped_chunks.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn silence_frames(&self) -> u64 {
        self.silence_frames.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self, sample_rate: u32) -> StatsReport {
        StatsReport {
            sample_rate,
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            partial_writes: self.partial_writes.load(Ordering::Relaxed),
            silence_insertions: self.silence_insertions.load(Ordering::Relaxed),
            silence_frames: self.silence_frames.load(Ordering::Relaxed),
            dropped_chunks: self.dropped_chunks.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            queue_high_water: self.queue_high_water.load(Ordering::Relaxed),
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.chunks_written.store(0, Ordering::Relaxed);
        self.frames_written.store(0, Ordering::Relaxed);
        self.partial_writes.store(0, Ordering::Relaxed);
        self.silence_insertions.store(0, Ordering::Relaxed);
        self.silence_frames.store(0, Ordering::Relaxed);
        self.dropped_chunks.store(0, Ordering::Relaxed);
        self.dropped_frames.store(0, Ordering::Relaxed);
        self.queue_high_water.store(0, Ordering::Relaxed);
    }
}

/// 统计报告
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsReport {
    pub sample_rate: u32,
    pub chunks_written: u64,
    pub frames_written: u64,
    pub partial_writes: u64,
    pub silence_insertions: u64,
    pub silence_frames: u64,
    pub dropped_chunks: u64,
    pub dropped_frames: u64,
    pub queue_high_water: u64,
}

impl StatsReport {
    fn frames_ms(&self, frames: u64) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            frames as f64 * 1000.0 / self.sample_rate as f64
        }
    }
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Device Feeding Statistics")?;
        writeln!(f, "=========================")?;
        writeln!(
            f,
            "Frames written: {} ({:.1} ms)",
            self.frames_written,
            self.frames_ms(self.frames_written)
        )?;
        writeln!(f, "  Complete chunks: {}", self.chunks_written)?;
        writeln!(f, "  Partial writes: {}", self.partial_writes)?;
        writeln!(f)?;

        writeln!(f, "Silence padding:")?;
        writeln!(f, "  Insertions: {}", self.silence_insertions)?;
        writeln!(
            f,
            "  Frames: {} ({:.1} ms)",
            self.silence_frames,
            self.frames_ms(self.silence_frames)
        )?;
        writeln!(f)?;

        writeln!(f, "Pending queue:")?;
        writeln!(
            f,
            "  High water: {} frames ({:.1} ms)",
            self.queue_high_water,
            self.frames_ms(self.queue_high_water)
        )?;
        writeln!(
            f,
            "  Dropped: {} chunks, {} frames",
            self.dropped_chunks, self.dropped_frames
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = FeederStats::new();
        stats.record_write(100, 0);
        stats.record_write(50, 25);
        stats.record_silence(10);
        stats.record_drop(480);
        stats.record_queue_level(300);
        stats.record_queue_level(200);

        let report = stats.report(48000);
        assert_eq!(report.frames_written, 150);
        assert_eq!(report.chunks_written, 1);
        assert_eq!(report.partial_writes, 1);
        assert_eq!(report.silence_insertions, 1);
        assert_eq!(report.silence_frames, 10);
        assert_eq!(report.dropped_chunks, 1);
        assert_eq!(report.dropped_frames, 480);
        assert_eq!(report.queue_high_water, 300);

        stats.reset();
        assert_eq!(stats.report(48000), StatsReport { sample_rate: 48000, ..Default::default() });
    }

    #[test]
    fn test_display() {
        let stats = FeederStats::new();
        stats.record_write(48000, 0);
        let text = stats.report(48000).to_string();
        assert!(text.contains("Frames written: 48000 (1000.0 ms)"));
    }
}
