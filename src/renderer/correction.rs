//! 样本校正
//!
//! 把宿主送来的样本包装成样本块（不复制），并按时间戳修整：
//! - 与上一个样本之间的空隙超过 1ms：在块头补静音
//! - 与上一个样本重叠超过 1ms：裁掉块头
//! - 容差内的偏差不修整，累计为计时误差，交给时钟校正
//!
//! 所有时间都是分段内的流时间，已按播放速率缩放。

use std::sync::Arc;

use crate::audio::timing::{frames_to_time, time_to_frames};
use crate::audio::{ChunkError, DspFormat, RefTime, SampleChunk, WaveFormat, ONE_MILLISECOND};

/// 空隙/重叠容差
const GAP_TOLERANCE: RefTime = ONE_MILLISECOND;

/// 宿主送来的一个样本
#[derive(Clone, Debug)]
pub struct MediaSample {
    pub data: Arc<[u8]>,
    /// 分段内开始时间；`None` 表示紧接上一个样本
    pub start: Option<RefTime>,
}

impl MediaSample {
    pub fn new(data: impl Into<Arc<[u8]>>, start: Option<RefTime>) -> Self {
        Self {
            data: data.into(),
            start,
        }
    }
}

/// 样本校正阶段
pub trait SampleCorrection: Send {
    fn new_format(&mut self, format: &WaveFormat);

    fn new_segment(&mut self, rate: f64);

    /// 设备缓冲区被清空或替换
    fn new_buffer(&mut self);

    fn process_sample(&mut self, sample: &MediaSample) -> Result<SampleChunk, ChunkError>;

    /// 样本时间戳与实际输出位置之间的偏差
    fn timings_error(&self) -> RefTime;

    /// 已输出音频的结束时间
    fn last_sample_end(&self) -> RefTime;
}

pub struct BasicSampleCorrection {
    format: Option<WaveFormat>,
    bitstream: bool,
    rate: f64,
    last_sample_end: RefTime,
    timings_error: RefTime,
}

impl Default for BasicSampleCorrection {
    fn default() -> Self {
        Self::new()
    }
}

impl BasicSampleCorrection {
    pub fn new() -> Self {
        Self {
            format: None,
            bitstream: false,
            rate: 1.0,
            last_sample_end: 0,
            timings_error: 0,
        }
    }

    /// 媒体时间 → 流时间
    fn scaled(&self, time: RefTime) -> RefTime {
        (time as f64 / self.rate) as RefTime
    }

    /// 流时间 → 媒体时间
    fn unscaled(&self, time: RefTime) -> RefTime {
        (time as f64 * self.rate) as RefTime
    }
}

impl SampleCorrection for BasicSampleCorrection {
    fn new_format(&mut self, format: &WaveFormat) {
        self.bitstream = DspFormat::from_wave_format(format).is_none();
        self.format = Some(*format);
        self.new_buffer();
    }

    fn new_segment(&mut self, rate: f64) {
        self.rate = if rate > 0.0 { rate } else { 1.0 };
        self.last_sample_end = 0;
        self.timings_error = 0;
    }

    fn new_buffer(&mut self) {
        self.timings_error = 0;
    }

    fn process_sample(&mut self, sample: &MediaSample) -> Result<SampleChunk, ChunkError> {
        let Some(format) = &self.format else {
            return Ok(SampleChunk::default());
        };
        let sample_rate = format.sample_rate;

        let mut chunk = SampleChunk::from_source(Arc::clone(&sample.data), sample.data.len(), format)?;

        if let Some(start) = sample.start {
            let error = self.scaled(start) - self.last_sample_end;

            if self.bitstream {
                self.timings_error = error;
            } else if error > GAP_TOLERANCE {
                let frames = time_to_frames(self.unscaled(error), sample_rate) as usize;
                chunk.pad_head(frames)?;
                let padded = self.scaled(frames_to_time(frames as u64, sample_rate));
                self.timings_error = error - padded;
                log::debug!("Padded {:.3} ms gap with silence", error as f64 / 10000.0);
            } else if error < -GAP_TOLERANCE {
                let frames = time_to_frames(self.unscaled(-error), sample_rate) as usize;
                let cropped = frames.min(chunk.frame_count());
                chunk.shrink_head(cropped);
                let cropped_time = self.scaled(frames_to_time(cropped as u64, sample_rate));
                self.timings_error = error + cropped_time;
                log::debug!("Cropped {:.3} ms overlap", -error as f64 / 10000.0);
            } else {
                self.timings_error = error;
            }
        }

        self.last_sample_end += self.scaled(frames_to_time(chunk.frame_count() as u64, sample_rate));
        Ok(chunk)
    }

    fn timings_error(&self) -> RefTime {
        self.timings_error
    }

    fn last_sample_end(&self) -> RefTime {
        self.last_sample_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 48kHz 单声道 16-bit，`frames` 帧非零数据
    fn sample(frames: usize, start: Option<RefTime>) -> MediaSample {
        MediaSample::new(vec![0x11u8; frames * 2], start)
    }

    fn correction() -> BasicSampleCorrection {
        let mut c = BasicSampleCorrection::new();
        c.new_format(&WaveFormat::pcm(48000, 1, 16));
        c.new_segment(1.0);
        c
    }

    #[test]
    fn test_contiguous_samples_pass_through() {
        let mut c = correction();
        let chunk = c.process_sample(&sample(480, Some(0))).unwrap();
        assert!(chunk.is_shared());
        assert_eq!(chunk.frame_count(), 480);

        let chunk = c.process_sample(&sample(480, Some(10 * ONE_MILLISECOND))).unwrap();
        assert_eq!(chunk.frame_count(), 480);
        assert_eq!(c.timings_error(), 0);
        assert_eq!(c.last_sample_end(), 20 * ONE_MILLISECOND);
    }

    #[test]
    fn test_gap_padded_with_silence() {
        let mut c = correction();
        c.process_sample(&sample(480, Some(0))).unwrap();

        // 5ms 空隙
        let chunk = c.process_sample(&sample(480, Some(15 * ONE_MILLISECOND))).unwrap();
        assert_eq!(chunk.frame_count(), 480 + 240);
        assert!(chunk.data()[..480].iter().all(|&b| b == 0));
        assert!(chunk.data()[480..].iter().all(|&b| b == 0x11));
        assert_eq!(c.timings_error(), 0);
        assert_eq!(c.last_sample_end(), 25 * ONE_MILLISECOND);
    }

    #[test]
    fn test_overlap_cropped() {
        let mut c = correction();
        c.process_sample(&sample(480, Some(0))).unwrap();

        // 与上一个样本重叠 2ms
        let chunk = c.process_sample(&sample(480, Some(8 * ONE_MILLISECOND))).unwrap();
        assert_eq!(chunk.frame_count(), 480 - 96);
        assert_eq!(c.last_sample_end(), 18 * ONE_MILLISECOND);
    }

    #[test]
    fn test_small_jitter_becomes_timing_error() {
        let mut c = correction();
        c.process_sample(&sample(480, Some(0))).unwrap();

        let chunk = c.process_sample(&sample(480, Some(10 * ONE_MILLISECOND + 500))).unwrap();
        assert_eq!(chunk.frame_count(), 480);
        assert_eq!(c.timings_error(), 500);

        c.new_buffer();
        assert_eq!(c.timings_error(), 0);
    }

    #[test]
    fn test_playback_rate_scales_time() {
        let mut c = correction();
        c.new_segment(2.0);
        c.process_sample(&sample(480, Some(0))).unwrap();
        assert_eq!(c.last_sample_end(), 5 * ONE_MILLISECOND);
    }

    #[test]
    fn test_without_format_yields_empty_chunk() {
        let mut c = BasicSampleCorrection::new();
        assert!(c.process_sample(&sample(480, Some(0))).unwrap().is_empty());
    }
}
