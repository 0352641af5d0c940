//! TPDF Dither
//!
//! 设备格式为 16-bit 时，在量化前加入 ±1 LSB 的三角分布噪声，
//! 并直接输出 Pcm16（四舍五入），之后到设备格式的转换是 no-op。

use super::{DspStage, StreamParams};
use crate::audio::{ChunkError, DspFormat, SampleChunk};

/// xorshift32 + TPDF
///
/// 无分配、无锁，可以在渲染路径上使用
struct TpdfNoise {
    state: u32,
}

impl TpdfNoise {
    fn new(seed: u32) -> Self {
        Self {
            state: if seed == 0 { 0xDEADBEEF } else { seed },
        }
    }

    #[inline(always)]
    fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }

    /// 范围约 [-1, 1]，峰值在 0
    #[inline(always)]
    fn next_tpdf(&mut self) -> f64 {
        const SCALE: f64 = 1.0 / 16777216.0; // 2^-24
        let r1 = (self.next_u32() >> 8) as f64 * SCALE;
        let r2 = (self.next_u32() >> 8) as f64 * SCALE;
        r1 + r2 - 1.0
    }
}

pub struct DspDither {
    active: bool,
    noise: TpdfNoise,
}

impl DspDither {
    pub fn new() -> Self {
        Self {
            active: false,
            noise: TpdfNoise::new(0x1234_5678),
        }
    }
}

impl Default for DspDither {
    fn default() -> Self {
        Self::new()
    }
}

impl DspStage for DspDither {
    fn name(&self) -> &'static str {
        "dither"
    }

    fn active(&self) -> bool {
        self.active
    }

    fn initialize(&mut self, params: &StreamParams) {
        self.active = params.device_format == DspFormat::Pcm16;
    }

    fn process(&mut self, chunk: &mut SampleChunk) -> Result<(), ChunkError> {
        if chunk.is_empty() || chunk.format() == DspFormat::Pcm16 {
            return Ok(());
        }

        chunk.convert_to(DspFormat::Double)?;

        let mut output = SampleChunk::new(
            DspFormat::Pcm16,
            chunk.channel_count(),
            chunk.frame_count(),
            chunk.rate(),
        )?;

        let out = output.data_mut()?;
        for (src, dst) in chunk.data().chunks_exact(8).zip(out.chunks_exact_mut(2)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(src);
            let value = f64::from_le_bytes(raw) * 32768.0 + self.noise.next_tpdf();
            let sample = value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
            dst.copy_from_slice(&sample.to_le_bytes());
        }

        *chunk = output;
        Ok(())
    }
}
