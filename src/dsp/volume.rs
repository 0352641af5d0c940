//! 音量

use super::{DspStage, StreamParams};
use crate::audio::{ChunkError, SampleChunk};

/// 浮点域线性增益，增益为 1 时不激活（保持 bit-perfect）
pub struct DspVolume {
    gain: f64,
}

impl DspVolume {
    pub fn new() -> Self {
        Self { gain: 1.0 }
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }
}

impl Default for DspVolume {
    fn default() -> Self {
        Self::new()
    }
}

impl DspStage for DspVolume {
    fn name(&self) -> &'static str {
        "volume"
    }

    fn active(&self) -> bool {
        (self.gain - 1.0).abs() > f64::EPSILON
    }

    fn initialize(&mut self, params: &StreamParams) {
        self.gain = params.volume.clamp(0.0, 1.0) as f64;
    }

    fn process(&mut self, chunk: &mut SampleChunk) -> Result<(), ChunkError> {
        if chunk.is_empty() {
            return Ok(());
        }
        let gain = self.gain;
        chunk.map_samples_f64(|v| v * gain)
    }
}
