//! DSP 处理链
//!
//! 固定顺序的处理阶段，每次 enqueue/finish 都按声明顺序调用。
//! 阶段可以原地修改样本块，也可以整个替换；可以在内部缓存前瞻数据，
//! 这些数据只在 `finish` 时吐出。

mod dither;
mod volume;

pub use dither::DspDither;
pub use volume::DspVolume;

use crate::audio::{ChunkError, DspFormat, SampleChunk};

/// 每条流的处理参数，设备创建或分段变化时重新下发
///
/// 内置阶段只读其中一部分；其余字段是留给外部阶段（重采样、交叉馈送、限幅等）的约定。
#[derive(Clone, Debug, PartialEq)]
pub struct StreamParams {
    pub input_rate: u32,
    pub input_channels: u16,
    pub output_rate: u32,
    pub output_channels: u16,
    /// 设备接受的 DSP 格式
    pub device_format: DspFormat,
    pub exclusive: bool,
    pub external_clock: bool,
    /// 播放速率（1.0 为正常）
    pub playback_rate: f64,
    /// 线性增益
    pub volume: f32,
    pub crossfeed: bool,
    pub limiter: bool,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            input_rate: 48000,
            input_channels: 2,
            output_rate: 48000,
            output_channels: 2,
            device_format: DspFormat::Float,
            exclusive: false,
            external_clock: false,
            playback_rate: 1.0,
            volume: 1.0,
            crossfeed: false,
            limiter: false,
        }
    }
}

/// 处理阶段
pub trait DspStage: Send {
    fn name(&self) -> &'static str;

    /// 当前参数下是否需要处理
    fn active(&self) -> bool;

    fn initialize(&mut self, params: &StreamParams);

    fn process(&mut self, chunk: &mut SampleChunk) -> Result<(), ChunkError>;

    /// 流结束：处理 `chunk` 并附上内部缓存的剩余数据
    fn finish(&mut self, chunk: &mut SampleChunk) -> Result<(), ChunkError> {
        self.process(chunk)
    }
}

/// 有序处理链
pub struct DspChain {
    stages: Vec<Box<dyn DspStage>>,
}

impl Default for DspChain {
    fn default() -> Self {
        Self::new(vec![Box::new(DspVolume::new()), Box::new(DspDither::new())])
    }
}

impl DspChain {
    pub fn new(stages: Vec<Box<dyn DspStage>>) -> Self {
        Self { stages }
    }

    pub fn initialize(&mut self, params: &StreamParams) {
        for stage in &mut self.stages {
            stage.initialize(params);
        }
    }

    pub fn process(&mut self, chunk: &mut SampleChunk) -> Result<(), ChunkError> {
        for stage in self.stages.iter_mut().filter(|s| s.active()) {
            stage.process(chunk)?;
        }
        Ok(())
    }

    pub fn finish(&mut self, chunk: &mut SampleChunk) -> Result<(), ChunkError> {
        for stage in self.stages.iter_mut().filter(|s| s.active()) {
            stage.finish(chunk)?;
        }
        Ok(())
    }

    /// 当前激活的阶段名
    pub fn active_names(&self) -> Vec<&'static str> {
        self.stages
            .iter()
            .filter(|s| s.active())
            .map(|s| s.name())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;

    /// 记录调用顺序的测试阶段
    struct Recorder {
        name: &'static str,
        active: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl DspStage for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn active(&self) -> bool {
            self.active
        }

        fn initialize(&mut self, _params: &StreamParams) {
            self.log.lock().push(format!("init {}", self.name));
        }

        fn process(&mut self, _chunk: &mut SampleChunk) -> Result<(), ChunkError> {
            self.log.lock().push(format!("process {}", self.name));
            Ok(())
        }

        fn finish(&mut self, _chunk: &mut SampleChunk) -> Result<(), ChunkError> {
            self.log.lock().push(format!("finish {}", self.name));
            Ok(())
        }
    }

    fn chain(log: &Arc<Mutex<Vec<String>>>) -> DspChain {
        let stage = |name, active| -> Box<dyn DspStage> {
            Box::new(Recorder {
                name,
                active,
                log: Arc::clone(log),
            })
        };
        DspChain::new(vec![stage("a", true), stage("b", false), stage("c", true)])
    }

    #[test]
    fn test_stages_run_in_order_and_skip_inactive() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = chain(&log);
        let mut chunk = SampleChunk::default();

        chain.initialize(&StreamParams::default());
        chain.process(&mut chunk).unwrap();
        chain.finish(&mut chunk).unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "init a", "init b", "init c", "process a", "process c", "finish a", "finish c"
            ]
        );
        assert_eq!(chain.active_names(), vec!["a", "c"]);
    }

    #[test]
    fn test_default_chain_inactive_for_float_unity() {
        let mut chain = DspChain::default();
        chain.initialize(&StreamParams::default());
        assert!(chain.active_names().is_empty());

        chain.initialize(&StreamParams {
            device_format: DspFormat::Pcm16,
            volume: 0.5,
            ..Default::default()
        });
        assert_eq!(chain.active_names(), vec!["volume", "dither"]);
    }
}
