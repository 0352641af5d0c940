//! 测试用设备后端
//!
//! 可观察状态放在独立的 `Arc<Mutex<MockState>>` 里交给测试，
//! 设备后端本身保持唯一所有权。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::device::{DeviceBackend, DeviceHandle, WriteSource};
use super::error::{DeviceError, DeviceResult};
use super::event::ManualResetEvent;
use super::format::WaveFormat;
use super::timing::RefTime;

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub buffer_frames: u32,
    pub padding: u32,
    /// 每次查询 padding 时"播放"掉的帧数
    pub drain_per_query: u32,
    /// 已播放帧数，即设备时钟位置（频率 = 采样率）
    pub played: u64,
    pub sample_rate: u32,
    pub latency: RefTime,
    /// 按顺序写入的数据字节（静音不计入）
    pub data: Vec<u8>,
    pub silence_frames: u64,
    pub io_calls: usize,
    pub started: bool,
    pub resets: usize,
    /// 设置后所有调用都返回这个错误
    pub fail: Option<DeviceError>,
    /// 设置后数据写入在提交前停下，直到 `release`
    pub write_gate: Option<Arc<WriteGate>>,
}

/// 让数据写入停在半途的闸门
#[derive(Default)]
pub(crate) struct WriteGate {
    /// 写入已进入后端
    pub entered: ManualResetEvent,
    pub release: ManualResetEvent,
}

impl std::fmt::Debug for WriteGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteGate")
            .field("entered", &self.entered.check())
            .field("release", &self.release.check())
            .finish()
    }
}

impl MockState {
    /// 播放掉缓冲区中所有数据
    pub fn play_all(&mut self) {
        self.played += self.padding as u64;
        self.padding = 0;
    }

    fn enter(&mut self) -> DeviceResult<()> {
        self.io_calls += 1;
        match &self.fail {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

pub(crate) type MockControl = Arc<Mutex<MockState>>;

struct MockBackend {
    state: MockControl,
}

impl DeviceBackend for MockBackend {
    fn buffer_size(&self) -> DeviceResult<u32> {
        let mut state = self.state.lock();
        state.enter()?;
        Ok(state.buffer_frames)
    }

    fn current_padding(&self) -> DeviceResult<u32> {
        let mut state = self.state.lock();
        state.enter()?;
        let drained = state.drain_per_query.min(state.padding);
        state.padding -= drained;
        state.played += drained as u64;
        Ok(state.padding)
    }

    fn write(&self, frames: u32, source: WriteSource<'_>) -> DeviceResult<()> {
        let gate = self.state.lock().write_gate.clone();
        if let (Some(gate), WriteSource::Data(_)) = (gate, source) {
            gate.entered.set();
            gate.release.wait(Duration::from_secs(5));
        }

        let mut state = self.state.lock();
        state.enter()?;
        if state.padding + frames > state.buffer_frames {
            return Err(DeviceError::BufferTooLarge {
                requested: frames,
                available: state.buffer_frames - state.padding,
            });
        }
        state.padding += frames;
        match source {
            WriteSource::Data(bytes) => state.data.extend_from_slice(bytes),
            WriteSource::Silence => state.silence_frames += frames as u64,
        }
        Ok(())
    }

    fn start(&self) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.enter()?;
        state.started = true;
        Ok(())
    }

    fn stop(&self) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.enter()?;
        state.started = false;
        Ok(())
    }

    fn reset(&self) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.enter()?;
        state.padding = 0;
        state.played = 0;
        state.resets += 1;
        Ok(())
    }

    fn clock_frequency(&self) -> DeviceResult<u64> {
        let mut state = self.state.lock();
        state.enter()?;
        Ok(state.sample_rate as u64)
    }

    fn clock_position(&self) -> DeviceResult<u64> {
        let mut state = self.state.lock();
        state.enter()?;
        Ok(state.played)
    }

    fn stream_latency(&self) -> DeviceResult<RefTime> {
        let mut state = self.state.lock();
        state.enter()?;
        Ok(state.latency)
    }
}

/// 构造 mock 设备句柄和它的可观察状态
pub(crate) fn mock_device(
    format: WaveFormat,
    buffer_frames: u32,
    realtime: bool,
) -> (DeviceHandle, MockControl) {
    let state = Arc::new(Mutex::new(MockState {
        buffer_frames,
        sample_rate: format.sample_rate,
        ..Default::default()
    }));
    let backend = Arc::new(MockBackend {
        state: Arc::clone(&state),
    });

    let mut device = DeviceHandle::new(backend, format);
    device.friendly_name = "Mock Device".to_string();
    device.realtime = realtime;
    device.buffer_duration_ms = 200;
    (device, state)
}
