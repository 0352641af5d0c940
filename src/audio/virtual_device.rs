//! 虚拟输出设备
//!
//! 进程内模拟的设备：硬件消耗进度按墙钟时间和采样率推算，
//! 缓冲区耗尽时时钟停走并记为欠载。可选把写入的数据捕获下来。
//!
//! 可观察状态通过 [`VirtualDeviceControl`] 暴露，它只共享内部状态，
//! 不持有设备后端，因此不影响 feeder 销毁时的唯一性检查。

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use super::device::{DeviceBackend, DeviceHandle, WriteSource};
use super::error::{DeviceError, DeviceResult};
use super::format::WaveFormat;
use super::timing::{RefTime, ONE_MILLISECOND};

/// 虚拟设备配置
#[derive(Clone, Debug)]
pub struct VirtualDeviceConfig {
    pub name: String,
    /// 缓冲区时长（毫秒）
    pub buffer_ms: u32,
    /// 报告的流延迟
    pub latency: RefTime,
    /// 使用专用投喂线程
    pub realtime: bool,
    pub exclusive: bool,
    /// 捕获写入的数据
    pub capture: bool,
}

impl Default for VirtualDeviceConfig {
    fn default() -> Self {
        Self {
            name: "Virtual Output".to_string(),
            buffer_ms: 200,
            latency: 10 * ONE_MILLISECOND,
            realtime: false,
            exclusive: false,
            capture: false,
        }
    }
}

struct VirtualState {
    sample_rate: u32,
    block_align: usize,
    buffer_frames: u32,
    padding: u32,
    played: u64,
    underrun_frames: u64,

    running: bool,
    anchor: Instant,
    accounted: u64,

    capture: Option<Vec<u8>>,
    disconnected: bool,
}

impl VirtualState {
    /// 按墙钟推进播放进度
    fn advance(&mut self) {
        if !self.running {
            return;
        }
        let elapsed = self.anchor.elapsed().as_nanos();
        let due = (elapsed * self.sample_rate as u128 / 1_000_000_000) as u64;
        let delta = due.saturating_sub(self.accounted);
        self.accounted = due;

        let consumed = delta.min(self.padding as u64);
        self.padding -= consumed as u32;
        self.played += consumed;
        self.underrun_frames += delta - consumed;
    }

    fn check(&self) -> DeviceResult<()> {
        if self.disconnected {
            Err(DeviceError::Disconnected)
        } else {
            Ok(())
        }
    }
}

struct VirtualBackend {
    state: Arc<Mutex<VirtualState>>,
    latency: RefTime,
}

impl DeviceBackend for VirtualBackend {
    fn buffer_size(&self) -> DeviceResult<u32> {
        let state = self.state.lock();
        state.check()?;
        Ok(state.buffer_frames)
    }

    fn current_padding(&self) -> DeviceResult<u32> {
        let mut state = self.state.lock();
        state.check()?;
        state.advance();
        Ok(state.padding)
    }

    fn write(&self, frames: u32, source: WriteSource<'_>) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.check()?;
        state.advance();

        let available = state.buffer_frames - state.padding;
        if frames > available {
            return Err(DeviceError::BufferTooLarge {
                requested: frames,
                available,
            });
        }

        let bytes = frames as usize * state.block_align;
        if let Some(capture) = &mut state.capture {
            match source {
                WriteSource::Data(data) => capture.extend_from_slice(&data[..bytes]),
                WriteSource::Silence => capture.resize(capture.len() + bytes, 0),
            }
        }
        state.padding += frames;
        Ok(())
    }

    fn start(&self) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.check()?;
        if !state.running {
            state.running = true;
            state.anchor = Instant::now();
            state.accounted = 0;
        }
        Ok(())
    }

    fn stop(&self) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.check()?;
        state.advance();
        state.running = false;
        Ok(())
    }

    fn reset(&self) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.check()?;
        if state.running {
            return Err(DeviceError::Driver("reset while running".to_string()));
        }
        state.padding = 0;
        state.played = 0;
        Ok(())
    }

    fn clock_frequency(&self) -> DeviceResult<u64> {
        let state = self.state.lock();
        state.check()?;
        Ok(state.sample_rate as u64)
    }

    fn clock_position(&self) -> DeviceResult<u64> {
        let mut state = self.state.lock();
        state.check()?;
        state.advance();
        Ok(state.played)
    }

    fn stream_latency(&self) -> DeviceResult<RefTime> {
        self.state.lock().check()?;
        Ok(self.latency)
    }
}

/// 虚拟设备的观察/控制端
#[derive(Clone)]
pub struct VirtualDeviceControl {
    state: Arc<Mutex<VirtualState>>,
}

impl VirtualDeviceControl {
    /// 模拟设备被拔出：之后所有调用都返回 `Disconnected`
    pub fn disconnect(&self) {
        self.state.lock().disconnected = true;
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn played_frames(&self) -> u64 {
        let mut state = self.state.lock();
        state.advance();
        state.played
    }

    pub fn underrun_frames(&self) -> u64 {
        let mut state = self.state.lock();
        state.advance();
        state.underrun_frames
    }

    /// 取出目前捕获的数据
    pub fn take_captured(&self) -> Vec<u8> {
        self.state
            .lock()
            .capture
            .as_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    }
}

/// 打开虚拟设备
pub fn open_virtual_device(
    format: WaveFormat,
    config: &VirtualDeviceConfig,
) -> (DeviceHandle, VirtualDeviceControl) {
    let buffer_frames = (format.sample_rate as u64 * config.buffer_ms as u64 / 1000).max(1) as u32;
    let state = Arc::new(Mutex::new(VirtualState {
        sample_rate: format.sample_rate,
        block_align: format.block_align(),
        buffer_frames,
        padding: 0,
        played: 0,
        underrun_frames: 0,
        running: false,
        anchor: Instant::now(),
        accounted: 0,
        capture: config.capture.then(Vec::new),
        disconnected: false,
    }));

    let backend = Arc::new(VirtualBackend {
        state: Arc::clone(&state),
        latency: config.latency,
    });

    let mut device = DeviceHandle::new(backend, format);
    device.friendly_name = config.name.clone();
    device.exclusive = config.exclusive;
    device.realtime = config.realtime;
    device.default_device = true;
    device.buffer_duration_ms = config.buffer_ms;

    log::debug!(
        "Opened virtual device '{}': {} frames buffer, realtime={}",
        config.name,
        buffer_frames,
        config.realtime
    );

    (device, VirtualDeviceControl { state })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn open(capture: bool) -> (DeviceHandle, VirtualDeviceControl) {
        let config = VirtualDeviceConfig {
            buffer_ms: 100,
            capture,
            ..Default::default()
        };
        open_virtual_device(WaveFormat::pcm(48000, 2, 16), &config)
    }

    #[test]
    fn test_buffer_size_from_duration() {
        let (device, _) = open(false);
        assert_eq!(device.backend().buffer_size().unwrap(), 4800);
        assert_eq!(device.buffer_duration_ms, 100);
    }

    #[test]
    fn test_stopped_device_does_not_consume() {
        let (device, control) = open(false);
        let backend = device.backend();
        backend.write(100, WriteSource::Silence).unwrap();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(backend.current_padding().unwrap(), 100);
        assert_eq!(control.played_frames(), 0);
    }

    #[test]
    fn test_running_device_consumes_in_real_time() {
        let (device, control) = open(false);
        let backend = device.backend();
        backend.write(4800, WriteSource::Silence).unwrap();
        backend.start().unwrap();
        thread::sleep(Duration::from_millis(30));

        let padding = backend.current_padding().unwrap();
        assert!(padding < 4800);
        assert!(control.played_frames() >= 4800 - padding as u64);
        assert_eq!(control.underrun_frames(), 0);
    }

    #[test]
    fn test_starved_device_counts_underrun() {
        let (device, control) = open(false);
        device.backend().start().unwrap();
        thread::sleep(Duration::from_millis(10));
        assert!(control.underrun_frames() > 0);
        assert_eq!(control.played_frames(), 0);
    }

    #[test]
    fn test_overfill_rejected() {
        let (device, _) = open(false);
        let result = device.backend().write(5000, WriteSource::Silence);
        assert_eq!(
            result,
            Err(DeviceError::BufferTooLarge {
                requested: 5000,
                available: 4800
            })
        );
    }

    #[test]
    fn test_capture_and_disconnect() {
        let (device, control) = open(true);
        let backend = device.backend();
        backend.write(1, WriteSource::Data(&[1, 2, 3, 4])).unwrap();
        backend.write(1, WriteSource::Silence).unwrap();
        assert_eq!(control.take_captured(), vec![1, 2, 3, 4, 0, 0, 0, 0]);

        control.disconnect();
        assert_eq!(backend.current_padding(), Err(DeviceError::Disconnected));
    }

    #[test]
    fn test_reset_requires_stop() {
        let (device, _) = open(false);
        let backend = device.backend();
        backend.write(10, WriteSource::Silence).unwrap();
        backend.start().unwrap();
        assert!(backend.reset().is_err());
        backend.stop().unwrap();
        backend.reset().unwrap();
        assert_eq!(backend.current_padding().unwrap(), 0);
        assert_eq!(backend.clock_position().unwrap(), 0);
    }
}
