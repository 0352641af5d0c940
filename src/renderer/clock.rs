//! 呈现时钟
//!
//! 未从属时按墙钟走；从属到设备时钟后，
//! 时间 = 开始时间 + 设备播放位置 + 校正偏移。
//! 两种模式之间切换时保持连续、单调。

use std::time::Instant;

use parking_lot::Mutex;

use crate::audio::timing::from_duration;
use crate::audio::{DeviceClock, RefTime};

/// 渲染器使用的时钟接口
pub trait PresentationClock: Send + Sync {
    /// 当前图时间
    fn graph_time(&self) -> RefTime;

    /// 从属到设备时钟；`start_time` 是设备位置 0 对应的图时间
    fn slave_to_audio(&self, clock: DeviceClock, start_time: RefTime);

    /// 解除从属，释放设备时钟
    fn unslave_from_audio(&self);

    /// 在当前偏移上再加 `offset`
    fn offset_slaved_clock(&self, offset: RefTime);

    fn slaved_clock_offset(&self) -> RefTime;
}

struct Slave {
    clock: DeviceClock,
    start_time: RefTime,
}

struct ClockState {
    slave: Option<Slave>,
    offset: RefTime,
    // 墙钟模式下加在 elapsed 上的修正，用于切换时保持连续
    wall_adjust: RefTime,
    last: RefTime,
}

/// 可从属到设备的时钟
pub struct SlavedClock {
    origin: Instant,
    state: Mutex<ClockState>,
}

impl Default for SlavedClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SlavedClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Mutex::new(ClockState {
                slave: None,
                offset: 0,
                wall_adjust: 0,
                last: 0,
            }),
        }
    }

    fn wall(&self) -> RefTime {
        from_duration(self.origin.elapsed())
    }

    pub fn is_slaved(&self) -> bool {
        self.state.lock().slave.is_some()
    }
}

impl PresentationClock for SlavedClock {
    fn graph_time(&self) -> RefTime {
        let mut state = self.state.lock();

        let slaved = state
            .slave
            .as_ref()
            .and_then(|slave| slave.clock.time().ok().map(|t| slave.start_time + t));

        let time = match slaved {
            Some(time) => time + state.offset,
            None => self.wall() + state.wall_adjust,
        };

        state.last = state.last.max(time);
        state.last
    }

    fn slave_to_audio(&self, clock: DeviceClock, start_time: RefTime) {
        let mut state = self.state.lock();
        state.slave = Some(Slave { clock, start_time });
        state.offset = 0;
        log::debug!("Clock slaved to audio device, start time {}", start_time);
    }

    fn unslave_from_audio(&self) {
        let mut state = self.state.lock();
        if state.slave.take().is_some() {
            state.wall_adjust = state.last - self.wall();
            state.offset = 0;
            log::debug!("Clock unslaved from audio device");
        }
    }

    fn offset_slaved_clock(&self, offset: RefTime) {
        let mut state = self.state.lock();
        if state.slave.is_some() {
            state.offset += offset;
        }
    }

    fn slaved_clock_offset(&self) -> RefTime {
        self.state.lock().offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mock::mock_device;
    use crate::audio::{WaveFormat, ONE_SECOND};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wall_clock_advances() {
        let clock = SlavedClock::new();
        let t0 = clock.graph_time();
        thread::sleep(Duration::from_millis(5));
        assert!(clock.graph_time() > t0);
    }

    #[test]
    fn test_slaved_follows_device_and_offset() {
        let (device, control) = mock_device(WaveFormat::pcm(48000, 2, 16), 100, false);
        let clock = SlavedClock::new();

        control.lock().played = 48000;
        clock.slave_to_audio(device.clock(), 5 * ONE_SECOND);
        assert_eq!(clock.graph_time(), 6 * ONE_SECOND);

        clock.offset_slaved_clock(1000);
        clock.offset_slaved_clock(500);
        assert_eq!(clock.slaved_clock_offset(), 1500);
        assert_eq!(clock.graph_time(), 6 * ONE_SECOND + 1500);

        // 解除从属后释放设备时钟，时间保持连续
        clock.unslave_from_audio();
        assert!(device.is_unique());
        assert_eq!(clock.slaved_clock_offset(), 0);
        assert!(clock.graph_time() >= 6 * ONE_SECOND + 1500);
    }

    #[test]
    fn test_offset_ignored_when_unslaved() {
        let clock = SlavedClock::new();
        clock.offset_slaved_clock(1000);
        assert_eq!(clock.slaved_clock_offset(), 0);
    }
}
