//! 设备投喂
//!
//! [`DeviceFeeder`] 独占一个 [`DeviceHandle`]，负责把样本块按时写进设备缓冲区。
//!
//! 两种设备：
//! - 直写设备：`push` 同步写入设备当前能容纳的帧数，剩余部分留在块里由调用方重试
//! - 实时设备：`push` 只把块放进待投喂队列，由专用投喂线程提前填充设备；
//!   队列为空且设备快要欠载时，投喂线程插入静音
//!
//! 队列锁只保护待投喂队列，设备 I/O 从不在队列锁内进行。
//! 写入锁把投喂线程的一次写入和 `reset` 串行化：reset 返回后不会再有
//! reset 之前取出的数据进入设备。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_utils::sync::{Parker, Unparker};
use parking_lot::Mutex;

use super::chunk::SampleChunk;
use super::device::{DeviceClock, DeviceHandle, WriteSource};
use super::error::{DeviceError, DeviceResult};
use super::event::ManualResetEvent;
use super::stats::{FeederStats, StatsReport};
use super::timing::{frames_to_time, time_to_frames, RefTime, ONE_MILLISECOND, ONE_SECOND};

/// 投喂配置
#[derive(Clone, Debug)]
pub struct FeederConfig {
    /// 投喂线程每轮最长睡眠时间，决定最坏投喂延迟
    pub wake_interval: Duration,
    /// 欠载判断时在设备延迟之上追加的余量
    pub silence_guard: RefTime,
    /// 待投喂队列上限，超过后新块被丢弃
    pub max_buffered: RefTime,
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            wake_interval: Duration::from_millis(1),
            silence_guard: 2 * ONE_MILLISECOND,
            max_buffered: ONE_SECOND / 3,
        }
    }
}

#[derive(Default)]
struct PendingQueue {
    chunks: VecDeque<SampleChunk>,
    frames: u64,
    // reset 时递增，投喂线程据此丢弃 reset 之前取出的块的剩余部分
    generation: u64,
}

struct FeederInner {
    device: DeviceHandle,
    config: FeederConfig,
    queue: Mutex<PendingQueue>,
    write_lock: Mutex<()>,
    pushed_frames: AtomicU64,
    silence_frames: AtomicU64,
    exit: AtomicBool,
    stats: FeederStats,
}

/// 设备投喂器
pub struct DeviceFeeder {
    inner: Arc<FeederInner>,
    unparker: Option<Unparker>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceFeeder {
    /// 接管设备；实时设备立即启动投喂线程
    pub fn new(device: DeviceHandle, config: FeederConfig) -> DeviceResult<Self> {
        let realtime = device.realtime;
        let inner = Arc::new(FeederInner {
            device,
            config,
            queue: Mutex::new(PendingQueue::default()),
            write_lock: Mutex::new(()),
            pushed_frames: AtomicU64::new(0),
            silence_frames: AtomicU64::new(0),
            exit: AtomicBool::new(false),
            stats: FeederStats::new(),
        });

        if !realtime {
            return Ok(Self {
                inner,
                unparker: None,
                thread: None,
            });
        }

        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        let thread_inner = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name("audio-feed".to_string())
            .spawn(move || thread_inner.feed_loop(parker))
            .map_err(|e| DeviceError::Driver(format!("Failed to spawn feeding thread: {}", e)))?;

        log::debug!(
            "Realtime feeding thread started for '{}'",
            inner.device.friendly_name
        );

        Ok(Self {
            inner,
            unparker: Some(unparker),
            thread: Some(thread),
        })
    }

    #[inline]
    pub fn device(&self) -> &DeviceHandle {
        &self.inner.device
    }

    #[inline]
    pub fn is_realtime(&self) -> bool {
        self.inner.device.realtime
    }

    /// 实时投喂线程是否已因错误退出
    #[inline]
    pub fn is_failed(&self) -> bool {
        self.is_realtime() && self.inner.exit.load(Ordering::Acquire)
    }

    /// 交给从属时钟的设备时钟
    pub fn clock(&self) -> DeviceClock {
        self.inner.device.clock()
    }

    /// 推送样本块
    ///
    /// 实时设备：块整体移入队列（超过队列上限时丢弃），块在返回时为空。
    /// 直写设备：写入设备当前能容纳的部分，块保留未写入的剩余帧。
    /// 设备缓冲区被填满时设置 `filled`。
    pub fn push(&self, chunk: &mut SampleChunk, filled: Option<&ManualResetEvent>) -> DeviceResult<()> {
        if self.is_realtime() {
            let had_data = !chunk.is_empty();
            self.push_to_queue(chunk)?;

            if let Some(unparker) = &self.unparker {
                unparker.unpark();
            }

            if let (Some(filled), true) = (filled, had_data) {
                filled.set();
            }
            Ok(())
        } else {
            if chunk.is_empty() {
                return Ok(());
            }
            let (_, full) = {
                let _write = self.inner.write_lock.lock();
                self.inner.write_chunk(chunk)?
            };
            if let (Some(filled), true) = (filled, full) {
                filled.set();
            }
            Ok(())
        }
    }

    fn push_to_queue(&self, chunk: &mut SampleChunk) -> DeviceResult<()> {
        if self.inner.exit.load(Ordering::Acquire) {
            return Err(DeviceError::FeederStopped);
        }

        if chunk.is_empty() {
            return Ok(());
        }

        let limit = time_to_frames(self.inner.config.max_buffered, self.inner.device.sample_rate());
        let frames = chunk.frame_count();

        let mut queue = self.inner.queue.lock();
        if queue.frames > limit {
            drop(queue);
            chunk.take();
            self.inner.stats.record_drop(frames);
            log::debug!("Pending queue full, dropped {} frames", frames);
            return Ok(());
        }

        queue.frames += frames as u64;
        queue.chunks.push_back(chunk.take());
        self.inner.stats.record_queue_level(queue.frames);
        Ok(())
    }

    /// 设备时钟报告的播放位置
    pub fn position(&self) -> DeviceResult<RefTime> {
        self.inner.position()
    }

    /// 已写入设备的总时长
    pub fn end(&self) -> RefTime {
        self.inner.end()
    }

    /// 已插入静音的总时长
    pub fn silence(&self) -> RefTime {
        frames_to_time(
            self.inner.silence_frames.load(Ordering::Relaxed),
            self.inner.device.sample_rate(),
        )
    }

    /// 待投喂队列中的帧数（含投喂线程正在写入的块）
    pub fn buffered_frames(&self) -> u64 {
        self.inner.queue.lock().frames
    }

    /// 所有已推送数据全部写入设备后的结束时间
    pub fn expected_end(&self) -> RefTime {
        let frames = self.inner.pushed_frames.load(Ordering::Relaxed) + self.buffered_frames();
        frames_to_time(frames, self.inner.device.sample_rate())
    }

    pub fn start(&self) -> DeviceResult<()> {
        self.inner.device.backend().start()
    }

    pub fn stop(&self) -> DeviceResult<()> {
        self.inner.device.backend().stop()
    }

    /// 丢弃设备和队列中的所有数据，计数清零
    ///
    /// 等待投喂线程正在进行的写入完成；返回后旧数据不会再写进设备。
    pub fn reset(&self) -> DeviceResult<()> {
        {
            let _write = self.inner.write_lock.lock();
            self.inner.device.backend().reset()?;
            self.inner.pushed_frames.store(0, Ordering::Relaxed);
            self.inner.silence_frames.store(0, Ordering::Relaxed);

            if self.is_realtime() {
                let mut queue = self.inner.queue.lock();
                queue.chunks.clear();
                queue.frames = 0;
                queue.generation += 1;
            }
        }

        if let Some(unparker) = &self.unparker {
            unparker.unpark();
        }
        Ok(())
    }

    pub fn stats(&self) -> StatsReport {
        self.inner.stats.report(self.inner.device.sample_rate())
    }
}

impl Drop for DeviceFeeder {
    fn drop(&mut self) {
        self.inner.exit.store(true, Ordering::Release);
        if let Some(unparker) = &self.unparker {
            unparker.unpark();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Device feeding thread panicked");
            }
        }

        if !thread::panicking() {
            assert_eq!(
                Arc::strong_count(&self.inner),
                1,
                "device feeder state outlived its feeder"
            );
            assert!(
                self.inner.device.is_unique(),
                "device handle is still referenced after its feeder was dropped"
            );
        }
    }
}

impl FeederInner {
    fn position(&self) -> DeviceResult<RefTime> {
        self.device.clock().time()
    }

    fn end(&self) -> RefTime {
        frames_to_time(
            self.pushed_frames.load(Ordering::Relaxed),
            self.device.sample_rate(),
        )
    }

    /// 写入设备当前能容纳的帧，返回 (写入帧数, 缓冲区是否已满)
    fn write_chunk(&self, chunk: &mut SampleChunk) -> DeviceResult<(u32, bool)> {
        let backend = self.device.backend();
        let buffer_frames = backend.buffer_size()?;
        let padding = backend.current_padding()?;

        let room = buffer_frames.saturating_sub(padding);
        let frames = room.min(chunk.frame_count().min(u32::MAX as usize) as u32);

        if frames > 0 {
            debug_assert_eq!(chunk.frame_size(), self.device.wave_format.block_align());
            let bytes = frames as usize * chunk.frame_size();
            backend.write(frames, WriteSource::Data(&chunk.data()[..bytes]))?;
            chunk.shrink_head(frames as usize);
            self.pushed_frames
                .fetch_add(frames as u64, Ordering::Relaxed);
            self.stats.record_write(frames, chunk.frame_count());
        }

        Ok((frames, padding + frames >= buffer_frames))
    }

    /// 写入最多 `frames` 帧静音，返回实际写入帧数
    fn write_silence(&self, frames: u32) -> DeviceResult<u32> {
        let backend = self.device.backend();
        let buffer_frames = backend.buffer_size()?;
        let padding = backend.current_padding()?;

        let frames = buffer_frames.saturating_sub(padding).min(frames);
        if frames == 0 {
            return Ok(0);
        }

        backend.write(frames, WriteSource::Silence)?;
        self.pushed_frames
            .fetch_add(frames as u64, Ordering::Relaxed);
        self.silence_frames
            .fetch_add(frames as u64, Ordering::Relaxed);
        self.stats.record_silence(frames);

        log::debug!(
            "Pushed {:.2} ms of silence",
            frames as f64 * 1000.0 / self.device.sample_rate() as f64
        );
        Ok(frames)
    }

    /// 队列为空时：设备剩余数据不足以覆盖延迟就补静音
    fn feed_silence(&self) -> DeviceResult<()> {
        let _write = self.write_lock.lock();
        let latency = self.device.backend().stream_latency()? + self.config.silence_guard;
        let remaining = self.end() - self.position()?;

        if remaining < latency {
            let frames = time_to_frames(latency - remaining, self.device.sample_rate());
            self.write_silence(frames.min(u32::MAX as u64) as u32)?;
        }
        Ok(())
    }

    /// 写入一个待投喂块，剩余部分放回队首
    ///
    /// 块在写入期间仍计入队列帧数，写入成功的部分才扣除。
    /// 取出之后发生过 reset 的块直接丢弃。
    fn feed_chunk(&self, mut chunk: SampleChunk, generation: u64) -> DeviceResult<()> {
        let _write = self.write_lock.lock();
        if self.queue.lock().generation != generation {
            return Ok(());
        }

        let before = chunk.frame_count();
        let result = self.write_chunk(&mut chunk);

        let mut queue = self.queue.lock();
        if queue.generation == generation {
            queue.frames -= (before - chunk.frame_count()) as u64;
            if !chunk.is_empty() {
                queue.chunks.push_front(chunk);
            }
        }
        result.map(|_| ())
    }

    fn feed_loop(&self, parker: Parker) {
        set_feeding_thread_priority();

        while !self.exit.load(Ordering::Acquire) {
            let (chunk, generation) = {
                let mut queue = self.queue.lock();
                (queue.chunks.pop_front(), queue.generation)
            };

            let result = match chunk {
                Some(chunk) => self.feed_chunk(chunk, generation),
                None => self.feed_silence(),
            };

            if let Err(e) = result {
                self.exit.store(true, Ordering::Release);
                log::error!(
                    "Device feeding thread for '{}' stopped: {}",
                    self.device.friendly_name,
                    e
                );
                break;
            }

            parker.park_timeout(self.config.wake_interval);
        }
    }
}

/// 提高投喂线程优先级（失败时保持默认调度）
#[cfg(unix)]
fn set_feeding_thread_priority() {
    // SAFETY: setpriority 只影响调用线程自身的调度参数
    let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, -10) };
    if result != 0 {
        log::debug!("Failed to raise feeding thread priority, using default scheduling");
    }
}

#[cfg(not(unix))]
fn set_feeding_thread_priority() {}
