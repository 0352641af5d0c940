//! 样本块：在途音频数据
//!
//! 一块交织样本 + {格式, 声道数, 采样率}。
//!
//! 两种存储：
//! - Owned：独占的缓冲区
//! - Shared：借用宿主的样本内存（Arc 保证生命周期），首次可变访问时才复制
//!
//! 可见数据是存储上的一个窗口 `[offset, offset + len)`，
//! 截断和丢弃头部帧只移动窗口，从不重新分配。

use std::sync::Arc;

use super::error::ChunkError;
use super::format::{convert_samples, unpack_pcm24, DspFormat, WaveFormat};

enum Storage {
    Owned(Vec<u8>),
    Shared(Arc<[u8]>),
}

/// 在途样本块
///
/// 不实现 Clone：样本块只移动，不复制。用 [`SampleChunk::take`] 转移所有权。
pub struct SampleChunk {
    format: DspFormat,
    channels: u32,
    rate: u32,
    storage: Storage,
    offset: usize,
    len: usize,
}

/// 分配零填充缓冲区，分配失败返回错误而不是中止
fn try_zeroed(bytes: usize) -> Result<Vec<u8>, ChunkError> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(bytes)
        .map_err(|_| ChunkError::Alloc { bytes })?;
    buffer.resize(bytes, 0);
    Ok(buffer)
}

impl Default for SampleChunk {
    fn default() -> Self {
        Self {
            format: DspFormat::Pcm16,
            channels: 1,
            rate: 1,
            storage: Storage::Owned(Vec::new()),
            offset: 0,
            len: 0,
        }
    }
}

impl SampleChunk {
    /// 分配指定帧数的零填充样本块
    pub fn new(format: DspFormat, channels: u32, frames: usize, rate: u32) -> Result<Self, ChunkError> {
        let bytes = format.sample_size() * channels as usize * frames;
        let buffer = try_zeroed(bytes)?;
        Ok(Self {
            format,
            channels,
            rate,
            storage: Storage::Owned(buffer),
            offset: 0,
            len: bytes,
        })
    }

    /// 静音块（零字节对所有六种格式都是静音）
    #[inline]
    pub fn silence(format: DspFormat, channels: u32, frames: usize, rate: u32) -> Result<Self, ChunkError> {
        Self::new(format, channels, frames, rate)
    }

    /// 包装宿主样本内存，不复制
    ///
    /// - 3 字节紧凑 24-bit 源在这里立即解包为 4 字节 Pcm24，
    ///   不规则步长无法延迟处理
    /// - 非 PCM 源（bitstreaming）按字节帧保存：Pcm8 格式、
    ///   每帧 `block_align` 个"声道"，从不做格式转换
    /// - 不完整的尾帧被截掉，保证长度是帧大小的整数倍
    pub fn from_source(
        source: Arc<[u8]>,
        byte_len: usize,
        source_format: &WaveFormat,
    ) -> Result<Self, ChunkError> {
        let byte_len = byte_len.min(source.len());

        let (format, channels) = match DspFormat::from_wave_format(source_format) {
            Some(format) => (format, source_format.channels as u32),
            None => (DspFormat::Pcm8, source_format.block_align().max(1) as u32),
        };

        if source_format.is_packed_24() {
            let channels = channels.max(1) as usize;
            let frames = byte_len / (3 * channels);
            let samples = frames * channels;
            let mut buffer = try_zeroed(samples * 4)?;
            unpack_pcm24(&source[..samples * 3], &mut buffer);
            return Ok(Self {
                format,
                channels: channels as u32,
                rate: source_format.sample_rate,
                storage: Storage::Owned(buffer),
                offset: 0,
                len: samples * 4,
            });
        }

        let frame_size = format.sample_size() * channels.max(1) as usize;
        Ok(Self {
            format,
            channels,
            rate: source_format.sample_rate,
            storage: Storage::Shared(source),
            offset: 0,
            len: byte_len - byte_len % frame_size,
        })
    }

    /// 从已有字节构造独占样本块（长度按帧截断）
    pub fn from_bytes(format: DspFormat, channels: u32, rate: u32, mut bytes: Vec<u8>) -> Self {
        let frame_size = format.sample_size() * channels.max(1) as usize;
        bytes.truncate(bytes.len() - bytes.len() % frame_size);
        let len = bytes.len();
        Self {
            format,
            channels,
            rate,
            storage: Storage::Owned(bytes),
            offset: 0,
            len,
        }
    }

    /// 转移所有权，原对象变为空块
    #[inline]
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    #[inline]
    pub fn format(&self) -> DspFormat {
        self.format
    }

    #[inline]
    pub fn channel_count(&self) -> u32 {
        self.channels
    }

    #[inline]
    pub fn rate(&self) -> u32 {
        self.rate
    }

    #[inline]
    pub fn format_size(&self) -> usize {
        self.format.sample_size()
    }

    #[inline]
    pub fn frame_size(&self) -> usize {
        self.format.sample_size() * self.channels as usize
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        match self.frame_size() {
            0 => 0,
            size => self.len / size,
        }
    }

    #[inline]
    pub fn sample_count(&self) -> usize {
        self.len / self.format.sample_size()
    }

    #[inline]
    pub fn byte_len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 是否仍在借用宿主内存
    #[inline]
    pub fn is_shared(&self) -> bool {
        matches!(self.storage, Storage::Shared(_))
    }

    /// 只读访问，不触发复制
    #[inline]
    pub fn data(&self) -> &[u8] {
        let range = self.offset..self.offset + self.len;
        match &self.storage {
            Storage::Owned(buffer) => &buffer[range],
            Storage::Shared(source) => &source[range],
        }
    }

    /// 可变访问：借用状态下先复制到独占缓冲区
    pub fn data_mut(&mut self) -> Result<&mut [u8], ChunkError> {
        self.materialize()?;
        let range = self.offset..self.offset + self.len;
        match &mut self.storage {
            Storage::Owned(buffer) => Ok(&mut buffer[range]),
            Storage::Shared(_) => unreachable!("materialize leaves owned storage"),
        }
    }

    fn materialize(&mut self) -> Result<(), ChunkError> {
        if let Storage::Shared(source) = &self.storage {
            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(self.len)
                .map_err(|_| ChunkError::Alloc { bytes: self.len })?;
            buffer.extend_from_slice(&source[self.offset..self.offset + self.len]);
            self.storage = Storage::Owned(buffer);
            self.offset = 0;
        }
        Ok(())
    }

    /// 转换到目标格式
    ///
    /// 同格式或空块是 no-op；否则整块转换到新分配的缓冲区。
    /// Pcm8 只能作为源格式，不允许作为目标。
    pub fn convert_to(&mut self, target: DspFormat) -> Result<(), ChunkError> {
        if target == DspFormat::Pcm8 {
            return Err(ChunkError::UnsupportedTarget(target));
        }

        if self.is_empty() || target == self.format {
            return Ok(());
        }

        let mut output = try_zeroed(self.sample_count() * target.sample_size())?;
        convert_samples(self.format, self.data(), target, &mut output);

        let len = output.len();
        self.format = target;
        self.storage = Storage::Owned(output);
        self.offset = 0;
        self.len = len;
        Ok(())
    }

    /// 截断到 `frames` 帧（只缩不扩，不重新分配）
    pub fn shrink_to_frames(&mut self, frames: usize) {
        if frames < self.frame_count() {
            self.len = frames * self.frame_size();
        }
    }

    /// 丢弃开头的 `frames` 帧，保留其余部分
    pub fn shrink_head(&mut self, frames: usize) {
        let frames = frames.min(self.frame_count());
        let bytes = frames * self.frame_size();
        self.offset += bytes;
        self.len -= bytes;
    }

    /// 在开头插入 `frames` 帧静音
    pub fn pad_head(&mut self, frames: usize) -> Result<(), ChunkError> {
        if frames == 0 {
            return Ok(());
        }
        let pad = frames * self.frame_size();
        let mut buffer = try_zeroed(pad + self.len)?;
        buffer[pad..].copy_from_slice(self.data());
        self.storage = Storage::Owned(buffer);
        self.offset = 0;
        self.len += pad;
        Ok(())
    }

    /// 逐样本变换浮点数据
    ///
    /// 非浮点块先转换为 Float。
    pub fn map_samples_f64<F>(&mut self, mut f: F) -> Result<(), ChunkError>
    where
        F: FnMut(f64) -> f64,
    {
        if !self.format.is_float() {
            self.convert_to(DspFormat::Float)?;
        }

        let format = self.format;
        let data = self.data_mut()?;
        match format {
            DspFormat::Float => {
                for bytes in data.chunks_exact_mut(4) {
                    let v = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                    bytes.copy_from_slice(&(f(v as f64) as f32).to_le_bytes());
                }
            }
            _ => {
                for bytes in data.chunks_exact_mut(8) {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(bytes);
                    bytes.copy_from_slice(&f(f64::from_le_bytes(raw)).to_le_bytes());
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SampleChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleChunk")
            .field("format", &self.format)
            .field("channels", &self.channels)
            .field("rate", &self.rate)
            .field("frames", &self.frame_count())
            .field("shared", &self.is_shared())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 按格式把整数样本写成字节
    fn int_chunk(format: DspFormat, channels: u32, samples: &[i32]) -> SampleChunk {
        let mut bytes = Vec::new();
        for &s in samples {
            match format {
                DspFormat::Pcm8 => bytes.push(s as i8 as u8),
                DspFormat::Pcm16 => bytes.extend_from_slice(&(s as i16).to_le_bytes()),
                _ => bytes.extend_from_slice(&s.to_le_bytes()),
            }
        }
        SampleChunk::from_bytes(format, channels, 48000, bytes)
    }

    /// 覆盖极值、零、正负交替的测试样本
    fn test_samples(format: DspFormat) -> Vec<i32> {
        let bits = format.bits();
        let max = ((1i64 << (bits - 1)) - 1) as i32;
        let min = (-(1i64 << (bits - 1))) as i32;
        let mut v = vec![0, 1, -1, max, min, max / 3, min / 7];
        for i in 0..64 {
            let x = ((i * 2_654_435_761u64 as i64) % (max as i64)) as i32;
            v.push(if i % 2 == 0 { x } else { -x });
        }
        v
    }

    #[test]
    fn test_roundtrip_through_wider_formats() {
        for from in [DspFormat::Pcm16, DspFormat::Pcm24, DspFormat::Pcm32] {
            let samples = test_samples(from);
            let original = int_chunk(from, 1, &samples);

            for via in DspFormat::ALL {
                let wider = match via {
                    DspFormat::Double => true,
                    // f32 尾数 24 位，只对 ≤24-bit 无损
                    DspFormat::Float => from.bits() <= 24,
                    DspFormat::Pcm8 => false,
                    _ => via.bits() > from.bits(),
                };
                if !wider {
                    continue;
                }

                let mut chunk = int_chunk(from, 1, &samples);
                chunk.convert_to(via).unwrap();
                assert_eq!(chunk.format(), via);
                chunk.convert_to(from).unwrap();
                assert_eq!(chunk.data(), original.data(), "{} -> {} -> {}", from, via, from);
            }
        }
    }

    #[test]
    fn test_pcm8_source_widens_exactly() {
        let samples = test_samples(DspFormat::Pcm8);
        let mut chunk = int_chunk(DspFormat::Pcm8, 1, &samples);
        chunk.convert_to(DspFormat::Pcm16).unwrap();

        let expected = int_chunk(
            DspFormat::Pcm16,
            1,
            &samples.iter().map(|s| s << 8).collect::<Vec<_>>(),
        );
        assert_eq!(chunk.data(), expected.data());
    }

    #[test]
    fn test_convert_to_pcm8_rejected() {
        let mut chunk = int_chunk(DspFormat::Pcm16, 1, &[1, 2, 3]);
        assert_eq!(
            chunk.convert_to(DspFormat::Pcm8),
            Err(ChunkError::UnsupportedTarget(DspFormat::Pcm8))
        );
        assert_eq!(chunk.format(), DspFormat::Pcm16);
    }

    #[test]
    fn test_convert_same_format_is_noop() {
        let source: Arc<[u8]> = Arc::from(vec![1u8, 2, 3, 4, 5, 6, 7, 8]);
        let format = WaveFormat::pcm(44100, 2, 16);
        let mut chunk = SampleChunk::from_source(source.clone(), 8, &format).unwrap();

        chunk.convert_to(DspFormat::Pcm16).unwrap();
        assert!(chunk.is_shared(), "same-format conversion must not copy");
        assert_eq!(chunk.data(), &source[..]);
    }

    #[test]
    fn test_shrink_keeps_prefix() {
        for frames in 0..12usize {
            for target in 0..=frames {
                let samples: Vec<i32> = (0..frames as i32 * 2).collect();
                let mut chunk = int_chunk(DspFormat::Pcm16, 2, &samples);
                let before = chunk.data().to_vec();

                chunk.shrink_to_frames(target);
                assert_eq!(chunk.frame_count(), target);
                assert_eq!(chunk.data(), &before[..target * 4]);
            }
        }
    }

    #[test]
    fn test_shrink_never_grows() {
        let mut chunk = int_chunk(DspFormat::Pcm32, 1, &[1, 2, 3]);
        chunk.shrink_to_frames(10);
        assert_eq!(chunk.frame_count(), 3);
    }

    #[test]
    fn test_shrink_head_keeps_tail() {
        let mut chunk = int_chunk(DspFormat::Pcm16, 1, &[10, 20, 30, 40]);
        chunk.shrink_head(3);
        assert_eq!(chunk.frame_count(), 1);
        assert_eq!(chunk.data(), &40i16.to_le_bytes());

        chunk.shrink_head(5);
        assert!(chunk.is_empty());
    }

    #[test]
    fn test_deferred_copy() {
        let source: Arc<[u8]> = Arc::from(vec![0u8, 1, 2, 3, 4, 5, 6, 7]);
        let format = WaveFormat::pcm(48000, 1, 16);
        let mut chunk = SampleChunk::from_source(source.clone(), 8, &format).unwrap();

        // 只读不复制
        assert!(chunk.is_shared());
        assert_eq!(chunk.frame_count(), 4);
        assert_eq!(chunk.data()[2], 2);
        assert!(chunk.is_shared());

        // 截断也不复制
        chunk.shrink_to_frames(3);
        assert!(chunk.is_shared());

        // 首次写访问复制
        chunk.data_mut().unwrap()[0] = 0xAA;
        assert!(!chunk.is_shared());
        assert_eq!(chunk.data(), &[0xAA, 1, 2, 3, 4, 5]);
        assert_eq!(source[0], 0, "source must stay untouched");
    }

    #[test]
    fn test_from_source_unpacks_24bit_immediately() {
        let packed: Arc<[u8]> = Arc::from(vec![0xFF, 0xFF, 0x7F, 0x00, 0x00, 0x80, 0x01]);
        let format = WaveFormat::pcm(96000, 1, 24);
        let chunk = SampleChunk::from_source(packed, 7, &format).unwrap();

        assert!(!chunk.is_shared());
        assert_eq!(chunk.format(), DspFormat::Pcm24);
        assert_eq!(chunk.frame_count(), 2);
        assert_eq!(&chunk.data()[..4], &0x7FFFFFi32.to_le_bytes());
        assert_eq!(&chunk.data()[4..], &(-8388608i32).to_le_bytes());
    }

    #[test]
    fn test_from_source_24_in_32_is_msb_aligned() {
        let format = WaveFormat {
            valid_bits: 24,
            ..WaveFormat::for_dsp(DspFormat::Pcm32, 96000, 1)
        };
        let source: Arc<[u8]> = Arc::from(0x4000_0000i32.to_le_bytes().to_vec());
        let mut chunk = SampleChunk::from_source(source, 4, &format).unwrap();
        assert_eq!(chunk.format(), DspFormat::Pcm32);

        chunk.convert_to(DspFormat::Float).unwrap();
        let v = f32::from_le_bytes(chunk.data().try_into().unwrap());
        assert_eq!(v, 0.5);
    }

    #[test]
    fn test_from_source_truncates_partial_frame() {
        let source: Arc<[u8]> = Arc::from(vec![0u8; 11]);
        let format = WaveFormat::pcm(48000, 2, 16);
        let chunk = SampleChunk::from_source(source, 11, &format).unwrap();
        assert_eq!(chunk.byte_len(), 8);
        assert_eq!(chunk.byte_len() % chunk.frame_size(), 0);
    }

    #[test]
    fn test_take_leaves_empty() {
        let mut chunk = SampleChunk::new(DspFormat::Float, 2, 16, 48000).unwrap();
        let moved = chunk.take();
        assert!(chunk.is_empty());
        assert_eq!(moved.frame_count(), 16);
    }

    #[test]
    fn test_pad_head() {
        let mut chunk = int_chunk(DspFormat::Pcm16, 1, &[7]);
        chunk.pad_head(2).unwrap();
        assert_eq!(chunk.frame_count(), 3);
        assert_eq!(chunk.data(), &[0, 0, 0, 0, 7, 0]);
    }

    #[test]
    fn test_map_samples_converts_to_float() {
        let mut chunk = int_chunk(DspFormat::Pcm16, 1, &[16384, -16384]);
        chunk.map_samples_f64(|v| v * 0.5).unwrap();
        assert_eq!(chunk.format(), DspFormat::Float);

        let values: Vec<f32> = chunk
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(values, vec![0.25, -0.25]);
    }

    #[test]
    fn test_empty_chunk() {
        let chunk = SampleChunk::default();
        assert!(chunk.is_empty());
        assert_eq!(chunk.frame_count(), 0);
        assert_eq!(chunk.data(), &[] as &[u8]);
    }
}
