//! 音频文件解码器
//!
//! 使用 symphonia 库解码，支持：FLAC, WAV, AIFF, MP3
//!
//! 输出交织的小端字节，格式在打开时由第一个数据包决定：
//! - 8/16-bit 整数 → Pcm16
//! - 24/32-bit 整数 → Pcm32（24-bit 左移 8 位，MSB 对齐）
//! - f32/f64 → Float/Double
//!
//! 之后类型不同的数据包会转换到这个格式，保证整条流格式不变。

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::Sample;
use symphonia::core::units::{Time, TimeBase};

use crate::audio::format::convert_samples;
use crate::audio::timing::frames_to_time;
use crate::audio::{DspFormat, WaveFormat};
use crate::renderer::MediaSample;

/// 解码错误
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Unsupported audio format")]
    UnsupportedFormat,

    #[error("No audio track found")]
    NoAudioTrack,

    #[error("Failed to create decoder: {0}")]
    DecoderCreation(String),

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Seek failed: {0}")]
    SeekFailed(String),
}

/// 音频文件信息
#[derive(Debug, Clone)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub channels: u16,
    /// 位深度（原始格式）
    pub bit_depth: Option<u32>,
    /// 总帧数（如果已知）
    pub total_frames: Option<u64>,
    /// 总时长（秒）
    pub duration_secs: Option<f64>,
    /// 格式名称
    pub format: String,
    /// 编解码器名称
    pub codec: String,
}

/// 音频文件解码器
pub struct AudioDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    info: AudioInfo,
    format: WaveFormat,
    dsp_format: DspFormat,
    /// 打开时探测格式读出的第一个包
    pending: Option<Vec<u8>>,
    /// 已输出的帧数
    position: u64,
}

impl AudioDecoder {
    /// 打开音频文件
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DecodeError> {
        let path = path.as_ref();

        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let metadata_opts = MetadataOptions::default();

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &metadata_opts)
            .map_err(|_| DecodeError::UnsupportedFormat)?;

        let mut reader = probed.format;
        // symphonia 的 metadata debug 输出对用户不友好，直接用扩展名
        let format_name = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|s| s.to_uppercase())
            .unwrap_or_else(|| "Unknown".to_string());

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecodeError::NoAudioTrack)?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let sample_rate = codec_params.sample_rate.ok_or(DecodeError::NoAudioTrack)?;
        let total_frames = codec_params.n_frames;

        let codec_name = symphonia::default::get_codecs()
            .get_codec(codec_params.codec)
            .map(|c| c.short_name.to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError::DecoderCreation(e.to_string()))?;

        // 第一个包决定输出格式和声道数
        let (dsp_format, channels, first) =
            read_packet(reader.as_mut(), decoder.as_mut(), track_id)?
                .ok_or(DecodeError::NoAudioTrack)?;

        let info = AudioInfo {
            sample_rate,
            channels,
            bit_depth: codec_params.bits_per_sample,
            total_frames,
            duration_secs: total_frames.map(|f| f as f64 / sample_rate as f64),
            format: format_name,
            codec: codec_name,
        };

        log::debug!("Opened {}: {:?}, output {}", path.display(), info, dsp_format);

        Ok(Self {
            reader,
            decoder,
            track_id,
            time_base: codec_params.time_base,
            info,
            format: WaveFormat::for_dsp(dsp_format, sample_rate, channels),
            dsp_format,
            pending: Some(first),
            position: 0,
        })
    }

    pub fn info(&self) -> &AudioInfo {
        &self.info
    }

    /// 输出样本的格式
    pub fn format(&self) -> WaveFormat {
        self.format
    }

    /// 已输出的帧数
    pub fn position_frames(&self) -> u64 {
        self.position
    }

    /// 解码下一个样本，文件结束返回 None
    ///
    /// 开始时间是已输出帧数对应的流时间
    pub fn next_sample(&mut self) -> Result<Option<MediaSample>, DecodeError> {
        let bytes = match self.pending.take() {
            Some(bytes) => bytes,
            None => match read_packet(self.reader.as_mut(), self.decoder.as_mut(), self.track_id)? {
                None => return Ok(None),
                Some((format, _, bytes)) if format == self.dsp_format => bytes,
                Some((format, _, bytes)) => {
                    let samples = bytes.len() / format.sample_size();
                    let mut converted = vec![0u8; samples * self.dsp_format.sample_size()];
                    convert_samples(format, &bytes, self.dsp_format, &mut converted);
                    converted
                }
            },
        };

        let frames = (bytes.len() / self.format.block_align().max(1)) as u64;
        let start = frames_to_time(self.position, self.format.sample_rate);
        self.position += frames;

        Ok(Some(MediaSample::new(bytes, Some(start))))
    }

    /// Seek 到指定时间（秒）
    pub fn seek(&mut self, time_secs: f64) -> Result<(), DecodeError> {
        let seek_to = SeekTo::Time {
            time: Time::new(time_secs as u64, time_secs.fract()),
            track_id: Some(self.track_id),
        };

        let seeked = self
            .reader
            .seek(SeekMode::Accurate, seek_to)
            .map_err(|e| DecodeError::SeekFailed(e.to_string()))?;

        self.decoder.reset();
        self.pending = None;

        let actual_secs = match self.time_base {
            Some(tb) => {
                let time = tb.calc_time(seeked.actual_ts);
                time.seconds as f64 + time.frac
            }
            None => time_secs,
        };
        self.position = (actual_secs * self.format.sample_rate as f64) as u64;
        Ok(())
    }
}

/// 读取并解码目标轨道的下一个非空包
///
/// 返回 (包的自然格式, 声道数, 交织字节)
fn read_packet(
    reader: &mut dyn FormatReader,
    decoder: &mut dyn Decoder,
    track_id: u32,
) -> Result<Option<(DspFormat, u16, Vec<u8>)>, DecodeError> {
    loop {
        let packet = match reader.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            // 跳过损坏的帧
            Err(SymphoniaError::DecodeError(e)) => {
                log::debug!("Skipping corrupt packet: {}", e);
                continue;
            }
            Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
        };

        if decoded.frames() == 0 {
            continue;
        }

        let channels = decoded.spec().channels.count() as u16;
        let (format, bytes) = interleave_packet(&decoded);
        return Ok(Some((format, channels, bytes)));
    }
}

/// 按包的样本类型交织成字节；无符号类型先去掉直流偏置
fn interleave_packet(decoded: &AudioBufferRef<'_>) -> (DspFormat, Vec<u8>) {
    match decoded {
        AudioBufferRef::U8(buf) => (
            DspFormat::Pcm16,
            interleave(&**buf, |v: u8| (((v as i16) - 0x80) << 8).to_le_bytes()),
        ),
        AudioBufferRef::S8(buf) => (
            DspFormat::Pcm16,
            interleave(&**buf, |v: i8| ((v as i16) << 8).to_le_bytes()),
        ),
        AudioBufferRef::U16(buf) => (
            DspFormat::Pcm16,
            interleave(&**buf, |v: u16| ((v as i32 - 0x8000) as i16).to_le_bytes()),
        ),
        AudioBufferRef::S16(buf) => (DspFormat::Pcm16, interleave(&**buf, |v: i16| v.to_le_bytes())),
        AudioBufferRef::U24(buf) => (
            DspFormat::Pcm32,
            interleave(&**buf, |v| ((v.inner() as i32 - 0x80_0000) << 8).to_le_bytes()),
        ),
        AudioBufferRef::S24(buf) => (DspFormat::Pcm32, interleave(&**buf, |v| (v.inner() << 8).to_le_bytes())),
        AudioBufferRef::U32(buf) => (
            DspFormat::Pcm32,
            interleave(&**buf, |v: u32| ((v as i64 - 0x8000_0000) as i32).to_le_bytes()),
        ),
        AudioBufferRef::S32(buf) => (DspFormat::Pcm32, interleave(&**buf, |v: i32| v.to_le_bytes())),
        AudioBufferRef::F32(buf) => (DspFormat::Float, interleave(&**buf, |v: f32| v.to_le_bytes())),
        AudioBufferRef::F64(buf) => (DspFormat::Double, interleave(&**buf, |v: f64| v.to_le_bytes())),
    }
}

#[inline]
fn interleave<S: Sample, const N: usize>(buf: &AudioBuffer<S>, encode: impl Fn(S) -> [u8; N]) -> Vec<u8> {
    let channels = buf.spec().channels.count();
    let frames = buf.frames();

    let mut out = Vec::with_capacity(frames * channels * N);
    for frame in 0..frames {
        for ch in 0..channels {
            out.extend_from_slice(&encode(buf.chan(ch)[frame]));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ONE_SECOND;
    use std::path::PathBuf;

    /// 在临时目录写一个最小 WAV 文件
    fn write_wav(name: &str, channels: u16, rate: u32, bits: u16, data: &[u8]) -> PathBuf {
        let block_align = channels * bits / 8;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data.len() as u32).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&rate.to_le_bytes());
        bytes.extend_from_slice(&(rate * block_align as u32).to_le_bytes());
        bytes.extend_from_slice(&block_align.to_le_bytes());
        bytes.extend_from_slice(&bits.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
        bytes.extend_from_slice(data);

        let path = std::env::temp_dir().join(format!(
            "roger-renderer-{}-{}.wav",
            name,
            std::process::id()
        ));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn decode_all(decoder: &mut AudioDecoder) -> (Vec<u8>, Vec<MediaSample>) {
        let mut data = Vec::new();
        let mut samples = Vec::new();
        while let Some(sample) = decoder.next_sample().unwrap() {
            data.extend_from_slice(&sample.data);
            samples.push(sample);
        }
        (data, samples)
    }

    #[test]
    fn test_decode_pcm16_wav() {
        let pcm: Vec<u8> = (0..4800i16)
            .flat_map(|i| [i, -i])
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let path = write_wav("pcm16", 2, 48000, 16, &pcm);

        let mut decoder = AudioDecoder::open(&path).unwrap();
        assert_eq!(decoder.info().sample_rate, 48000);
        assert_eq!(decoder.info().channels, 2);
        assert_eq!(DspFormat::from_wave_format(&decoder.format()), Some(DspFormat::Pcm16));

        let (data, samples) = decode_all(&mut decoder);
        assert_eq!(data, pcm);
        assert_eq!(decoder.position_frames(), 4800);

        // 时间戳连续
        let mut frames = 0u64;
        for sample in &samples {
            assert_eq!(sample.start, Some(frames_to_time(frames, 48000)));
            frames += (sample.data.len() / 4) as u64;
        }
        assert_eq!(frames_to_time(frames, 48000), ONE_SECOND / 10);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_decode_pcm24_is_msb_aligned() {
        let values = [0i32, 1, -1, 0x7F_FFFF, -0x80_0000, 12345];
        let packed: Vec<u8> = values
            .iter()
            .flat_map(|v| {
                let b = v.to_le_bytes();
                [b[0], b[1], b[2]]
            })
            .collect();
        let path = write_wav("pcm24", 1, 44100, 24, &packed);

        let mut decoder = AudioDecoder::open(&path).unwrap();
        assert_eq!(DspFormat::from_wave_format(&decoder.format()), Some(DspFormat::Pcm32));

        let (data, _) = decode_all(&mut decoder);
        let decoded: Vec<i32> = data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let expected: Vec<i32> = values.iter().map(|v| v << 8).collect();
        assert_eq!(decoded, expected);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_decode_pcm8_widens_to_pcm16() {
        let path = write_wav("pcm8", 1, 8000, 8, &[0x80, 0xFF, 0x00]);

        let mut decoder = AudioDecoder::open(&path).unwrap();
        assert_eq!(DspFormat::from_wave_format(&decoder.format()), Some(DspFormat::Pcm16));

        let (data, _) = decode_all(&mut decoder);
        let decoded: Vec<i16> = data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(decoded, vec![0, 0x7F00, -0x8000]);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_missing_file() {
        let result = AudioDecoder::open("/nonexistent/roger-renderer.wav");
        assert!(matches!(result, Err(DecodeError::FileOpen(_))));
    }
}
