//! 样本格式与格式转换规则
//!
//! 六种内部样本编码：8/16/24/32-bit 有符号整数、32-bit 浮点、64-bit 浮点。
//! 内存表示：
//! - Pcm24 占 4 字节，数值在低 24 位，符号扩展到 32 位；
//!   只在内部使用，外部 32-bit 容器（含 24 位有效位）一律是 MSB 对齐的 Pcm32
//! - 所有样本均为 little-endian
//!
//! 转换规则（36 种组合由同一组规则生成，不逐对手写）：
//! - 整数 → 更宽整数：算术左移位宽差
//! - 整数 → 更窄整数：算术右移位宽差
//! - 整数 → 浮点：除以 |MIN|，即 2^(n-1)
//! - 浮点 → 整数：乘以 |MIN|，饱和截断到目标范围
//! - 浮点 → 浮点：直接转换

/// 内部样本格式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DspFormat {
    Pcm8,
    Pcm16,
    Pcm24,
    Pcm32,
    Float,
    Double,
}

impl DspFormat {
    /// 全部六种格式，按位宽递增
    pub const ALL: [DspFormat; 6] = [
        DspFormat::Pcm8,
        DspFormat::Pcm16,
        DspFormat::Pcm24,
        DspFormat::Pcm32,
        DspFormat::Float,
        DspFormat::Double,
    ];

    /// 每样本在内存中占用的字节数
    #[inline]
    pub fn sample_size(self) -> usize {
        match self {
            Self::Pcm8 => 1,
            Self::Pcm16 => 2,
            Self::Double => 8,
            _ => 4,
        }
    }

    /// 有效位宽
    #[inline]
    pub fn bits(self) -> u32 {
        match self {
            Self::Pcm8 => 8,
            Self::Pcm16 => 16,
            Self::Pcm24 => 24,
            Self::Pcm32 | Self::Float => 32,
            Self::Double => 64,
        }
    }

    #[inline]
    pub fn is_float(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Pcm8 => "pcm8",
            Self::Pcm16 => "pcm16",
            Self::Pcm24 => "pcm24",
            Self::Pcm32 => "pcm32",
            Self::Float => "float",
            Self::Double => "double",
        }
    }

    /// 整数格式的归一化系数 |MIN| = 2^(bits-1)
    #[inline]
    fn int_scale(self) -> f64 {
        (1u64 << (self.bits() - 1)) as f64
    }

    /// 从 wave format 描述推导内部格式
    ///
    /// 无法识别（压缩格式、非常规位深）时返回 None，
    /// 这类格式只能走 bitstreaming 直通。
    pub fn from_wave_format(format: &WaveFormat) -> Option<Self> {
        let kind = match format.tag {
            FormatTag::Pcm | FormatTag::Extensible(SubFormat::Pcm) => SubFormat::Pcm,
            FormatTag::IeeeFloat | FormatTag::Extensible(SubFormat::IeeeFloat) => {
                SubFormat::IeeeFloat
            }
            _ => return None,
        };

        match (kind, format.bits_per_sample, format.valid_bits) {
            (SubFormat::Pcm, 8, _) => Some(Self::Pcm8),
            (SubFormat::Pcm, 16, _) => Some(Self::Pcm16),
            (SubFormat::Pcm, 24, _) => Some(Self::Pcm24),
            (SubFormat::Pcm, 32, _) => Some(Self::Pcm32),
            (SubFormat::IeeeFloat, 32, _) => Some(Self::Float),
            (SubFormat::IeeeFloat, 64, _) => Some(Self::Double),
            _ => None,
        }
    }
}

impl std::fmt::Display for DspFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Extensible 格式的子类型
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubFormat {
    Pcm,
    IeeeFloat,
    Other,
}

/// 格式标签
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatTag {
    Pcm,
    IeeeFloat,
    Extensible(SubFormat),
    /// 压缩/编码格式（AC3、DTS 等），只能直通
    Other(u16),
}

/// 流格式描述
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaveFormat {
    pub tag: FormatTag,
    pub channels: u16,
    pub sample_rate: u32,
    /// 容器位宽
    pub bits_per_sample: u16,
    /// 有效位宽（24-in-32 时为 24）
    pub valid_bits: u16,
    pub channel_mask: u32,
}

impl WaveFormat {
    /// 整数 PCM 格式
    pub fn pcm(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            tag: FormatTag::Pcm,
            channels,
            sample_rate,
            bits_per_sample,
            valid_bits: bits_per_sample,
            channel_mask: default_channel_mask(channels),
        }
    }

    /// IEEE 浮点格式
    pub fn float(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            tag: FormatTag::IeeeFloat,
            channels,
            sample_rate,
            bits_per_sample,
            valid_bits: bits_per_sample,
            channel_mask: default_channel_mask(channels),
        }
    }

    /// 设备端格式：按内部格式生成
    ///
    /// Pcm24 描述为 MSB 对齐的 4 字节容器（有效位 24），解析回来是 Pcm32，
    /// 写入前数据要先转换到 Pcm32。
    pub fn for_dsp(format: DspFormat, sample_rate: u32, channels: u16) -> Self {
        let bits = (format.sample_size() * 8) as u16;
        let sub = if format.is_float() {
            SubFormat::IeeeFloat
        } else {
            SubFormat::Pcm
        };
        Self {
            tag: FormatTag::Extensible(sub),
            channels,
            sample_rate,
            bits_per_sample: bits,
            valid_bits: format.bits().min(bits as u32) as u16,
            channel_mask: default_channel_mask(channels),
        }
    }

    /// 每帧字节数（紧凑布局）
    #[inline]
    pub fn block_align(&self) -> usize {
        self.bits_per_sample as usize / 8 * self.channels as usize
    }

    #[inline]
    pub fn bytes_per_second(&self) -> usize {
        self.block_align() * self.sample_rate as usize
    }

    /// 是否为可直接做 DSP 的 PCM/浮点格式
    #[inline]
    pub fn is_pcm(&self) -> bool {
        DspFormat::from_wave_format(self).is_some()
    }

    /// 源数据是否为 3 字节紧凑 24-bit
    #[inline]
    pub fn is_packed_24(&self) -> bool {
        self.bits_per_sample == 24 && DspFormat::from_wave_format(self) == Some(DspFormat::Pcm24)
    }
}

/// 常见声道数对应的默认声道掩码
pub fn default_channel_mask(channels: u16) -> u32 {
    match channels {
        1 => 0x4,   // FC
        2 => 0x3,   // FL FR
        4 => 0x33,  // FL FR BL BR
        6 => 0x3F,  // 5.1
        8 => 0x63F, // 7.1
        n => (1u32 << n.min(31)) - 1,
    }
}

/// 单个样本的中间值
///
/// 整数保存在源格式自身的位宽内（Pcm16 范围就是 i16 范围）
#[derive(Clone, Copy, Debug, PartialEq)]
enum SampleValue {
    Int(i32),
    Float(f64),
}

#[inline]
fn read_sample(format: DspFormat, bytes: &[u8]) -> SampleValue {
    match format {
        DspFormat::Pcm8 => SampleValue::Int(bytes[0] as i8 as i32),
        DspFormat::Pcm16 => SampleValue::Int(i16::from_le_bytes([bytes[0], bytes[1]]) as i32),
        DspFormat::Pcm24 | DspFormat::Pcm32 => {
            SampleValue::Int(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
        DspFormat::Float => {
            SampleValue::Float(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64)
        }
        DspFormat::Double => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[..8]);
            SampleValue::Float(f64::from_le_bytes(raw))
        }
    }
}

#[inline]
fn write_sample(format: DspFormat, value: SampleValue, out: &mut [u8]) {
    match (format, value) {
        (DspFormat::Pcm8, SampleValue::Int(v)) => out[0] = v as i8 as u8,
        (DspFormat::Pcm16, SampleValue::Int(v)) => out[..2].copy_from_slice(&(v as i16).to_le_bytes()),
        (DspFormat::Pcm24 | DspFormat::Pcm32, SampleValue::Int(v)) => {
            out[..4].copy_from_slice(&v.to_le_bytes())
        }
        (DspFormat::Float, SampleValue::Float(v)) => out[..4].copy_from_slice(&(v as f32).to_le_bytes()),
        (DspFormat::Double, SampleValue::Float(v)) => out[..8].copy_from_slice(&v.to_le_bytes()),
        // convert_sample 保证值类型与目标格式一致
        _ => unreachable!("sample value does not match {format}"),
    }
}

/// 按规则把一个样本从 `from` 转换到 `to`
#[inline]
fn convert_sample(from: DspFormat, to: DspFormat, value: SampleValue) -> SampleValue {
    match (value, to.is_float()) {
        (SampleValue::Int(v), false) => {
            let (fb, tb) = (from.bits(), to.bits());
            if tb >= fb {
                SampleValue::Int(v << (tb - fb))
            } else {
                SampleValue::Int(v >> (fb - tb))
            }
        }
        (SampleValue::Int(v), true) => SampleValue::Float(v as f64 / from.int_scale()),
        (SampleValue::Float(v), false) => {
            let scale = to.int_scale();
            // `as` 对浮点是饱和 + 向零截断，NaN 得 0
            let x = (v * scale) as i64;
            let max = scale as i64 - 1;
            SampleValue::Int(x.clamp(-max - 1, max) as i32)
        }
        (SampleValue::Float(v), true) => SampleValue::Float(v),
    }
}

/// 批量转换交织样本
///
/// `input` 与 `output` 的样本数必须一致。
pub fn convert_samples(from: DspFormat, input: &[u8], to: DspFormat, output: &mut [u8]) {
    let in_size = from.sample_size();
    let out_size = to.sample_size();
    debug_assert_eq!(input.len() / in_size, output.len() / out_size);

    for (src, dst) in input
        .chunks_exact(in_size)
        .zip(output.chunks_exact_mut(out_size))
    {
        let value = read_sample(from, src);
        write_sample(to, convert_sample(from, to, value), dst);
    }
}

/// 把 3 字节紧凑 24-bit 样本解包到 4 字节 Pcm24 表示
///
/// 返回解包的样本数。不完整的尾部字节被丢弃。
pub fn unpack_pcm24(packed: &[u8], output: &mut [u8]) -> usize {
    let mut count = 0;
    for (src, dst) in packed.chunks_exact(3).zip(output.chunks_exact_mut(4)) {
        // chunk[0] = LSB, chunk[2] = MSB (含符号位)
        let raw = (src[0] as i32) | ((src[1] as i32) << 8) | ((src[2] as i32) << 16);
        // 先左移把符号位移到 bit31，再算术右移恢复
        let signed = (raw << 8) >> 8;
        dst.copy_from_slice(&signed.to_le_bytes());
        count += 1;
    }
    count
}
