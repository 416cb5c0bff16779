//! 音频流格式与声道布局
//!
//! 管线内部传输格式统一为 interleaved f32：
//! - 整数源格式（16/24/32-bit）在生产者线程解码为 f32，实时线程零转换
//! - 16/24-bit 整数样本在 f32 尾数内精确可表示，通路无精度损失
//! - 设备端格式由硬件决定，仅在设备变更事件时整体替换，不做原地修改

/// 声道数上限
///
/// 超过此值的设备/流配置视为不合理，协商阶段 fail closed
pub const MAX_CHANNELS: u16 = 8;

/// 样本表示
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    Int16,
    Int24,
    Int32,
    Float32,
}

impl SampleFormat {
    /// 每样本字节数
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::Int16 => 2,
            Self::Int24 => 3,
            Self::Int32 => 4,
            Self::Float32 => 4,
        }
    }

    #[inline]
    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float32)
    }
}

/// 流格式描述
///
/// 两个实例贯穿整条链路：
/// - `device_format`：硬件原生格式，设备变更事件时整体替换
/// - `stream_format`：与生产者协商的输入格式，变更时重建下混矩阵
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamFormat {
    pub sample_rate: f64,
    pub sample_format: SampleFormat,
    pub channels: u16,
    pub interleaved: bool,
}

impl StreamFormat {
    pub fn new(sample_rate: f64, sample_format: SampleFormat, channels: u16) -> Self {
        Self {
            sample_rate,
            sample_format,
            channels,
            interleaved: true,
        }
    }

    /// 每样本字节数
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        self.sample_format.bytes_per_sample()
    }

    /// 每帧字节数
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    #[inline]
    pub fn frames_to_bytes(&self, frames: usize) -> usize {
        frames * self.bytes_per_frame()
    }

    #[inline]
    pub fn bytes_to_frames(&self, bytes: usize) -> usize {
        let bpf = self.bytes_per_frame();
        if bpf == 0 {
            0
        } else {
            bytes / bpf
        }
    }

    /// 校验格式是否可用
    ///
    /// 采样率或声道数为零/不合理时拒绝，设备绑定 fail closed
    pub fn validate(&self) -> Result<(), String> {
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(format!("invalid sample rate: {}", self.sample_rate));
        }
        if self.sample_rate > 768_000.0 {
            return Err(format!("unreasonable sample rate: {}", self.sample_rate));
        }
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(format!("unreasonable channel count: {}", self.channels));
        }
        Ok(())
    }

    /// 将源格式的原始 PCM 字节解码为 f32 样本
    ///
    /// little-endian 输入，整数格式归一化到 [-1.0, 1.0)。
    /// 返回解码的样本数。只在生产者线程调用，实时路径不做格式转换。
    pub fn bytes_to_f32(&self, bytes: &[u8], output: &mut [f32]) -> usize {
        match self.sample_format {
            SampleFormat::Int16 => {
                const SCALE: f32 = 1.0 / 32768.0;
                let n = (bytes.len() / 2).min(output.len());
                for (i, chunk) in bytes.chunks_exact(2).take(n).enumerate() {
                    let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
                    output[i] = sample as f32 * SCALE;
                }
                n
            }
            SampleFormat::Int24 => {
                const SCALE: f32 = 1.0 / 8_388_608.0;
                let n = (bytes.len() / 3).min(output.len());
                for (i, chunk) in bytes.chunks_exact(3).take(n).enumerate() {
                    // chunk[0] = LSB, chunk[2] = MSB (含符号位)
                    let raw = (chunk[0] as i32)
                        | ((chunk[1] as i32) << 8)
                        | ((chunk[2] as i32) << 16);
                    // 符号扩展 24-bit → 32-bit
                    let signed = (raw << 8) >> 8;
                    output[i] = signed as f32 * SCALE;
                }
                n
            }
            SampleFormat::Int32 => {
                const SCALE: f32 = 1.0 / 2_147_483_648.0;
                let n = (bytes.len() / 4).min(output.len());
                for (i, chunk) in bytes.chunks_exact(4).take(n).enumerate() {
                    let sample = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    output[i] = sample as f32 * SCALE;
                }
                n
            }
            SampleFormat::Float32 => {
                let n = (bytes.len() / 4).min(output.len());
                for (i, chunk) in bytes.chunks_exact(4).take(n).enumerate() {
                    output[i] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
                n
            }
        }
    }
}

/// 将 f32 样本打包为 native-endian 字节（环形缓冲的传输表示）
pub fn f32_to_ne_bytes(samples: &[f32], output: &mut [u8]) -> usize {
    let n = samples.len().min(output.len() / 4);
    for (i, &sample) in samples.iter().take(n).enumerate() {
        output[i * 4..i * 4 + 4].copy_from_slice(&sample.to_ne_bytes());
    }
    n
}

/// 从 native-endian 字节恢复 f32 样本
pub fn ne_bytes_to_f32(bytes: &[u8], output: &mut [f32]) -> usize {
    let n = (bytes.len() / 4).min(output.len());
    for (i, chunk) in bytes.chunks_exact(4).take(n).enumerate() {
        output[i] = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    n
}

/// 逻辑声道角色
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelRole {
    FrontLeft,
    FrontRight,
    FrontCenter,
    Lfe,
    BackLeft,
    BackRight,
    BackCenter,
    SideLeft,
    SideRight,
}

/// 有序声道布局：角色 → 物理声道下标
///
/// 生产者侧和设备侧各持一份；下混矩阵保证每个生产者角色
/// 对每个设备声道都有定义的（可能为零的）贡献
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelLayout {
    roles: Vec<ChannelRole>,
}

impl ChannelLayout {
    pub fn new(roles: Vec<ChannelRole>) -> Self {
        Self { roles }
    }

    pub fn mono() -> Self {
        Self::new(vec![ChannelRole::FrontCenter])
    }

    pub fn stereo() -> Self {
        Self::new(vec![ChannelRole::FrontLeft, ChannelRole::FrontRight])
    }

    /// 按声道数返回惯例布局（1..=8）
    ///
    /// 1=mono, 2=stereo, 3=LRC, 4=quad, 5=5.0, 6=5.1, 7=6.1, 8=7.1
    pub fn default_for(channels: u16) -> Self {
        use ChannelRole::*;
        let roles = match channels {
            0 | 1 => vec![FrontCenter],
            2 => vec![FrontLeft, FrontRight],
            3 => vec![FrontLeft, FrontRight, FrontCenter],
            4 => vec![FrontLeft, FrontRight, BackLeft, BackRight],
            5 => vec![FrontLeft, FrontRight, FrontCenter, BackLeft, BackRight],
            6 => vec![FrontLeft, FrontRight, FrontCenter, Lfe, BackLeft, BackRight],
            7 => vec![
                FrontLeft,
                FrontRight,
                FrontCenter,
                Lfe,
                BackLeft,
                BackRight,
                BackCenter,
            ],
            _ => vec![
                FrontLeft,
                FrontRight,
                FrontCenter,
                Lfe,
                BackLeft,
                BackRight,
                SideLeft,
                SideRight,
            ],
        };
        Self { roles }
    }

    #[inline]
    pub fn channels(&self) -> u16 {
        self.roles.len() as u16
    }

    #[inline]
    pub fn roles(&self) -> &[ChannelRole] {
        &self.roles
    }

    #[inline]
    pub fn index_of(&self, role: ChannelRole) -> Option<usize> {
        self.roles.iter().position(|&r| r == role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_degenerate_formats() {
        // 零采样率 / 零声道必须 fail closed
        let zero_rate = StreamFormat::new(0.0, SampleFormat::Float32, 2);
        assert!(zero_rate.validate().is_err());

        let zero_channels = StreamFormat::new(48000.0, SampleFormat::Float32, 0);
        assert!(zero_channels.validate().is_err());

        let absurd_channels = StreamFormat::new(48000.0, SampleFormat::Float32, 64);
        assert!(absurd_channels.validate().is_err());

        let nan_rate = StreamFormat::new(f64::NAN, SampleFormat::Float32, 2);
        assert!(nan_rate.validate().is_err());

        let ok = StreamFormat::new(96000.0, SampleFormat::Int24, 6);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_frame_math() {
        let format = StreamFormat::new(48000.0, SampleFormat::Int24, 2);
        assert_eq!(format.bytes_per_frame(), 6);
        assert_eq!(format.frames_to_bytes(100), 600);
        assert_eq!(format.bytes_to_frames(600), 100);
    }

    #[test]
    fn test_16bit_decode() {
        let format = StreamFormat::new(48000.0, SampleFormat::Int16, 1);

        let mut samples = [0f32; 2];
        // +16384 和 -16384
        let bytes = [0x00, 0x40, 0x00, 0xC0];
        assert_eq!(format.bytes_to_f32(&bytes, &mut samples), 2);
        assert_eq!(samples[0], 0.5);
        assert_eq!(samples[1], -0.5);
    }

    #[test]
    fn test_24bit_sign_extend() {
        let format = StreamFormat::new(96000.0, SampleFormat::Int24, 1);
        let mut samples = [0f32; 1];

        // 最大正值: 0x7FFFFF
        format.bytes_to_f32(&[0xFF, 0xFF, 0x7F], &mut samples);
        assert!(samples[0] > 0.0);

        // 最小负值: 0x800000 = -8388608
        format.bytes_to_f32(&[0x00, 0x00, 0x80], &mut samples);
        assert_eq!(samples[0], -1.0);

        // -1: 0xFFFFFF
        format.bytes_to_f32(&[0xFF, 0xFF, 0xFF], &mut samples);
        assert!(samples[0] < 0.0);
        assert!(samples[0].abs() < 1e-6);
    }

    #[test]
    fn test_f32_ne_roundtrip() {
        let samples = [0.25f32, -0.5, 1.0, -1.0];
        let mut bytes = [0u8; 16];
        assert_eq!(f32_to_ne_bytes(&samples, &mut bytes), 4);

        let mut recovered = [0f32; 4];
        assert_eq!(ne_bytes_to_f32(&bytes, &mut recovered), 4);
        assert_eq!(samples, recovered);
    }

    #[test]
    fn test_default_layouts() {
        assert_eq!(ChannelLayout::default_for(1), ChannelLayout::mono());
        assert_eq!(ChannelLayout::default_for(2), ChannelLayout::stereo());

        let surround = ChannelLayout::default_for(6);
        assert_eq!(surround.channels(), 6);
        assert_eq!(surround.index_of(ChannelRole::Lfe), Some(3));
        assert_eq!(surround.index_of(ChannelRole::SideLeft), None);
    }
}
