//! 声道下混处理器
//!
//! 输入布局 → 目标布局的逐声道增益矩阵：
//! - 布局一致时为恒等矩阵（逐样本拷贝，bit-exact）
//! - 目标缺中置/LFE 时以 -3 dB 折叠进左右声道
//! - 目标缺环绕时以 -3 dB 向前折叠
//! - mono 目标等权求和（1/N，防削波）
//!
//! 矩阵在配置期构建；`process` 在稳态下纯函数、零分配，
//! 任一端布局变化时整体重建实例

use super::format::{ChannelLayout, ChannelRole};

/// 折叠衰减系数：-3 dB
///
/// 中置/LFE/环绕折叠的惯例衰减，保持声像能量大致不变。
/// 这是策略选择而非结构要求，常量集中在此便于替换。
const FOLD_ATTENUATION: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// 归一化上限：任一输出声道累计增益不超过 1.0
///
/// 超过时整个矩阵按最大列和缩放，避免折叠叠加导致削波
const OUTPUT_GAIN_CEILING: f32 = 1.0;

/// 逐声道增益矩阵下混处理器
pub struct DownmixProcessor {
    input: ChannelLayout,
    output: ChannelLayout,
    /// 行 = 输入声道，列 = 输出声道
    matrix: Vec<f32>,
    identity: bool,
}

impl DownmixProcessor {
    pub fn new(input: ChannelLayout, output: ChannelLayout) -> Self {
        let identity = input == output;
        let matrix = if identity {
            identity_matrix(input.channels() as usize)
        } else {
            build_matrix(&input, &output)
        };

        Self {
            input,
            output,
            matrix,
            identity,
        }
    }

    /// 固定目标为 mono 的独立实例（可视化数据通路专用）
    pub fn to_mono(input: ChannelLayout) -> Self {
        Self::new(input, ChannelLayout::mono())
    }

    #[inline]
    pub fn input_channels(&self) -> usize {
        self.input.channels() as usize
    }

    #[inline]
    pub fn output_channels(&self) -> usize {
        self.output.channels() as usize
    }

    #[inline]
    pub fn is_identity(&self) -> bool {
        self.identity
    }

    /// 矩阵系数（测试与诊断用），行主序 [input][output]
    pub fn matrix(&self) -> &[f32] {
        &self.matrix
    }

    /// interleaved 输入帧 → interleaved 输出帧
    ///
    /// 处理 min(输入帧数, 输出容量) 帧，返回处理的帧数。
    /// 稳态零分配，实时线程可调用。
    pub fn process(&self, input: &[f32], output: &mut [f32]) -> usize {
        let in_ch = self.input_channels();
        let out_ch = self.output_channels();
        if in_ch == 0 || out_ch == 0 {
            return 0;
        }

        let frames = (input.len() / in_ch).min(output.len() / out_ch);

        if self.identity {
            output[..frames * out_ch].copy_from_slice(&input[..frames * in_ch]);
            return frames;
        }

        for f in 0..frames {
            let in_base = f * in_ch;
            let out_base = f * out_ch;
            for slot in &mut output[out_base..out_base + out_ch] {
                *slot = 0.0;
            }
            for i in 0..in_ch {
                let sample = input[in_base + i];
                let row = &self.matrix[i * out_ch..(i + 1) * out_ch];
                for (o, &gain) in row.iter().enumerate() {
                    if gain != 0.0 {
                        output[out_base + o] += sample * gain;
                    }
                }
            }
        }

        frames
    }
}

fn identity_matrix(channels: usize) -> Vec<f32> {
    let mut matrix = vec![0.0; channels * channels];
    for i in 0..channels {
        matrix[i * channels + i] = 1.0;
    }
    matrix
}

/// 构建输入 → 输出的增益矩阵
///
/// 每个输入角色按以下优先级路由：
/// 1. 目标存在同角色 → 1.0 直通
/// 2. 折叠规则（中置/LFE → L+R，环绕 → 对应前方声道）
/// 3. 兜底：均摊到所有输出声道（保证每对声道贡献有定义）
///
/// 最后按最大输出列和做统一归一化
fn build_matrix(input: &ChannelLayout, output: &ChannelLayout) -> Vec<f32> {
    use ChannelRole::*;

    let in_ch = input.channels() as usize;
    let out_ch = output.channels() as usize;
    let mut matrix = vec![0.0f32; in_ch * out_ch];

    // mono 目标：等权求和，1/N 衰减防削波
    if out_ch == 1 {
        let weight = 1.0 / in_ch as f32;
        for i in 0..in_ch {
            matrix[i] = weight;
        }
        return matrix;
    }

    let front_left = output.index_of(FrontLeft);
    let front_right = output.index_of(FrontRight);

    for (i, &role) in input.roles().iter().enumerate() {
        let row = &mut matrix[i * out_ch..(i + 1) * out_ch];

        if let Some(o) = output.index_of(role) {
            row[o] = 1.0;
            continue;
        }

        // 折叠目标：缺失角色路由到哪些输出声道
        let targets = match role {
            FrontCenter | Lfe | BackCenter => (front_left, front_right),
            BackLeft | SideLeft => (front_left, None),
            BackRight | SideRight => (front_right, None),
            FrontLeft => (front_left, None),
            FrontRight => (front_right, None),
        };

        let mut routed = false;
        for target in [targets.0, targets.1].into_iter().flatten() {
            row[target] = FOLD_ATTENUATION;
            routed = true;
        }

        // 兜底：无可用折叠目标时均摊，不变量要求每个输入声道都有定义的贡献
        if !routed {
            let weight = 1.0 / out_ch as f32;
            for slot in row.iter_mut() {
                *slot = weight;
            }
        }
    }

    normalize_columns(&mut matrix, in_ch, out_ch);
    matrix
}

/// 按最大输出列和归一化，防止折叠叠加超出增益上限
fn normalize_columns(matrix: &mut [f32], in_ch: usize, out_ch: usize) {
    let mut max_column_sum = 0.0f32;
    for o in 0..out_ch {
        let mut sum = 0.0f32;
        for i in 0..in_ch {
            sum += matrix[i * out_ch + o].abs();
        }
        max_column_sum = max_column_sum.max(sum);
    }

    if max_column_sum > OUTPUT_GAIN_CEILING {
        let scale = OUTPUT_GAIN_CEILING / max_column_sum;
        for coeff in matrix.iter_mut() {
            *coeff *= scale;
        }
    }
}
