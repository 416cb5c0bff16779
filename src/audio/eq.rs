//! 10 段图示均衡器
//!
//! 架构：
//! - 增益（f32 编码为 u32 bits）经 Arc<AtomicU32> 跨线程共享
//! - biquad 滤波器状态只活在渲染线程内，不做跨线程迁移
//! - 系数只在增益实际变化时重算，滤波器历史在重算与启停间均保留
//! - 启用/停用经干湿交叉淡化完成，不在缓冲区中间产生可闻的不连续

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use biquad::{Biquad, Coefficients, DirectForm1, ToHertz, Type, Q_BUTTERWORTH_F32};

/// 均衡器段数
pub const EQ_BAND_COUNT: usize = 10;

/// 各段中心频率（Hz），ISO 倍频程刻度
pub const EQ_FREQUENCIES: [f32; EQ_BAND_COUNT] = [
    31.25, 62.5, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0,
];

/// 段增益范围（dB）
pub const EQ_MIN_DB: f32 = -12.0;
pub const EQ_MAX_DB: f32 = 12.0;

/// peaking 滤波器 Q 值
const EQ_Q: f32 = Q_BUTTERWORTH_F32;

/// 启停交叉淡化时长（毫秒）
const CROSSFADE_MS: f32 = 10.0;

/// 增益变化重算阈值（dB）
const GAIN_EPSILON: f32 = 0.01;

#[inline]
fn db_to_linear(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

/// 均衡器共享状态（控制线程写，渲染线程读）
pub struct EqSettings {
    enabled: AtomicBool,
    gains: [AtomicU32; EQ_BAND_COUNT],
    preamp: AtomicU32,
}

impl EqSettings {
    pub fn new() -> Self {
        let zero_bits = f32::to_bits(0.0);
        Self {
            enabled: AtomicBool::new(false),
            gains: std::array::from_fn(|_| AtomicU32::new(zero_bits)),
            preamp: AtomicU32::new(zero_bits),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// 设置某段增益（dB，夹取到 [-12, +12]）
    pub fn set_band_gain(&self, band: usize, gain_db: f32) {
        if band < EQ_BAND_COUNT {
            let clamped = gain_db.clamp(EQ_MIN_DB, EQ_MAX_DB);
            self.gains[band].store(f32::to_bits(clamped), Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn band_gain(&self, band: usize) -> f32 {
        if band < EQ_BAND_COUNT {
            f32::from_bits(self.gains[band].load(Ordering::Relaxed))
        } else {
            0.0
        }
    }

    /// 设置前级增益（dB）
    pub fn set_preamp(&self, gain_db: f32) {
        let clamped = gain_db.clamp(EQ_MIN_DB, EQ_MAX_DB);
        self.preamp.store(f32::to_bits(clamped), Ordering::Relaxed);
    }

    #[inline]
    pub fn preamp(&self) -> f32 {
        f32::from_bits(self.preamp.load(Ordering::Relaxed))
    }
}

impl Default for EqSettings {
    fn default() -> Self {
        Self::new()
    }
}

/// 单段状态：每个设备声道一个滤波器实例
struct EqBand {
    freq: f32,
    applied_gain_db: f32,
    filters: Vec<DirectForm1<f32>>,
}

impl EqBand {
    fn new(freq: f32, sample_rate: f32, channels: usize) -> Self {
        let coeffs = Self::coefficients(freq, 0.0, sample_rate);
        Self {
            freq,
            applied_gain_db: 0.0,
            filters: (0..channels).map(|_| DirectForm1::<f32>::new(coeffs)).collect(),
        }
    }

    fn coefficients(freq: f32, gain_db: f32, sample_rate: f32) -> Coefficients<f32> {
        let gain_linear = db_to_linear(gain_db);
        Coefficients::<f32>::from_params(
            Type::PeakingEQ(gain_linear),
            sample_rate.hz(),
            freq.hz(),
            EQ_Q,
        )
        .unwrap_or(Coefficients {
            a1: 0.0,
            a2: 0.0,
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
        })
    }

    /// 增益变化时就地更新系数，滤波器历史不清零
    fn refresh(&mut self, gain_db: f32, sample_rate: f32) {
        if (gain_db - self.applied_gain_db).abs() > GAIN_EPSILON {
            self.applied_gain_db = gain_db;
            let coeffs = Self::coefficients(self.freq, gain_db, sample_rate);
            for filter in &mut self.filters {
                filter.update_coefficients(coeffs);
            }
        }
    }
}

/// 渲染链路中的均衡器级
///
/// 整条链路被旁路时不触碰滤波器状态，重新启用不损失滤波质量
pub struct EqualizerStage {
    settings: Arc<EqSettings>,
    bands: Vec<EqBand>,
    sample_rate: f32,
    channels: usize,
    /// 干湿混合位置：0.0 = 全旁路，1.0 = 全均衡
    mix: f32,
    /// 每帧混合步进，对应 ~10ms 淡化窗口
    mix_step: f32,
}

impl EqualizerStage {
    pub fn new(sample_rate: f64, channels: u16, settings: Arc<EqSettings>) -> Self {
        let sample_rate = sample_rate as f32;
        let channels = channels.max(1) as usize;
        let bands = EQ_FREQUENCIES
            .iter()
            .map(|&freq| EqBand::new(freq, sample_rate, channels))
            .collect();
        let mix = if settings.is_enabled() { 1.0 } else { 0.0 };

        Self {
            settings,
            bands,
            sample_rate,
            channels,
            mix,
            mix_step: 1.0 / (CROSSFADE_MS * 0.001 * sample_rate).max(1.0),
        }
    }

    /// 处理一个 interleaved 设备布局块
    ///
    /// 稳态零分配；完全旁路时直接返回且不推进滤波器状态
    pub fn process(&mut self, block: &mut [f32]) {
        let target = if self.settings.is_enabled() { 1.0 } else { 0.0 };
        if self.mix == 0.0 && target == 0.0 {
            return;
        }

        for (i, band) in self.bands.iter_mut().enumerate() {
            band.refresh(self.settings.band_gain(i), self.sample_rate);
        }
        let preamp = db_to_linear(self.settings.preamp());

        let channels = self.channels;
        let mut mix = self.mix;
        for frame in block.chunks_exact_mut(channels) {
            for (ch, sample) in frame.iter_mut().enumerate() {
                let dry = *sample;
                let mut wet = dry * preamp;
                for band in &mut self.bands {
                    wet = band.filters[ch].run(wet);
                }
                *sample = dry * (1.0 - mix) + wet * mix;
            }

            // 每帧推进交叉淡化
            if mix < target {
                mix = (mix + self.mix_step).min(1.0);
            } else if mix > target {
                mix = (mix - self.mix_step).max(0.0);
            }
        }
        self.mix = mix;
    }

    /// 当前干湿混合位置（测试/诊断用）
    #[inline]
    pub fn mix(&self) -> f32 {
        self.mix
    }
}
