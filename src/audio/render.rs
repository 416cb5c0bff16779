//! 渲染核心（实时回调主体）
//!
//! 硬件时钟按固定周期调用 `render`，回调体内：
//! - 不分配、不做 I/O、不打日志
//! - 唯一的等待是环形缓冲上有界的 data 获取，预算远小于回调周期
//! - 数据不足一律补静音并记 underrun，绝不向上抛错或阻塞
//!
//! 所有缓冲在构建期按最大回调帧数预分配

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::downmix::DownmixProcessor;
use super::eq::EqualizerStage;
use super::format::{ne_bytes_to_f32, StreamFormat};
use super::ring_buffer::RingBuffer;
use super::stats::{RenderStats, SustainFlag};
use super::transport::{RenderDecision, Transport};
use super::vis::VisSender;

/// 实时读预算上限（微秒）
///
/// 即使回调周期很长，也不允许读等待超过此值
const MAX_READ_BUDGET_US: u64 = 2_000;

/// 计算实时读预算：回调周期的 1/4，封顶 MAX_READ_BUDGET_US
fn read_budget(period_frames: usize, sample_rate: f64) -> Duration {
    let period_us = (period_frames as f64 / sample_rate * 1_000_000.0) as u64;
    Duration::from_micros((period_us / 4).min(MAX_READ_BUDGET_US).max(100))
}

/// 渲染回调上下文
///
/// 所有字段在回调启动前构建完成；格式/布局变化不做原地修改，
/// 而是由控制线程重建整个上下文（至多一个周期静音）
pub struct RenderContext {
    transport: Arc<Transport>,
    ring: Arc<RingBuffer>,
    stats: Arc<RenderStats>,
    sustain: Arc<SustainFlag>,
    /// 线性音量，f32 bits 编码
    volume_bits: Arc<AtomicU32>,

    stream_format: StreamFormat,
    device_format: StreamFormat,

    /// 流布局 → 设备布局
    downmix: DownmixProcessor,
    /// 流布局 → mono，只喂可视化，不影响送往设备的音频
    vis_downmix: DownmixProcessor,
    eq: EqualizerStage,
    vis: Option<VisSender>,

    // 预分配缓冲
    byte_buf: Vec<u8>,
    stream_buf: Vec<f32>,
    mono_buf: Vec<f32>,
    /// byte_buf 头部残留的不满一帧的字节数（跨周期续齐帧边界）
    carry: usize,

    budget: Duration,
    max_frames: usize,
}

impl RenderContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<Transport>,
        ring: Arc<RingBuffer>,
        stats: Arc<RenderStats>,
        sustain: Arc<SustainFlag>,
        volume_bits: Arc<AtomicU32>,
        stream_format: StreamFormat,
        device_format: StreamFormat,
        downmix: DownmixProcessor,
        vis_downmix: DownmixProcessor,
        eq: EqualizerStage,
        vis: Option<VisSender>,
        max_frames: usize,
    ) -> Self {
        let in_ch = stream_format.channels as usize;
        let budget = read_budget(max_frames, device_format.sample_rate);

        Self {
            transport,
            ring,
            stats,
            sustain,
            volume_bits,
            stream_format,
            device_format,
            downmix,
            vis_downmix,
            eq,
            vis,
            byte_buf: vec![0u8; max_frames * in_ch * 4],
            stream_buf: vec![0.0; max_frames * in_ch],
            mono_buf: vec![0.0; max_frames],
            carry: 0,
            budget,
            max_frames,
        }
    }

    #[inline]
    pub fn device_format(&self) -> StreamFormat {
        self.device_format
    }

    #[inline]
    pub fn stream_format(&self) -> StreamFormat {
        self.stream_format
    }

    /// 渲染一个周期
    ///
    /// `out` 为设备布局 interleaved f32，长度 = frames * 设备声道数。
    /// 实时线程调用；绝不阻塞超过读预算。
    pub fn render(&mut self, out: &mut [f32], frames: usize) {
        self.stats.on_callback(&self.ring);

        // 非 Running 阶段整块静音
        if self.transport.render_observe() != RenderDecision::Produce {
            out.fill(0.0);
            return;
        }

        let out_ch = self.device_format.channels as usize;
        let in_ch = self.stream_format.channels as usize;
        let frames = frames.min(self.max_frames).min(out.len() / out_ch.max(1));

        // 从环形缓冲取所需字节，有界等待
        // 信号量按字节计数，生产者写到一半时可能授出不满一帧的尾巴；
        // 残字节留在 byte_buf 头部，下个周期续齐，帧边界永不错位
        let bytes_per_frame = in_ch * 4;
        let need = (frames * bytes_per_frame).saturating_sub(self.carry);
        let got = self
            .ring
            .read(&mut self.byte_buf[self.carry..self.carry + need], self.budget);
        let avail = self.carry + got;
        let got_frames = avail / bytes_per_frame;
        let used = got_frames * bytes_per_frame;

        if got_frames < frames {
            // underrun：短缺部分补静音，只记计数
            self.stats.record_underrun();
        }

        ne_bytes_to_f32(
            &self.byte_buf[..used],
            &mut self.stream_buf[..got_frames * in_ch],
        );
        self.byte_buf.copy_within(used..avail, 0);
        self.carry = avail - used;

        // 流布局 ≠ 设备布局时过下混矩阵，一致时为恒等拷贝
        self.downmix.process(
            &self.stream_buf[..got_frames * in_ch],
            &mut out[..got_frames * out_ch],
        );

        // 音量 + 均衡
        let volume = f32::from_bits(self.volume_bits.load(Ordering::Relaxed)).clamp(0.0, 1.0);
        if volume != 1.0 {
            for sample in &mut out[..got_frames * out_ch] {
                *sample *= volume;
            }
        }
        self.eq.process(&mut out[..got_frames * out_ch]);
        // 零音量在链路末端硬静音：均衡器的残留历史（ringing）不得漏到设备
        if volume == 0.0 {
            out[..got_frames * out_ch].fill(0.0);
        }

        // 短缺尾部补静音
        out[got_frames * out_ch..].fill(0.0);

        // sustain 记账：控制面标记过的数据块按字节计入
        if used > 0 && self.sustain.consume() {
            self.stats.add_bytes_sustained(used as u64);
        }

        // 交付帧数单调累加（补静音帧同样计入）
        self.stats.add_frames_rendered(frames as u64);

        // mono 下混喂可视化，非阻塞投递
        if let Some(vis) = &self.vis {
            if got_frames > 0 {
                self.vis_downmix.process(
                    &self.stream_buf[..got_frames * in_ch],
                    &mut self.mono_buf[..got_frames],
                );
                vis.publish(&self.mono_buf[..got_frames]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::eq::EqSettings;
    use crate::audio::format::{f32_to_ne_bytes, ChannelLayout, SampleFormat};
    use crate::audio::transport::TransportState;
    use crate::audio::vis::vis_channel;

    const PERIOD: usize = 64;

    struct Harness {
        ctx: RenderContext,
        transport: Arc<Transport>,
        ring: Arc<RingBuffer>,
        stats: Arc<RenderStats>,
        sustain: Arc<SustainFlag>,
        volume: Arc<AtomicU32>,
        eq_settings: Arc<EqSettings>,
    }

    fn harness(stream_ch: u16, device_ch: u16) -> Harness {
        let transport = Arc::new(Transport::new());
        let ring = Arc::new(RingBuffer::new(4096));
        let stats = Arc::new(RenderStats::new());
        let sustain = Arc::new(SustainFlag::new());
        let volume = Arc::new(AtomicU32::new(1.0f32.to_bits()));
        let eq_settings = Arc::new(EqSettings::new());

        let stream_format = StreamFormat::new(48000.0, SampleFormat::Float32, stream_ch);
        let device_format = StreamFormat::new(48000.0, SampleFormat::Float32, device_ch);
        let stream_layout = ChannelLayout::default_for(stream_ch);
        let device_layout = ChannelLayout::default_for(device_ch);

        let ctx = RenderContext::new(
            Arc::clone(&transport),
            Arc::clone(&ring),
            Arc::clone(&stats),
            Arc::clone(&sustain),
            Arc::clone(&volume),
            stream_format,
            device_format,
            DownmixProcessor::new(stream_layout.clone(), device_layout),
            DownmixProcessor::to_mono(stream_layout),
            EqualizerStage::new(48000.0, device_ch, Arc::clone(&eq_settings)),
            None,
            PERIOD,
        );

        Harness {
            ctx,
            transport,
            ring,
            stats,
            sustain,
            volume,
            eq_settings,
        }
    }

    fn fill_ring(ring: &RingBuffer, samples: &[f32]) {
        let mut bytes = vec![0u8; samples.len() * 4];
        f32_to_ne_bytes(samples, &mut bytes);
        assert_eq!(ring.write(&bytes), bytes.len());
    }

    fn run_transport(h: &Harness) {
        h.transport.begin_start();
        h.transport.mark_running();
    }

    #[test]
    fn test_silence_when_not_running() {
        let mut h = harness(2, 2);
        fill_ring(&h.ring, &[0.5; 256]);

        let mut out = vec![1.0f32; PERIOD * 2];
        h.ctx.render(&mut out, PERIOD);

        // Stopped 状态：输出全零，缓冲区原封不动
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(h.ring.data_len(), 256 * 4);
        assert_eq!(h.stats.frames_rendered(), 0);
    }

    #[test]
    fn test_passthrough_at_unity_volume() {
        let mut h = harness(2, 2);
        run_transport(&h);

        let input: Vec<f32> = (0..PERIOD * 2).map(|i| (i as f32 + 1.0) / 1024.0).collect();
        fill_ring(&h.ring, &input);

        let mut out = vec![0f32; PERIOD * 2];
        h.ctx.render(&mut out, PERIOD);

        // 音量 1.0 + 均衡旁路 + 恒等下混：精确直通
        assert_eq!(out, input);
        assert_eq!(h.stats.underrun_count(), 0);
        assert_eq!(h.stats.frames_rendered(), PERIOD as u64);
    }

    #[test]
    fn test_volume_zero_silences_everything() {
        let mut h = harness(2, 2);
        run_transport(&h);
        h.volume.store(0.0f32.to_bits(), Ordering::Relaxed);

        fill_ring(&h.ring, &[0.9; PERIOD * 2]);
        let mut out = vec![0.5f32; PERIOD * 2];
        h.ctx.render(&mut out, PERIOD);

        assert!(out.iter().all(|&s| s == 0.0));
        // 数据仍被消费：音量是增益而不是旁路
        assert_eq!(h.ring.data_len(), 0);
    }

    #[test]
    fn test_volume_zero_silences_eq_ringing() {
        let mut h = harness(2, 2);
        run_transport(&h);
        h.eq_settings.set_enabled(true);
        h.eq_settings.set_band_gain(0, 12.0);

        // 热身：交叉淡化走完、滤波器历史非零
        let warmup: Vec<f32> = (0..PERIOD * 2)
            .map(|i| (i as f32 * std::f32::consts::TAU * 31.25 / 48000.0).sin() * 0.8)
            .collect();
        let mut out = vec![0f32; PERIOD * 2];
        for _ in 0..12 {
            fill_ring(&h.ring, &warmup);
            h.ctx.render(&mut out, PERIOD);
        }

        // 零音量下均衡器的残留振铃也不得到达设备
        h.volume.store(0.0f32.to_bits(), Ordering::Relaxed);
        fill_ring(&h.ring, &[0.7; PERIOD * 2]);
        h.ctx.render(&mut out, PERIOD);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_volume_scales_linearly() {
        let mut h = harness(1, 1);
        run_transport(&h);
        h.volume.store(0.5f32.to_bits(), Ordering::Relaxed);

        fill_ring(&h.ring, &[0.8; PERIOD]);
        let mut out = vec![0f32; PERIOD];
        h.ctx.render(&mut out, PERIOD);

        for &sample in &out {
            assert!((sample - 0.4).abs() < 1e-6);
        }
    }

    #[test]
    fn test_underrun_fills_silence_and_advances() {
        let mut h = harness(2, 2);
        run_transport(&h);

        // 只准备半个周期的数据
        let input: Vec<f32> = vec![0.25; PERIOD];
        fill_ring(&h.ring, &input);

        let mut out = vec![1.0f32; PERIOD * 2];
        h.ctx.render(&mut out, PERIOD);

        // 前半为数据，后半补静音
        assert!(out[..PERIOD].iter().all(|&s| s == 0.25));
        assert!(out[PERIOD..].iter().all(|&s| s == 0.0));
        assert_eq!(h.stats.underrun_count(), 1);
        // 交付帧数仍按整周期推进
        assert_eq!(h.stats.frames_rendered(), PERIOD as u64);

        // 完全断流的周期：全静音、计数继续、不死锁
        h.ctx.render(&mut out, PERIOD);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(h.stats.frames_rendered(), (PERIOD * 2) as u64);
        assert_eq!(h.stats.underrun_count(), 2);
    }

    #[test]
    fn test_pause_resume_exact_position() {
        let mut h = harness(1, 1);
        run_transport(&h);

        // 递增序列便于核对位置
        let input: Vec<f32> = (0..PERIOD * 3).map(|i| (i + 1) as f32).collect();
        fill_ring(&h.ring, &input);

        let mut first = vec![0f32; PERIOD];
        h.ctx.render(&mut first, PERIOD);
        assert_eq!(first[PERIOD - 1], PERIOD as f32);

        // 暂停：静音且不消费缓冲
        h.transport.request_pause();
        let before = h.ring.data_len();
        let mut paused = vec![0f32; PERIOD];
        h.ctx.render(&mut paused, PERIOD);
        assert!(paused.iter().all(|&s| s == 0.0));
        assert_eq!(h.ring.data_len(), before);
        assert_eq!(h.transport.state(), TransportState::Paused);

        // 恢复：从暂停的精确位置继续，无丢帧无重复
        h.transport.request_resume();
        let mut resumed = vec![0f32; PERIOD];
        h.ctx.render(&mut resumed, PERIOD);
        assert_eq!(resumed[0], (PERIOD + 1) as f32);
        assert_eq!(resumed[PERIOD - 1], (PERIOD * 2) as f32);
    }

    #[test]
    fn test_downmix_path_engaged() {
        let mut h = harness(6, 2);
        run_transport(&h);

        // 5.1 输入：只有左前有信号
        let mut frame = vec![0f32; 6];
        frame[0] = 0.5;
        let input: Vec<f32> = frame.repeat(PERIOD);
        fill_ring(&h.ring, &input);

        let mut out = vec![0f32; PERIOD * 2];
        h.ctx.render(&mut out, PERIOD);

        // 左声道有能量，右声道安静
        assert!(out[0] > 0.0);
        assert_eq!(out[1], 0.0);
    }

    #[test]
    fn test_sustain_counts_flagged_blocks_only() {
        let mut h = harness(2, 2);
        run_transport(&h);

        fill_ring(&h.ring, &[0.1; PERIOD * 2]);
        let mut out = vec![0f32; PERIOD * 2];
        h.ctx.render(&mut out, PERIOD);
        // 无标记：保持为零
        assert_eq!(h.stats.bytes_sustained(), 0);

        // 标记一次 → 恰好一个数据块计入
        h.sustain.raise();
        fill_ring(&h.ring, &[0.1; PERIOD * 2]);
        h.ctx.render(&mut out, PERIOD);
        let expected = (PERIOD * 2 * 4) as u64;
        assert_eq!(h.stats.bytes_sustained(), expected);

        // 后续未标记块不计入
        fill_ring(&h.ring, &[0.1; PERIOD * 2]);
        h.ctx.render(&mut out, PERIOD);
        assert_eq!(h.stats.bytes_sustained(), expected);
    }

    #[test]
    fn test_sustain_flag_survives_empty_block() {
        let mut h = harness(2, 2);
        run_transport(&h);

        // 标记悬起但缓冲为空：标志保留到下一个有数据的块
        h.sustain.raise();
        let mut out = vec![0f32; PERIOD * 2];
        h.ctx.render(&mut out, PERIOD);
        assert_eq!(h.stats.bytes_sustained(), 0);

        fill_ring(&h.ring, &[0.1; PERIOD * 2]);
        h.ctx.render(&mut out, PERIOD);
        assert!(h.stats.bytes_sustained() > 0);
    }

    #[test]
    fn test_vis_feed_is_mono_and_lossless_to_device() {
        let transport = Arc::new(Transport::new());
        let ring = Arc::new(RingBuffer::new(4096));
        let stats = Arc::new(RenderStats::new());
        let sustain = Arc::new(SustainFlag::new());
        let volume = Arc::new(AtomicU32::new(1.0f32.to_bits()));
        let eq_settings = Arc::new(EqSettings::new());
        let (vis_tx, vis_rx) = vis_channel(4, PERIOD, 48000.0);

        let stream_format = StreamFormat::new(48000.0, SampleFormat::Float32, 2);
        let device_format = stream_format;
        let layout = ChannelLayout::stereo();

        let mut ctx = RenderContext::new(
            Arc::clone(&transport),
            Arc::clone(&ring),
            stats,
            sustain,
            volume,
            stream_format,
            device_format,
            DownmixProcessor::new(layout.clone(), layout.clone()),
            DownmixProcessor::to_mono(layout),
            EqualizerStage::new(48000.0, 2, eq_settings),
            Some(vis_tx),
            PERIOD,
        );

        transport.begin_start();
        transport.mark_running();

        // 左 0.4 / 右 0.2 → mono 期望 0.3
        let input: Vec<f32> = [0.4f32, 0.2].repeat(PERIOD);
        let mut bytes = vec![0u8; input.len() * 4];
        f32_to_ne_bytes(&input, &mut bytes);
        ring.write(&bytes);

        let mut out = vec![0f32; PERIOD * 2];
        ctx.render(&mut out, PERIOD);

        // 设备输出不受 vis 通路影响
        assert_eq!(out, input);

        let block = vis_rx.try_recv().expect("vis block published");
        assert_eq!(block.frames, PERIOD);
        for &sample in &block.samples[..block.frames] {
            assert!((sample - 0.3).abs() < 1e-6);
        }
    }
}
