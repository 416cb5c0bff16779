//! 音频输出控制器
//!
//! 整条输出链路的属主：协商设备格式、定容环形缓冲、装配渲染上下文、
//! 驱动传输状态机，并向应用暴露控制面
//! （start/pause/resume/stop、音量、均衡、sustain、统计读数）。
//!
//! 链路重建策略：设备格式/布局变化不做原地修改，而是停回调 →
//! 整体替换 device_format → 重建渲染上下文 → 重启回调，
//! 代价上限为一个回调周期的静音。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use thiserror::Error;

use super::device::{
    open_platform_backend, DeviceBackend, DeviceDescriptor, DeviceEvent, DeviceId,
};
use super::downmix::DownmixProcessor;
use super::eq::{EqSettings, EqualizerStage};
use super::format::{f32_to_ne_bytes, ChannelLayout, SampleFormat, StreamFormat};
use super::render::RenderContext;
use super::ring_buffer::RingBuffer;
use super::stats::{RenderStats, StatsReport, SustainFlag};
use super::transport::{Transport, TransportState};
use super::vis::{vis_channel, VisReceiver, VisSender};

/// 输出错误
///
/// underrun 不在此列：实时线程上的缺数据只计数并本地补静音，
/// 永远不会作为错误跨出实时边界
#[derive(Debug, Error)]
pub enum OutputError {
    /// 请求的设备已不存在；原设备保持活跃
    #[error("device {0} is not available")]
    DeviceUnavailable(DeviceId),

    /// 设备报告的格式不可用；本次 setup 失败，不做半绑定
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// setup 期资源获取失败，仅对本次调用致命
    #[error("resource failure: {0}")]
    ResourceFailure(&'static str),

    #[error("backend error: {0}")]
    Backend(String),
}

/// 设备事件队列深度
const EVENT_QUEUE_DEPTH: usize = 16;

/// 可视化块帧数
const VIS_BLOCK_FRAMES: usize = 4096;

/// 生产者转换批大小（样本）
const PRODUCER_CHUNK_SAMPLES: usize = 4096;

/// 输出配置
#[derive(Clone, Debug)]
pub struct OutputConfig {
    /// 环形缓冲目标延迟窗口（毫秒）
    pub latency_ms: u32,
    /// 指定输出设备 ID（None 表示跟随系统默认设备）
    pub device_id: Option<DeviceId>,
    /// 是否建立可视化通道
    pub vis_enabled: bool,
    /// 可视化块队列深度
    pub vis_blocks: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            // 2 秒缓冲：越大越稳定，但延迟也越高
            latency_ms: 2000,
            device_id: None,
            vis_enabled: true,
            vis_blocks: 8,
        }
    }
}

/// 上游生产者写入柄
///
/// 持有环形缓冲的写端；`write` 在空间不足时阻塞（背压），
/// 管线停止时被唤醒并返回短计数。整数源格式在此线程转换为
/// f32 传输表示，实时线程零转换。
pub struct Producer {
    ring: Arc<RingBuffer>,
    format: StreamFormat,
    scratch_f32: Vec<f32>,
    scratch_bytes: Vec<u8>,
}

impl Producer {
    fn new(ring: Arc<RingBuffer>, format: StreamFormat) -> Self {
        Self {
            ring,
            format,
            scratch_f32: vec![0.0; PRODUCER_CHUNK_SAMPLES],
            scratch_bytes: vec![0u8; PRODUCER_CHUNK_SAMPLES * 4],
        }
    }

    /// 协商好的源流格式
    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// 写入 interleaved f32 样本；阻塞直至写完或管线停止
    ///
    /// 返回实际写入的样本数
    pub fn write_frames(&mut self, samples: &[f32]) -> usize {
        let mut total = 0;
        for chunk in samples.chunks(PRODUCER_CHUNK_SAMPLES) {
            let n = f32_to_ne_bytes(chunk, &mut self.scratch_bytes);
            let written = self.ring.write(&self.scratch_bytes[..n * 4]);
            total += written / 4;
            if written < n * 4 {
                // 管线已停止
                break;
            }
        }
        total
    }

    /// 写入源格式的原始 PCM 字节（little-endian）
    ///
    /// 返回实际消费的输入字节数
    pub fn write_bytes(&mut self, bytes: &[u8]) -> usize {
        let bytes_per_sample = self.format.bytes_per_sample();
        let chunk_bytes = PRODUCER_CHUNK_SAMPLES * bytes_per_sample;
        let mut consumed = 0;

        while consumed < bytes.len() {
            let take = (bytes.len() - consumed).min(chunk_bytes);
            let n = self
                .format
                .bytes_to_f32(&bytes[consumed..consumed + take], &mut self.scratch_f32);
            if n == 0 {
                break;
            }
            let nb = f32_to_ne_bytes(&self.scratch_f32[..n], &mut self.scratch_bytes);
            let written = self.ring.write(&self.scratch_bytes[..nb * 4]);
            consumed += (written / 4) * bytes_per_sample;
            if written < nb * 4 {
                break;
            }
        }
        consumed
    }
}

/// 音频输出管线
pub struct AudioOutput {
    config: OutputConfig,
    backend: Option<Box<dyn DeviceBackend>>,

    device_format: Option<StreamFormat>,
    device_layout: Option<ChannelLayout>,
    /// 与生产者协商的源格式（可能是整数 PCM）
    stream_format: Option<StreamFormat>,
    stream_layout: Option<ChannelLayout>,

    ring: Option<Arc<RingBuffer>>,
    stats: Arc<RenderStats>,
    transport: Arc<Transport>,
    sustain: Arc<SustainFlag>,
    volume_bits: Arc<AtomicU32>,
    eq_settings: Arc<EqSettings>,

    event_tx: Sender<DeviceEvent>,
    event_rx: Receiver<DeviceEvent>,

    vis_tx: Option<VisSender>,
    vis_rx: Option<VisReceiver>,
}

impl AudioOutput {
    pub fn new(config: OutputConfig) -> Self {
        let (event_tx, event_rx) = bounded(EVENT_QUEUE_DEPTH);
        Self {
            config,
            backend: None,
            device_format: None,
            device_layout: None,
            stream_format: None,
            stream_layout: None,
            ring: None,
            stats: Arc::new(RenderStats::new()),
            transport: Arc::new(Transport::new()),
            sustain: Arc::new(SustainFlag::new()),
            volume_bits: Arc::new(AtomicU32::new(1.0f32.to_bits())),
            eq_settings: Arc::new(EqSettings::new()),
            event_tx,
            event_rx,
            vis_tx: None,
            vis_rx: None,
        }
    }

    /// 注入指定后端（测试与平台选择用）
    pub fn with_backend(config: OutputConfig, backend: Box<dyn DeviceBackend>) -> Self {
        let mut output = Self::new(config);
        output.backend = Some(backend);
        output
    }

    /// 协商设备格式并准备链路
    ///
    /// 失败即失败，不做部分设备绑定
    pub fn setup(&mut self) -> Result<(), OutputError> {
        if self.backend.is_none() {
            self.backend = Some(open_platform_backend(self.config.device_id)?);
        }
        let backend = self.backend.as_mut().expect("backend just ensured");
        backend.set_event_sender(self.event_tx.clone());

        let device_format = backend.native_format()?;
        device_format
            .validate()
            .map_err(OutputError::FormatNegotiationFailed)?;
        let device_layout = backend.channel_layout();

        log::info!(
            "Negotiated device format: {}Hz, {} channels ({})",
            device_format.sample_rate,
            device_format.channels,
            backend.descriptor().name
        );

        self.device_format = Some(device_format);
        self.device_layout = Some(device_layout);

        // 未显式协商时，流格式默认跟随设备
        if self.stream_format.is_none() {
            self.stream_format = Some(StreamFormat::new(
                device_format.sample_rate,
                SampleFormat::Float32,
                device_format.channels,
            ));
            self.stream_layout = Some(ChannelLayout::default_for(device_format.channels));
        }

        self.rebuild_ring()?;

        if self.config.vis_enabled && self.vis_tx.is_none() {
            let (vis_tx, vis_rx) = vis_channel(
                self.config.vis_blocks,
                VIS_BLOCK_FRAMES,
                device_format.sample_rate,
            );
            self.vis_tx = Some(vis_tx);
            self.vis_rx = Some(vis_rx);
        }

        Ok(())
    }

    /// 与上游协商生产者流格式（需处于停止状态）
    pub fn negotiate_stream_format(&mut self, format: StreamFormat) -> Result<(), OutputError> {
        if !self.transport.is_stopped() {
            return Err(OutputError::InvalidState(
                "stream format can only change while stopped",
            ));
        }
        format
            .validate()
            .map_err(OutputError::FormatNegotiationFailed)?;

        self.stream_format = Some(format);
        self.stream_layout = Some(ChannelLayout::default_for(format.channels));
        self.rebuild_ring()?;

        log::info!(
            "Negotiated stream format: {}Hz, {} channels, {:?}",
            format.sample_rate,
            format.channels,
            format.sample_format
        );
        Ok(())
    }

    /// 按目标延迟窗口给环形缓冲定容
    fn rebuild_ring(&mut self) -> Result<(), OutputError> {
        let stream = self
            .stream_format
            .ok_or(OutputError::InvalidState("stream format not negotiated"))?;
        // 传输表示恒为 f32，与源样本宽度无关
        let transport_bpf = stream.channels as usize * 4;
        let frames = (stream.sample_rate * self.config.latency_ms as f64 / 1000.0) as usize;
        let bytes = frames.max(1) * transport_bpf;
        self.ring = Some(Arc::new(RingBuffer::with_min_capacity(bytes)));
        Ok(())
    }

    /// 显式指定输出设备
    ///
    /// ID 无法解析为活跃设备时返回 DeviceUnavailable，原设备保持活跃
    pub fn set_output_device_by_id(&mut self, id: DeviceId) -> Result<(), OutputError> {
        let backend = open_platform_backend(Some(id))?;
        self.config.device_id = Some(id);
        self.adopt_backend(backend)
    }

    /// 按设备描述指定输出设备
    pub fn set_output_device_with_descriptor(
        &mut self,
        descriptor: &DeviceDescriptor,
    ) -> Result<(), OutputError> {
        self.set_output_device_by_id(descriptor.id)
    }

    /// 获取生产者写入柄（需先 setup）
    pub fn producer(&self) -> Result<Producer, OutputError> {
        let ring = self
            .ring
            .as_ref()
            .ok_or(OutputError::InvalidState("setup required before producer"))?;
        let format = self
            .stream_format
            .ok_or(OutputError::InvalidState("stream format not negotiated"))?;
        Ok(Producer::new(Arc::clone(ring), format))
    }

    /// 启动播放
    ///
    /// 前一上下文未停完时先同步完成其排空，避免设备所有权重叠
    pub fn start(&mut self) -> Result<(), OutputError> {
        if self.backend.is_none() || self.device_format.is_none() {
            return Err(OutputError::InvalidState("setup required before start"));
        }
        if !self.transport.is_stopped() {
            self.stop();
        }

        let ring = self
            .ring
            .as_ref()
            .ok_or(OutputError::InvalidState("ring buffer missing"))?;
        // 上次 stop 关闭过才清空重开；首次起播保留已预填充的数据
        if ring.is_closed() {
            ring.reopen();
        }
        ring.lock_memory();
        self.stats.reset();

        if !self.transport.begin_start() {
            return Err(OutputError::InvalidState("transport not stopped"));
        }

        let ctx = self.build_render_context();
        let backend = self.backend.as_mut().expect("backend checked above");
        match backend.start(ctx) {
            Ok(()) => {
                self.transport.mark_running();
                log::info!("Audio output started");
                Ok(())
            }
            Err(e) => {
                // 失败的 setup 不得遗留已注册的回调
                backend.stop();
                self.transport.request_stop();
                self.transport.mark_stopped();
                Err(e)
            }
        }
    }

    fn build_render_context(&self) -> RenderContext {
        let stream_format = self.stream_format.expect("negotiated in setup");
        let device_format = self.device_format.expect("negotiated in setup");
        let stream_layout = self
            .stream_layout
            .clone()
            .unwrap_or_else(|| ChannelLayout::default_for(stream_format.channels));
        let device_layout = self
            .device_layout
            .clone()
            .unwrap_or_else(|| ChannelLayout::default_for(device_format.channels));

        let period = self
            .backend
            .as_ref()
            .map(|b| b.period_frames())
            .unwrap_or(512);
        let max_frames = period.max(4096);

        RenderContext::new(
            Arc::clone(&self.transport),
            Arc::clone(self.ring.as_ref().expect("ring built in setup")),
            Arc::clone(&self.stats),
            Arc::clone(&self.sustain),
            Arc::clone(&self.volume_bits),
            // 环内传输表示恒为 f32
            StreamFormat::new(
                stream_format.sample_rate,
                SampleFormat::Float32,
                stream_format.channels,
            ),
            device_format,
            DownmixProcessor::new(stream_layout.clone(), device_layout),
            DownmixProcessor::to_mono(stream_layout),
            EqualizerStage::new(
                device_format.sample_rate,
                device_format.channels,
                Arc::clone(&self.eq_settings),
            ),
            self.vis_tx.clone(),
            max_frames,
        )
    }

    /// 暂停：回调在下一周期应答并转为整块静音，缓冲位置原样保留
    pub fn pause(&mut self) -> Result<(), OutputError> {
        if self.transport.request_pause() {
            log::info!("Pause requested");
            Ok(())
        } else {
            Err(OutputError::InvalidState("pause requires running"))
        }
    }

    /// 恢复：从暂停时的缓冲位置继续，无丢帧无重复
    pub fn resume(&mut self) -> Result<(), OutputError> {
        if self.transport.request_resume() {
            log::info!("Resume requested");
            Ok(())
        } else {
            Err(OutputError::InvalidState("resume requires paused"))
        }
    }

    /// 停止播放；幂等，任何状态下可调用
    ///
    /// 顺序保证：先唤醒阻塞中的生产者，再有界等待渲染应答，
    /// 最后才让后端释放设备资源
    pub fn stop(&mut self) {
        if self.transport.is_stopped() {
            return;
        }

        let initiated = self.transport.request_stop();
        if let Some(ring) = &self.ring {
            ring.close();
        }

        if initiated {
            let timeout = self.quiesce_timeout();
            if !self.transport.wait_render_quiesce(timeout) {
                // 回调线程可能已不再被调度（设备拔出），由后端停机兜底
                log::debug!("Render quiesce timed out after {:?}", timeout);
            }
            if let Some(backend) = self.backend.as_mut() {
                backend.stop();
            }
            self.transport.mark_stopped();
            log::info!("Audio output stopped");
        }
    }

    /// 停机等待预算：几个回调周期，上下限夹取
    fn quiesce_timeout(&self) -> Duration {
        let period_secs = match (self.device_format, self.backend.as_ref()) {
            (Some(format), Some(backend)) => {
                backend.period_frames() as f64 / format.sample_rate
            }
            _ => 0.01,
        };
        Duration::from_secs_f64((period_secs * 8.0).clamp(0.02, 0.5))
    }

    /// 重启：复用已协商格式；期间有设备变更则先重新协商
    pub fn restart(&mut self) -> Result<(), OutputError> {
        self.stop();
        self.handle_device_events()?;
        self.start()
    }

    /// 设置线性音量（0.0–1.0）
    pub fn set_volume(&self, volume: f64) {
        let clamped = volume.clamp(0.0, 1.0) as f32;
        self.volume_bits.store(clamped.to_bits(), Ordering::Relaxed);
    }

    /// 以 dB 设置音量（0 dB = 满幅）
    pub fn set_volume_db(&self, db: f64) {
        let linear = 10.0f64.powf(db / 20.0);
        self.set_volume(linear);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }

    /// 启停均衡级；切换经交叉淡化完成，无可闻咔哒声
    pub fn set_equalizer_enabled(&self, enabled: bool) {
        self.eq_settings.set_enabled(enabled);
        log::info!("Equalizer {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn eq_settings(&self) -> Arc<EqSettings> {
        Arc::clone(&self.eq_settings)
    }

    /// 标记当前数据块为扩展精度（HDCD 类）内容
    pub fn sustain_hdcd(&self) {
        self.sustain.raise();
    }

    /// 已交付帧数（含补静音帧）
    pub fn frames_rendered(&self) -> u64 {
        self.stats.frames_rendered()
    }

    /// 已交付字节数（按设备格式折算）
    pub fn bytes_rendered(&self) -> u64 {
        let bpf = self
            .device_format
            .map(|f| f.bytes_per_frame() as u64)
            .unwrap_or(0);
        self.stats.frames_rendered() * bpf
    }

    pub fn bytes_sustained(&self) -> u64 {
        self.stats.bytes_sustained()
    }

    pub fn underrun_count(&self) -> u64 {
        self.stats.underrun_count()
    }

    pub fn stats_report(&self) -> StatsReport {
        self.stats.report()
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport.state()
    }

    pub fn device_format(&self) -> Option<StreamFormat> {
        self.device_format
    }

    pub fn device_descriptor(&self) -> Option<DeviceDescriptor> {
        self.backend.as_ref().map(|b| b.descriptor())
    }

    /// 取走可视化接收端（应用侧消费）
    pub fn take_vis_receiver(&mut self) -> Option<VisReceiver> {
        self.vis_rx.take()
    }

    /// 处理积压的设备事件（控制线程调用）
    ///
    /// 通知线程只投递事件，所有共享状态的变更都发生在这里
    pub fn handle_device_events(&mut self) -> Result<(), OutputError> {
        let mut latest = None;
        while let Ok(event) = self.event_rx.try_recv() {
            latest = Some(event);
        }
        let Some(event) = latest else {
            return Ok(());
        };
        log::info!("Device event: {:?}", event);

        if event == DeviceEvent::DefaultDeviceChanged && self.config.device_id.is_none() {
            // 跟随默认设备：重开后端；新默认设备打不开时保留旧设备
            match open_platform_backend(None) {
                Ok(backend) => return self.adopt_backend(backend),
                Err(e) => {
                    log::warn!("Default device changed but reopen failed: {}", e);
                    return Ok(());
                }
            }
        }

        self.refresh_device_format()
    }

    /// 重新查询设备格式；确有变化时做恰好一次链路重建
    fn refresh_device_format(&mut self) -> Result<(), OutputError> {
        let backend = self
            .backend
            .as_mut()
            .ok_or(OutputError::InvalidState("setup required"))?;
        let format = backend.native_format()?;
        format
            .validate()
            .map_err(OutputError::FormatNegotiationFailed)?;

        if self.device_format == Some(format) {
            return Ok(());
        }

        let layout = backend.channel_layout();
        let was_active = self.transport.is_engaged();
        let was_paused = matches!(
            self.transport.state(),
            TransportState::Pausing | TransportState::Paused
        );
        self.stop();

        // 整体替换，不做原地修改
        self.device_format = Some(format);
        self.device_layout = Some(layout);
        log::info!(
            "Device format changed: {}Hz, {} channels",
            format.sample_rate,
            format.channels
        );

        if was_active {
            self.start()?;
            // 重建不改变调用方的传输意图：原本暂停的流保持暂停
            if was_paused {
                let _ = self.transport.request_pause();
            }
        }
        Ok(())
    }

    /// 切换到新后端并重建链路；播放不中断（至多一个周期静音）
    fn adopt_backend(&mut self, mut backend: Box<dyn DeviceBackend>) -> Result<(), OutputError> {
        backend.set_event_sender(self.event_tx.clone());
        let format = backend.native_format()?;
        format
            .validate()
            .map_err(OutputError::FormatNegotiationFailed)?;
        let layout = backend.channel_layout();

        let was_active = self.transport.is_engaged();
        let was_paused = matches!(
            self.transport.state(),
            TransportState::Pausing | TransportState::Paused
        );
        self.stop();

        self.backend = Some(backend);
        self.device_format = Some(format);
        self.device_layout = Some(layout);
        log::info!(
            "Output device now: {} ({}Hz, {}ch)",
            self.backend.as_ref().map(|b| b.descriptor().name).unwrap_or_default(),
            format.sample_rate,
            format.channels
        );

        if was_active {
            self.start()?;
            // 换设备同样不改变传输意图：暂停的流在新设备上保持暂停
            if was_paused {
                let _ = self.transport.request_pause();
            }
        }
        Ok(())
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::{VirtualBackend, VirtualHandle};
    use std::sync::Mutex;
    use std::thread;

    fn virtual_output(
        sample_rate: f64,
        channels: u16,
        period: usize,
        config: OutputConfig,
    ) -> (AudioOutput, VirtualHandle) {
        let backend = VirtualBackend::new(sample_rate, channels, period);
        let handle = backend.handle();
        let output = AudioOutput::with_backend(config, Box::new(backend));
        (output, handle)
    }

    #[test]
    fn test_setup_fails_closed_on_bad_format() {
        let (mut output, _handle) =
            virtual_output(0.0, 2, 64, OutputConfig::default());
        let result = output.setup();
        assert!(matches!(
            result,
            Err(OutputError::FormatNegotiationFailed(_))
        ));
        // 不做半绑定：启动被拒绝
        assert!(output.start().is_err());
    }

    #[test]
    fn test_start_then_immediate_stop_is_silent() {
        let (mut output, handle) =
            virtual_output(48000.0, 2, 64, OutputConfig::default());

        let peak = Arc::new(Mutex::new(0.0f32));
        let blocks = Arc::new(Mutex::new(0usize));
        {
            let peak = Arc::clone(&peak);
            let blocks = Arc::clone(&blocks);
            handle.set_sink(move |block, _frames| {
                let mut max = peak.lock().unwrap();
                for &sample in block {
                    if sample.abs() > *max {
                        *max = sample.abs();
                    }
                }
                *blocks.lock().unwrap() += 1;
            });
        }

        output.setup().unwrap();
        output.start().unwrap();
        output.stop();

        // 有界回到 Stopped，且没有任何非静音帧到达设备
        assert_eq!(output.transport_state(), TransportState::Stopped);
        assert_eq!(*peak.lock().unwrap(), 0.0);

        // stop 幂等
        output.stop();
        assert_eq!(output.transport_state(), TransportState::Stopped);
    }

    #[test]
    fn test_producer_unblocked_on_stop() {
        let config = OutputConfig {
            latency_ms: 1, // 极小缓冲，保证生产者会被背压阻塞
            vis_enabled: false,
            ..OutputConfig::default()
        };
        let (mut output, _handle) = virtual_output(48000.0, 2, 64, config);
        output.setup().unwrap();
        output.start().unwrap();
        output.pause().unwrap(); // 暂停后回调不再消费，生产者必然填满缓冲

        let mut producer = output.producer().unwrap();
        let writer = thread::spawn(move || {
            // 远超容量的写入：先阻塞，stop 后必须返回而不是挂死
            producer.write_frames(&vec![0.5f32; 48000])
        });

        thread::sleep(Duration::from_millis(50));
        output.stop();

        let written = writer.join().expect("producer must not hang");
        assert!(written < 48000);
    }

    #[test]
    fn test_device_format_change_rebuilds_once() {
        let (mut output, handle) =
            virtual_output(48000.0, 2, 64, OutputConfig::default());
        output.setup().unwrap();
        output.start().unwrap();
        assert_eq!(handle.start_count(), 1);

        handle.simulate_format_change(44100.0, 1);
        output.handle_device_events().unwrap();

        // 恰好一次链路重建，deviceFormat 整体替换，播放继续
        assert_eq!(handle.start_count(), 2);
        let format = output.device_format().unwrap();
        assert_eq!(format.sample_rate, 44100.0);
        assert_eq!(format.channels, 1);
        assert_eq!(output.transport_state(), TransportState::Running);

        // 事件已被清空：再次处理不再重建
        output.handle_device_events().unwrap();
        assert_eq!(handle.start_count(), 2);

        output.stop();
    }

    #[test]
    fn test_format_change_preserves_pause() {
        let (mut output, handle) =
            virtual_output(48000.0, 2, 64, OutputConfig::default());
        output.setup().unwrap();
        output.start().unwrap();
        output.pause().unwrap();

        handle.simulate_format_change(44100.0, 2);
        output.handle_device_events().unwrap();

        // 链路重建，但不得擅自恢复用户暂停的播放
        assert_eq!(handle.start_count(), 2);
        assert!(matches!(
            output.transport_state(),
            TransportState::Pausing | TransportState::Paused
        ));

        // 用户显式 resume 后才继续
        output.resume().unwrap();
        output.stop();
    }

    #[test]
    fn test_format_change_while_stopped_defers_start() {
        let (mut output, handle) =
            virtual_output(48000.0, 2, 64, OutputConfig::default());
        output.setup().unwrap();

        handle.simulate_format_change(96000.0, 2);
        output.handle_device_events().unwrap();

        // 停止状态下只更新格式，不自行起播
        assert_eq!(output.transport_state(), TransportState::Stopped);
        assert_eq!(output.device_format().unwrap().sample_rate, 96000.0);
        assert_eq!(handle.start_count(), 0);
    }

    #[test]
    fn test_restart_resets_counters() {
        let (mut output, _handle) =
            virtual_output(48000.0, 2, 64, OutputConfig::default());
        output.setup().unwrap();
        output.start().unwrap();

        output.sustain_hdcd();
        let mut producer = output.producer().unwrap();
        producer.write_frames(&vec![0.1f32; 4096]);
        thread::sleep(Duration::from_millis(30));

        output.restart().unwrap();
        // 重启是唯一允许 sustain 归零的时刻
        assert_eq!(output.bytes_sustained(), 0);
        assert_eq!(output.transport_state(), TransportState::Running);
        output.stop();
    }

    #[test]
    fn test_volume_clamped() {
        let (output, _handle) = virtual_output(48000.0, 2, 64, OutputConfig::default());
        output.set_volume(2.5);
        assert_eq!(output.volume(), 1.0);
        output.set_volume(-1.0);
        assert_eq!(output.volume(), 0.0);

        // -6 dB ≈ 0.501
        output.set_volume_db(-6.0);
        assert!((output.volume() - 0.501).abs() < 0.01);
    }

    #[test]
    fn test_negotiate_requires_stopped() {
        let (mut output, _handle) =
            virtual_output(48000.0, 2, 64, OutputConfig::default());
        output.setup().unwrap();
        output.start().unwrap();

        let format = StreamFormat::new(44100.0, SampleFormat::Int16, 2);
        assert!(matches!(
            output.negotiate_stream_format(format),
            Err(OutputError::InvalidState(_))
        ));

        output.stop();
        assert!(output.negotiate_stream_format(format).is_ok());
        assert_eq!(output.producer().unwrap().format().sample_format, SampleFormat::Int16);
    }

    #[test]
    fn test_playback_delivers_producer_samples() {
        let (mut output, handle) =
            virtual_output(48000.0, 1, 64, OutputConfig::default());

        let collected: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let collected = Arc::clone(&collected);
            handle.set_sink(move |block, _| {
                collected.lock().unwrap().extend_from_slice(block);
            });
        }

        output.setup().unwrap();

        // 先预填充，再起播，避免前导 underrun 干扰断言
        let mut producer = output.producer().unwrap();
        let payload: Vec<f32> = (1..=2048).map(|i| i as f32 / 4096.0).collect();
        producer.write_frames(&payload);

        output.start().unwrap();
        thread::sleep(Duration::from_millis(120));
        output.stop();

        let samples = collected.lock().unwrap();
        let nonzero: Vec<f32> = samples.iter().copied().filter(|&s| s != 0.0).collect();
        // 非静音样本按原序到达设备，无丢帧无重复
        assert!(!nonzero.is_empty(), "expected audio to reach the device");
        assert_eq!(&nonzero[..], &payload[..nonzero.len()]);
    }
}
