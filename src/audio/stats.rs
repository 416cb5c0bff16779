//! 渲染统计
//!
//! 回调内只做原子递增，采用降频采样策略收集水位，
//! 所有操作 lock-free，可在实时回调中调用

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use super::ring_buffer::RingBuffer;

/// 水位采样间隔：每 N 次 callback 才采样一次
const SAMPLE_INTERVAL: u64 = 16;

/// 水位缓冲区大小
const WATER_LEVEL_SLOTS: usize = 64;

/// 渲染统计收集器
///
/// - `frames_rendered`：交付给设备的帧数（含补静音），单调递增
/// - `bytes_sustained`：扩展精度（HDCD 类）内容的字节数，只在回调内累加，
///   仅流重启时归零
/// - `underrun_count`：补静音事件计数，对调用方不可见为错误
pub struct RenderStats {
    callback_count: AtomicU64,
    frames_rendered: AtomicU64,
    bytes_sustained: AtomicU64,
    underrun_count: AtomicU64,

    // 水位降频采样（监控缓冲余量，诊断 underrun 趋势）
    water_level: Box<[AtomicUsize; WATER_LEVEL_SLOTS]>,
    water_level_idx: AtomicUsize,
}

impl RenderStats {
    pub fn new() -> Self {
        Self {
            callback_count: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
            bytes_sustained: AtomicU64::new(0),
            underrun_count: AtomicU64::new(0),
            water_level: Box::new(std::array::from_fn(|_| AtomicUsize::new(0))),
            water_level_idx: AtomicUsize::new(0),
        }
    }

    /// 回调入口统计；只在采样点读取水位
    #[inline]
    pub fn on_callback(&self, ring: &RingBuffer) {
        let count = self.callback_count.fetch_add(1, Ordering::Relaxed);
        if count % SAMPLE_INTERVAL == 0 {
            let level = ring.data_len();
            let idx =
                self.water_level_idx.fetch_add(1, Ordering::Relaxed) % WATER_LEVEL_SLOTS;
            self.water_level[idx].store(level, Ordering::Relaxed);
        }
    }

    /// 累加交付帧数（补静音的帧也计入）
    #[inline]
    pub fn add_frames_rendered(&self, frames: u64) {
        self.frames_rendered.fetch_add(frames, Ordering::Relaxed);
    }

    /// 累加扩展精度内容字节数
    #[inline]
    pub fn add_bytes_sustained(&self, bytes: u64) {
        self.bytes_sustained.fetch_add(bytes, Ordering::Relaxed);
    }

    /// 记录 underrun
    #[inline]
    pub fn record_underrun(&self) {
        self.underrun_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_sustained(&self) -> u64 {
        self.bytes_sustained.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    /// 重置统计（仅流重启时调用）
    pub fn reset(&self) {
        self.callback_count.store(0, Ordering::Relaxed);
        self.frames_rendered.store(0, Ordering::Relaxed);
        self.bytes_sustained.store(0, Ordering::Relaxed);
        self.underrun_count.store(0, Ordering::Relaxed);
        self.water_level_idx.store(0, Ordering::Relaxed);
        for slot in self.water_level.iter() {
            slot.store(0, Ordering::Relaxed);
        }
    }

    /// 生成报告
    pub fn report(&self) -> StatsReport {
        let mut water_min = usize::MAX;
        let mut water_max = 0usize;
        let mut sampled = false;
        for slot in self.water_level.iter() {
            let level = slot.load(Ordering::Relaxed);
            if level > 0 {
                sampled = true;
                water_min = water_min.min(level);
                water_max = water_max.max(level);
            }
        }
        if !sampled {
            water_min = 0;
        }

        StatsReport {
            callback_count: self.callback_count(),
            frames_rendered: self.frames_rendered(),
            bytes_sustained: self.bytes_sustained(),
            underrun_count: self.underrun_count(),
            water_level_min: water_min,
            water_level_max: water_max,
        }
    }
}

impl Default for RenderStats {
    fn default() -> Self {
        Self::new()
    }
}

/// HDCD sustain 挂起标志
///
/// 控制面调用 `sustain_hdcd()` 置位，渲染回调对下一个非空数据块
/// 做一次性消费并把块字节数计入 sustain 计数
pub struct SustainFlag {
    pending: AtomicBool,
}

impl SustainFlag {
    pub fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
        }
    }

    /// 标记当前数据块为扩展精度内容
    #[inline]
    pub fn raise(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// 回调内一次性消费标志
    #[inline]
    pub fn consume(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}

impl Default for SustainFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub callback_count: u64,
    pub frames_rendered: u64,
    pub bytes_sustained: u64,
    pub underrun_count: u64,
    pub water_level_min: usize,
    pub water_level_max: usize,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Render Statistics")?;
        writeln!(f, "=================")?;
        writeln!(f, "Total callbacks: {}", self.callback_count)?;
        writeln!(f, "Frames rendered: {}", self.frames_rendered)?;
        writeln!(f, "HDCD bytes sustained: {}", self.bytes_sustained)?;
        writeln!(f, "Underruns: {}", self.underrun_count)?;
        writeln!(
            f,
            "Ring water level: {} .. {} bytes",
            self.water_level_min, self.water_level_max
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = RenderStats::new();
        stats.add_frames_rendered(512);
        stats.add_frames_rendered(512);
        stats.record_underrun();
        assert_eq!(stats.frames_rendered(), 1024);
        assert_eq!(stats.underrun_count(), 1);

        stats.reset();
        assert_eq!(stats.frames_rendered(), 0);
        assert_eq!(stats.underrun_count(), 0);
    }

    #[test]
    fn test_sustain_only_increases() {
        let stats = RenderStats::new();
        assert_eq!(stats.bytes_sustained(), 0);

        stats.add_bytes_sustained(4096);
        stats.add_bytes_sustained(2048);
        assert_eq!(stats.bytes_sustained(), 6144);

        // 只有重启归零
        stats.reset();
        assert_eq!(stats.bytes_sustained(), 0);
    }

    #[test]
    fn test_sustain_flag_single_shot() {
        let flag = SustainFlag::new();
        assert!(!flag.consume());

        flag.raise();
        assert!(flag.consume());
        // 一次性：第二次消费返回 false
        assert!(!flag.consume());
    }

    #[test]
    fn test_water_level_sampling() {
        let stats = RenderStats::new();
        let ring = RingBuffer::new(64);
        ring.write(&[0u8; 32]);

        for _ in 0..(SAMPLE_INTERVAL * 2) {
            stats.on_callback(&ring);
        }

        let report = stats.report();
        assert_eq!(report.water_level_max, 32);
        assert_eq!(report.callback_count, SAMPLE_INTERVAL * 2);
    }
}
