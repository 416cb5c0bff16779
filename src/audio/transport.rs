//! 传输状态机
//!
//! 状态唯一属主：控制线程经本模块方法发起迁移，渲染回调在
//! `render_observe` 中应答 Pausing→Paused / Resuming→Running，
//! 其他组件只能读到窄化的投影，绝不直接改状态。
//!
//! stop 必须等到渲染回调应答（有界等待）后才允许释放设备资源，
//! 避免回调触碰已释放的设备。

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// 传输状态
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Pausing = 3,
    Paused = 4,
    Resuming = 5,
    Stopping = 6,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Pausing,
            4 => Self::Paused,
            5 => Self::Resuming,
            6 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// 渲染回调看到的投影
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderDecision {
    /// 从缓冲区取数据渲染
    Produce,
    /// 本周期输出静音
    Silence,
}

/// 传输状态机
pub struct Transport {
    state: AtomicU8,
    /// 渲染回调在 Stopping 状态下置位的停机应答
    quiesce_acked: AtomicBool,
}

impl Transport {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(TransportState::Stopped as u8),
            quiesce_acked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.state() == TransportState::Stopped
    }

    /// 迁移是否处于会产生/将产生音频的阶段
    pub fn is_engaged(&self) -> bool {
        matches!(
            self.state(),
            TransportState::Starting
                | TransportState::Running
                | TransportState::Pausing
                | TransportState::Paused
                | TransportState::Resuming
        )
    }

    fn transition(&self, from: TransportState, to: TransportState) -> bool {
        self.state
            .compare_exchange(
                from as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Stopped → Starting
    pub fn begin_start(&self) -> bool {
        if self.transition(TransportState::Stopped, TransportState::Starting) {
            self.quiesce_acked.store(false, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Starting → Running（设备就绪后由控制线程调用）
    pub fn mark_running(&self) -> bool {
        self.transition(TransportState::Starting, TransportState::Running)
    }

    /// Running → Pausing
    pub fn request_pause(&self) -> bool {
        self.transition(TransportState::Running, TransportState::Pausing)
    }

    /// Paused → Resuming（Pausing 尚未被应答时直接拉回 Running）
    pub fn request_resume(&self) -> bool {
        self.transition(TransportState::Paused, TransportState::Resuming)
            || self.transition(TransportState::Pausing, TransportState::Running)
    }

    /// 任意状态请求停止；幂等
    ///
    /// 返回 true 表示本次调用发起了停机，调用方必须完成
    /// teardown 并以 `mark_stopped` 收尾
    pub fn request_stop(&self) -> bool {
        loop {
            let current = self.state();
            match current {
                TransportState::Stopped | TransportState::Stopping => return false,
                _ => {
                    if self.transition(current, TransportState::Stopping) {
                        return true;
                    }
                    // 与渲染应答竞争，重读后重试
                }
            }
        }
    }

    /// Stopping → Stopped（设备与线程释放完毕后由控制线程调用）
    pub fn mark_stopped(&self) {
        self.state
            .store(TransportState::Stopped as u8, Ordering::Release);
    }

    /// 渲染回调每周期调用一次：应答迁移并返回渲染决策
    ///
    /// 非 Running 阶段一律静音
    #[inline]
    pub fn render_observe(&self) -> RenderDecision {
        match self.state() {
            TransportState::Running => RenderDecision::Produce,
            TransportState::Resuming => {
                // 应答恢复：从暂停时的缓冲位置继续
                let _ = self.transition(TransportState::Resuming, TransportState::Running);
                RenderDecision::Produce
            }
            TransportState::Pausing => {
                let _ = self.transition(TransportState::Pausing, TransportState::Paused);
                RenderDecision::Silence
            }
            TransportState::Stopping => {
                self.quiesce_acked.store(true, Ordering::Release);
                RenderDecision::Silence
            }
            TransportState::Stopped | TransportState::Starting | TransportState::Paused => {
                RenderDecision::Silence
            }
        }
    }

    /// 有界等待渲染回调应答停机
    ///
    /// 回调线程可能已经不再被调度（设备拔出等），超时即返回，
    /// 不允许无界阻塞 teardown 路径
    pub fn wait_render_quiesce(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.quiesce_acked.load(Ordering::Acquire) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_sequence() {
        let transport = Transport::new();
        assert_eq!(transport.state(), TransportState::Stopped);

        assert!(transport.begin_start());
        assert_eq!(transport.state(), TransportState::Starting);
        // Starting 阶段回调静音
        assert_eq!(transport.render_observe(), RenderDecision::Silence);

        assert!(transport.mark_running());
        assert_eq!(transport.render_observe(), RenderDecision::Produce);
    }

    #[test]
    fn test_start_requires_stopped() {
        let transport = Transport::new();
        assert!(transport.begin_start());
        // 重复 start 被拒绝
        assert!(!transport.begin_start());
    }

    #[test]
    fn test_pause_resume_handshake() {
        let transport = Transport::new();
        transport.begin_start();
        transport.mark_running();

        assert!(transport.request_pause());
        assert_eq!(transport.state(), TransportState::Pausing);

        // 回调观察到 Pausing → 应答为 Paused 并静音
        assert_eq!(transport.render_observe(), RenderDecision::Silence);
        assert_eq!(transport.state(), TransportState::Paused);

        assert!(transport.request_resume());
        assert_eq!(transport.state(), TransportState::Resuming);

        // 回调观察到 Resuming → 立即恢复产出
        assert_eq!(transport.render_observe(), RenderDecision::Produce);
        assert_eq!(transport.state(), TransportState::Running);
    }

    #[test]
    fn test_resume_before_pause_ack() {
        let transport = Transport::new();
        transport.begin_start();
        transport.mark_running();
        transport.request_pause();

        // 回调还没应答 Pausing 时立刻 resume：直接拉回 Running
        assert!(transport.request_resume());
        assert_eq!(transport.state(), TransportState::Running);
    }

    #[test]
    fn test_stop_idempotent_from_any_state() {
        let transport = Transport::new();
        // Stopped 状态下 stop 是无操作
        assert!(!transport.request_stop());

        transport.begin_start();
        transport.mark_running();
        assert!(transport.request_stop());
        // 重复 stop 不再发起第二次 teardown
        assert!(!transport.request_stop());

        transport.mark_stopped();
        assert_eq!(transport.state(), TransportState::Stopped);
    }

    #[test]
    fn test_quiesce_handshake() {
        let transport = Transport::new();
        transport.begin_start();
        transport.mark_running();
        transport.request_stop();

        // 未应答时有界等待超时返回 false，不挂死
        assert!(!transport.wait_render_quiesce(Duration::from_millis(5)));

        // 回调应答后等待立即成功
        assert_eq!(transport.render_observe(), RenderDecision::Silence);
        assert!(transport.wait_render_quiesce(Duration::from_millis(5)));
    }

    #[test]
    fn test_pause_requires_running() {
        let transport = Transport::new();
        assert!(!transport.request_pause());
        assert!(!transport.request_resume());
    }
}
