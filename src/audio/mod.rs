//! 音频输出核心模块
//!
//! 包含：
//! - Format: 流格式与声道布局
//! - Downmix: 声道下混矩阵
//! - Ring Buffer: 字节环形缓冲 + 流控信号量
//! - Eq: 图示均衡器
//! - Stats: 渲染统计与 sustain 记账
//! - Vis: 可视化数据通道
//! - Transport: 传输状态机
//! - Render: 实时回调主体
//! - Device: 设备后端抽象（macOS 为 Core Audio AUHAL）
//! - Output: 输出控制器

pub mod device;
pub mod downmix;
pub mod eq;
pub mod format;
pub mod output;
pub mod render;
pub mod ring_buffer;
pub mod stats;
pub mod transport;
pub mod vis;

#[cfg(target_os = "macos")]
pub mod coreaudio;

pub use device::{DeviceBackend, DeviceDescriptor, DeviceEvent, DeviceId};
pub use downmix::DownmixProcessor;
pub use eq::{EqSettings, EqualizerStage};
pub use format::{ChannelLayout, ChannelRole, SampleFormat, StreamFormat};
pub use output::{AudioOutput, OutputConfig, OutputError, Producer};
pub use render::RenderContext;
pub use ring_buffer::RingBuffer;
pub use stats::{RenderStats, StatsReport};
pub use transport::{Transport, TransportState};
pub use vis::{VisBlock, VisReceiver, VisSender};
