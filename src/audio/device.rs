//! 输出设备抽象
//!
//! 设备/操作系统协作者的统一接口：原生格式查询、回调注册、启停、
//! 变更通知。通知在任意系统线程产生，只允许经 channel 交回控制线程，
//! 不得在通知线程上直接改共享状态。
//!
//! `VirtualBackend` 用独立线程模拟硬件时钟，供非 macOS 平台与测试使用；
//! macOS 上由 coreaudio 模块提供真实 AUHAL 后端。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;

use super::format::{ChannelLayout, SampleFormat, StreamFormat};
use super::output::OutputError;
use super::render::RenderContext;

pub type DeviceId = u32;

/// 虚拟设备的固定 ID
pub const VIRTUAL_DEVICE_ID: DeviceId = 1;

/// 设备描述
#[derive(Clone, Debug)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub name: String,
    pub sample_rate: f64,
    pub channels: u16,
}

/// 设备事件
///
/// 在任意系统回调线程产生，经 bounded channel 交回控制路径处理
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    DefaultDeviceChanged,
    FormatChanged,
}

/// 输出设备后端
///
/// `stop` 返回后必须保证渲染回调不会再被调用，
/// 调用方据此安全释放下游资源
pub trait DeviceBackend: Send {
    fn descriptor(&self) -> DeviceDescriptor;

    /// 查询设备当前原生流格式
    fn native_format(&self) -> Result<StreamFormat, OutputError>;

    /// 设备声道布局
    fn channel_layout(&self) -> ChannelLayout {
        ChannelLayout::default_for(self.descriptor().channels)
    }

    /// 每回调周期帧数
    fn period_frames(&self) -> usize;

    /// 注册设备事件通道
    fn set_event_sender(&mut self, sender: Sender<DeviceEvent>);

    /// 启动硬件回调；上下文所有权交给回调线程
    fn start(&mut self, ctx: RenderContext) -> Result<(), OutputError>;

    /// 停止回调；返回后回调保证不再执行
    fn stop(&mut self);
}

/// 打开平台默认后端
#[cfg(target_os = "macos")]
pub fn open_platform_backend(
    device_id: Option<DeviceId>,
) -> Result<Box<dyn DeviceBackend>, OutputError> {
    Ok(Box::new(super::coreaudio::CoreAudioBackend::open(
        device_id,
    )?))
}

/// 打开平台默认后端（非 macOS：虚拟设备）
#[cfg(not(target_os = "macos"))]
pub fn open_platform_backend(
    device_id: Option<DeviceId>,
) -> Result<Box<dyn DeviceBackend>, OutputError> {
    if let Some(id) = device_id {
        if id != VIRTUAL_DEVICE_ID {
            return Err(OutputError::DeviceUnavailable(id));
        }
    }
    Ok(Box::new(VirtualBackend::new(48000.0, 2, 512)))
}

type Sink = Box<dyn FnMut(&[f32], usize) + Send>;

struct VirtualShared {
    descriptor: Mutex<DeviceDescriptor>,
    format: Mutex<StreamFormat>,
    period_frames: usize,
    running: AtomicBool,
    /// 回调线程启动次数（链路重建计数，测试用）
    starts: AtomicUsize,
    events: Mutex<Option<Sender<DeviceEvent>>>,
    sink: Mutex<Option<Sink>>,
}

/// 虚拟输出设备
///
/// 独立线程按周期驱动渲染上下文，扮演硬件时钟；
/// 输出块交给可选的 sink（测试收集、演示丢弃）
pub struct VirtualBackend {
    shared: Arc<VirtualShared>,
    worker: Option<JoinHandle<()>>,
}

/// 虚拟设备控制柄
///
/// 后端装箱交给控制器后，测试仍可通过控制柄注入 sink、
/// 模拟设备格式变更
#[derive(Clone)]
pub struct VirtualHandle {
    shared: Arc<VirtualShared>,
}

impl VirtualBackend {
    pub fn new(sample_rate: f64, channels: u16, period_frames: usize) -> Self {
        let shared = Arc::new(VirtualShared {
            descriptor: Mutex::new(DeviceDescriptor {
                id: VIRTUAL_DEVICE_ID,
                name: "Virtual Output".to_string(),
                sample_rate,
                channels,
            }),
            format: Mutex::new(StreamFormat::new(
                sample_rate,
                SampleFormat::Float32,
                channels,
            )),
            period_frames,
            running: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            events: Mutex::new(None),
            sink: Mutex::new(None),
        });

        Self {
            shared,
            worker: None,
        }
    }

    pub fn handle(&self) -> VirtualHandle {
        VirtualHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl VirtualHandle {
    /// 注入输出接收器（测试收集渲染结果用）
    pub fn set_sink(&self, sink: impl FnMut(&[f32], usize) + Send + 'static) {
        *self.shared.sink.lock().unwrap() = Some(Box::new(sink));
    }

    /// 模拟设备格式变更：更新原生格式并向控制路径发事件
    pub fn simulate_format_change(&self, sample_rate: f64, channels: u16) {
        {
            let mut format = self.shared.format.lock().unwrap();
            *format = StreamFormat::new(sample_rate, SampleFormat::Float32, channels);
        }
        {
            let mut descriptor = self.shared.descriptor.lock().unwrap();
            descriptor.sample_rate = sample_rate;
            descriptor.channels = channels;
        }
        if let Some(sender) = self.shared.events.lock().unwrap().as_ref() {
            let _ = sender.try_send(DeviceEvent::FormatChanged);
        }
    }

    /// 回调线程启动次数
    pub fn start_count(&self) -> usize {
        self.shared.starts.load(Ordering::Acquire)
    }
}

impl DeviceBackend for VirtualBackend {
    fn descriptor(&self) -> DeviceDescriptor {
        self.shared.descriptor.lock().unwrap().clone()
    }

    fn native_format(&self) -> Result<StreamFormat, OutputError> {
        Ok(*self.shared.format.lock().unwrap())
    }

    fn period_frames(&self) -> usize {
        self.shared.period_frames
    }

    fn set_event_sender(&mut self, sender: Sender<DeviceEvent>) {
        *self.shared.events.lock().unwrap() = Some(sender);
    }

    fn start(&mut self, mut ctx: RenderContext) -> Result<(), OutputError> {
        if self.worker.is_some() {
            return Err(OutputError::InvalidState("backend already started"));
        }

        self.shared.running.store(true, Ordering::Release);
        self.shared.starts.fetch_add(1, Ordering::AcqRel);

        let shared = Arc::clone(&self.shared);
        let worker = thread::Builder::new()
            .name("audio-io".to_string())
            .spawn(move || {
                let frames = shared.period_frames;
                let device_format = ctx.device_format();
                let channels = device_format.channels as usize;
                let period = Duration::from_nanos(
                    (frames as f64 / device_format.sample_rate * 1_000_000_000.0) as u64,
                );
                let mut block = vec![0.0f32; frames * channels];

                while shared.running.load(Ordering::Acquire) {
                    ctx.render(&mut block, frames);
                    if let Ok(mut guard) = shared.sink.lock() {
                        if let Some(sink) = guard.as_mut() {
                            sink(&block, frames);
                        }
                    }
                    thread::sleep(period);
                }
            })
            .map_err(|_| OutputError::ResourceFailure("failed to spawn audio-io thread"))?;

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            // join 返回即保证回调不再执行
            let _ = worker.join();
        }
    }
}

impl Drop for VirtualBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_descriptor() {
        let backend = VirtualBackend::new(44100.0, 2, 256);
        let descriptor = backend.descriptor();
        assert_eq!(descriptor.id, VIRTUAL_DEVICE_ID);
        assert_eq!(descriptor.channels, 2);

        let format = backend.native_format().unwrap();
        assert_eq!(format.sample_rate, 44100.0);
        assert!(format.validate().is_ok());
    }

    #[test]
    fn test_simulate_format_change_emits_event() {
        let mut backend = VirtualBackend::new(48000.0, 2, 256);
        let handle = backend.handle();
        let (tx, rx) = crossbeam_channel::bounded(4);
        backend.set_event_sender(tx);

        handle.simulate_format_change(96000.0, 6);

        assert_eq!(rx.try_recv().unwrap(), DeviceEvent::FormatChanged);
        let format = backend.native_format().unwrap();
        assert_eq!(format.sample_rate, 96000.0);
        assert_eq!(format.channels, 6);
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_unknown_device_id_fails_closed() {
        let result = open_platform_backend(Some(99));
        assert!(matches!(result, Err(OutputError::DeviceUnavailable(99))));
    }
}
