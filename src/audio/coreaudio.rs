//! Core Audio AUHAL 后端
//!
//! 使用 AudioUnit HAL (AUHAL) 实现输出：
//! - 查询设备原生格式（标称采样率 + 流声道配置）
//! - 注册默认设备/格式变更监听，事件经 channel 交回控制线程
//! - render callback 直接驱动 RenderContext，Float32 interleaved
//!
//! 监听回调运行在系统任意线程上，这里只投递事件，绝不直接改共享状态

use std::ffi::c_void;
use std::ptr;

use crossbeam_channel::Sender;

use super::device::{DeviceBackend, DeviceDescriptor, DeviceEvent, DeviceId};
use super::format::{SampleFormat, StreamFormat};
use super::output::OutputError;
use super::render::RenderContext;

type AudioObjectID = u32;
type AudioObjectPropertySelector = u32;
type AudioObjectPropertyScope = u32;
type AudioObjectPropertyElement = u32;
type OSStatus = i32;
type AudioUnit = *mut c_void;
type AudioComponentInstance = AudioUnit;
type AudioComponent = *mut c_void;

const K_AUDIO_OBJECT_SYSTEM_OBJECT: AudioObjectID = 1;
const K_AUDIO_HARDWARE_PROPERTY_DEVICES: AudioObjectPropertySelector = 0x64657623; // 'dev#'
const K_AUDIO_HARDWARE_PROPERTY_DEFAULT_OUTPUT_DEVICE: AudioObjectPropertySelector = 0x644F7574; // 'dOut'
const K_AUDIO_DEVICE_PROPERTY_NOMINAL_SAMPLE_RATE: AudioObjectPropertySelector = 0x6E737274; // 'nsrt'
const K_AUDIO_DEVICE_PROPERTY_BUFFER_FRAME_SIZE: AudioObjectPropertySelector = 0x6673697A; // 'fsiz'
const K_AUDIO_DEVICE_PROPERTY_STREAM_CONFIGURATION: AudioObjectPropertySelector = 0x736C6179; // 'slay'

const K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT: AudioObjectPropertyScope = 0x6F757470; // 'outp'
const K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL: AudioObjectPropertyScope = 0x676C6F62; // 'glob'
const K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN: AudioObjectPropertyElement = 0;

const K_AUDIO_FORMAT_LINEAR_PCM: u32 = 0x6C70636D; // 'lpcm'
const K_AUDIO_FORMAT_FLAG_IS_FLOAT: u32 = 1 << 0;
const K_AUDIO_FORMAT_FLAG_IS_PACKED: u32 = 1 << 3;

const K_AUDIO_UNIT_SCOPE_INPUT: u32 = 1;
const K_AUDIO_UNIT_SCOPE_GLOBAL: u32 = 0;

const K_AUDIO_OUTPUT_UNIT_PROPERTY_CURRENT_DEVICE: u32 = 2000;
const K_AUDIO_UNIT_PROPERTY_STREAM_FORMAT: u32 = 8;
const K_AUDIO_UNIT_PROPERTY_SET_RENDER_CALLBACK: u32 = 23;

const K_AUDIO_UNIT_TYPE_OUTPUT: u32 = 0x61756F75; // 'auou'
const K_AUDIO_UNIT_SUB_TYPE_HAL_OUTPUT: u32 = 0x6168616C; // 'ahal'
const K_AUDIO_UNIT_MANUFACTURER_APPLE: u32 = 0x6170706C; // 'appl'

const NO_ERR: OSStatus = 0;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct AudioObjectPropertyAddress {
    selector: AudioObjectPropertySelector,
    scope: AudioObjectPropertyScope,
    element: AudioObjectPropertyElement,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct AudioStreamBasicDescription {
    sample_rate: f64,
    format_id: u32,
    format_flags: u32,
    bytes_per_packet: u32,
    frames_per_packet: u32,
    bytes_per_frame: u32,
    channels_per_frame: u32,
    bits_per_channel: u32,
    reserved: u32,
}

#[repr(C)]
struct AudioComponentDescription {
    component_type: u32,
    component_sub_type: u32,
    component_manufacturer: u32,
    component_flags: u32,
    component_flags_mask: u32,
}

#[repr(C)]
struct AURenderCallbackStruct {
    input_proc: RenderCallback,
    input_proc_ref_con: *mut c_void,
}

type RenderCallback = extern "C" fn(
    in_ref_con: *mut c_void,
    io_action_flags: *mut u32,
    in_time_stamp: *const AudioTimeStamp,
    in_bus_number: u32,
    in_number_frames: u32,
    io_data: *mut AudioBufferList,
) -> OSStatus;

#[repr(C)]
struct AudioTimeStamp {
    sample_time: f64,
    host_time: u64,
    rate_scalar: f64,
    word_clock_time: u64,
    smpte_time: SMPTETime,
    flags: u32,
    reserved: u32,
}

#[repr(C)]
#[derive(Default)]
struct SMPTETime {
    subframes: i16,
    subframe_divisor: i16,
    counter: u32,
    smpte_type: u32,
    flags: u32,
    hours: i16,
    minutes: i16,
    seconds: i16,
    frames: i16,
}

#[repr(C)]
struct AudioBufferList {
    number_buffers: u32,
    buffers: [AudioBuffer; 2],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct AudioBuffer {
    number_channels: u32,
    data_byte_size: u32,
    data: *mut c_void,
}

type PropertyListenerProc = extern "C" fn(
    in_object_id: AudioObjectID,
    in_number_addresses: u32,
    in_addresses: *const AudioObjectPropertyAddress,
    in_client_data: *mut c_void,
) -> OSStatus;

#[link(name = "CoreAudio", kind = "framework")]
extern "C" {
    fn AudioObjectGetPropertyDataSize(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        qualifier_data_size: u32,
        qualifier_data: *const c_void,
        out_data_size: *mut u32,
    ) -> OSStatus;

    fn AudioObjectGetPropertyData(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        qualifier_data_size: u32,
        qualifier_data: *const c_void,
        io_data_size: *mut u32,
        out_data: *mut c_void,
    ) -> OSStatus;

    fn AudioObjectAddPropertyListener(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        listener: PropertyListenerProc,
        client_data: *mut c_void,
    ) -> OSStatus;

    fn AudioObjectRemovePropertyListener(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        listener: PropertyListenerProc,
        client_data: *mut c_void,
    ) -> OSStatus;
}

#[link(name = "AudioToolbox", kind = "framework")]
extern "C" {
    fn AudioComponentFindNext(
        component: AudioComponent,
        desc: *const AudioComponentDescription,
    ) -> AudioComponent;

    fn AudioComponentInstanceNew(
        component: AudioComponent,
        out_instance: *mut AudioComponentInstance,
    ) -> OSStatus;

    fn AudioComponentInstanceDispose(instance: AudioComponentInstance) -> OSStatus;

    fn AudioUnitInitialize(unit: AudioUnit) -> OSStatus;
    fn AudioUnitUninitialize(unit: AudioUnit) -> OSStatus;
    fn AudioOutputUnitStart(unit: AudioUnit) -> OSStatus;
    fn AudioOutputUnitStop(unit: AudioUnit) -> OSStatus;

    fn AudioUnitSetProperty(
        unit: AudioUnit,
        property_id: u32,
        scope: u32,
        element: u32,
        data: *const c_void,
        data_size: u32,
    ) -> OSStatus;
}

/// 监听回调上下文：只持有事件发送端
struct ListenerState {
    sender: Sender<DeviceEvent>,
}

/// 设备事件监听 trampoline
///
/// 运行在 Core Audio 的任意通知线程上：只做非阻塞投递，
/// 状态变更全部留给控制线程的 handle_device_events
extern "C" fn property_listener(
    _in_object_id: AudioObjectID,
    in_number_addresses: u32,
    in_addresses: *const AudioObjectPropertyAddress,
    in_client_data: *mut c_void,
) -> OSStatus {
    if in_client_data.is_null() || in_addresses.is_null() {
        return NO_ERR;
    }
    let state = unsafe { &*(in_client_data as *const ListenerState) };

    for i in 0..in_number_addresses as usize {
        let address = unsafe { &*in_addresses.add(i) };
        let event = match address.selector {
            K_AUDIO_HARDWARE_PROPERTY_DEFAULT_OUTPUT_DEVICE => DeviceEvent::DefaultDeviceChanged,
            K_AUDIO_DEVICE_PROPERTY_NOMINAL_SAMPLE_RATE
            | K_AUDIO_DEVICE_PROPERTY_STREAM_CONFIGURATION => DeviceEvent::FormatChanged,
            _ => continue,
        };
        let _ = state.sender.try_send(event);
    }

    NO_ERR
}

/// Render callback trampoline
///
/// **绝对禁止：**
/// - 锁
/// - 分配
/// - I/O
extern "C" fn render_callback(
    in_ref_con: *mut c_void,
    _io_action_flags: *mut u32,
    _in_time_stamp: *const AudioTimeStamp,
    _in_bus_number: u32,
    in_number_frames: u32,
    io_data: *mut AudioBufferList,
) -> OSStatus {
    let ctx = unsafe { &mut *(in_ref_con as *mut RenderContext) };
    let buffer_list = unsafe { &mut *io_data };

    if buffer_list.number_buffers == 0 {
        return NO_ERR;
    }

    let output_ptr = buffer_list.buffers[0].data as *mut f32;
    let output_samples = buffer_list.buffers[0].data_byte_size as usize / 4;
    if output_ptr.is_null() || output_samples == 0 {
        return NO_ERR;
    }
    let output = unsafe { std::slice::from_raw_parts_mut(output_ptr, output_samples) };

    ctx.render(output, in_number_frames as usize);
    NO_ERR
}

/// Core Audio AUHAL 输出后端
pub struct CoreAudioBackend {
    device_id: DeviceId,
    descriptor: DeviceDescriptor,
    audio_unit: AudioUnit,
    /// render callback 持有的上下文；停机后回收
    context: Option<Box<RenderContext>>,
    listener_state: Option<Box<ListenerState>>,
    period_frames: usize,
}

// audio_unit 裸指针只在控制线程使用；回调侧只经 refcon 访问上下文
unsafe impl Send for CoreAudioBackend {}

impl CoreAudioBackend {
    /// 打开设备后端；id 为 None 时使用系统默认输出设备
    ///
    /// 指定的 ID 不再解析为活跃设备时返回 DeviceUnavailable
    pub fn open(device_id: Option<DeviceId>) -> Result<Self, OutputError> {
        let id = match device_id {
            Some(id) => {
                if !Self::device_exists(id)? {
                    return Err(OutputError::DeviceUnavailable(id));
                }
                id
            }
            None => Self::default_output_device()?,
        };

        let sample_rate = Self::nominal_sample_rate(id)?;
        let channels = Self::output_channel_count(id)?;
        let name = Self::device_name(id);
        let period_frames = Self::buffer_frame_size(id).unwrap_or(512) as usize;

        log::info!(
            "Core Audio device: {} (ID: {}, {}Hz, {}ch, {} frames/period)",
            name,
            id,
            sample_rate,
            channels,
            period_frames
        );

        Ok(Self {
            device_id: id,
            descriptor: DeviceDescriptor {
                id,
                name,
                sample_rate,
                channels,
            },
            audio_unit: ptr::null_mut(),
            context: None,
            listener_state: None,
            period_frames,
        })
    }

    fn default_output_device() -> Result<DeviceId, OutputError> {
        let address = AudioObjectPropertyAddress {
            selector: K_AUDIO_HARDWARE_PROPERTY_DEFAULT_OUTPUT_DEVICE,
            scope: K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
            element: K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN,
        };

        let mut device_id: AudioObjectID = 0;
        let mut size = std::mem::size_of::<AudioObjectID>() as u32;

        let status = unsafe {
            AudioObjectGetPropertyData(
                K_AUDIO_OBJECT_SYSTEM_OBJECT,
                &address,
                0,
                ptr::null(),
                &mut size,
                &mut device_id as *mut _ as *mut c_void,
            )
        };

        if status != NO_ERR || device_id == 0 {
            return Err(OutputError::Backend(format!(
                "no default output device (status {})",
                status
            )));
        }
        Ok(device_id)
    }

    fn device_exists(device_id: DeviceId) -> Result<bool, OutputError> {
        let address = AudioObjectPropertyAddress {
            selector: K_AUDIO_HARDWARE_PROPERTY_DEVICES,
            scope: K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
            element: K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN,
        };

        let mut size: u32 = 0;
        let status = unsafe {
            AudioObjectGetPropertyDataSize(
                K_AUDIO_OBJECT_SYSTEM_OBJECT,
                &address,
                0,
                ptr::null(),
                &mut size,
            )
        };
        if status != NO_ERR {
            return Err(OutputError::Backend(format!(
                "failed to enumerate devices (status {})",
                status
            )));
        }

        let count = size as usize / std::mem::size_of::<AudioObjectID>();
        let mut device_ids = vec![0u32; count];
        let status = unsafe {
            AudioObjectGetPropertyData(
                K_AUDIO_OBJECT_SYSTEM_OBJECT,
                &address,
                0,
                ptr::null(),
                &mut size,
                device_ids.as_mut_ptr() as *mut c_void,
            )
        };
        if status != NO_ERR {
            return Err(OutputError::Backend(format!(
                "failed to enumerate devices (status {})",
                status
            )));
        }

        Ok(device_ids.contains(&device_id))
    }

    fn nominal_sample_rate(device_id: DeviceId) -> Result<f64, OutputError> {
        let address = AudioObjectPropertyAddress {
            selector: K_AUDIO_DEVICE_PROPERTY_NOMINAL_SAMPLE_RATE,
            scope: K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT,
            element: K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN,
        };

        let mut rate: f64 = 0.0;
        let mut size = std::mem::size_of::<f64>() as u32;

        let status = unsafe {
            AudioObjectGetPropertyData(
                device_id,
                &address,
                0,
                ptr::null(),
                &mut size,
                &mut rate as *mut _ as *mut c_void,
            )
        };

        if status != NO_ERR {
            // 部分设备只在 GLOBAL scope 暴露此属性
            let address_global = AudioObjectPropertyAddress {
                scope: K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
                ..address
            };
            let status = unsafe {
                AudioObjectGetPropertyData(
                    device_id,
                    &address_global,
                    0,
                    ptr::null(),
                    &mut size,
                    &mut rate as *mut _ as *mut c_void,
                )
            };
            if status != NO_ERR {
                return Err(OutputError::Backend(format!(
                    "failed to query sample rate (status {})",
                    status
                )));
            }
        }

        Ok(rate)
    }

    /// 输出声道数：遍历流配置的 AudioBufferList 求和
    fn output_channel_count(device_id: DeviceId) -> Result<u16, OutputError> {
        let address = AudioObjectPropertyAddress {
            selector: K_AUDIO_DEVICE_PROPERTY_STREAM_CONFIGURATION,
            scope: K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT,
            element: K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN,
        };

        let mut size: u32 = 0;
        let status = unsafe {
            AudioObjectGetPropertyDataSize(device_id, &address, 0, ptr::null(), &mut size)
        };
        if status != NO_ERR || size == 0 {
            return Err(OutputError::Backend(format!(
                "failed to query stream configuration (status {})",
                status
            )));
        }

        let mut raw = vec![0u8; size as usize];
        let status = unsafe {
            AudioObjectGetPropertyData(
                device_id,
                &address,
                0,
                ptr::null(),
                &mut size,
                raw.as_mut_ptr() as *mut c_void,
            )
        };
        if status != NO_ERR {
            return Err(OutputError::Backend(format!(
                "failed to read stream configuration (status {})",
                status
            )));
        }

        // 变长 AudioBufferList：u32 buffer 数 + 紧随的 AudioBuffer 数组
        let number_buffers =
            u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        let mut channels: u32 = 0;
        let buffers_base = std::mem::size_of::<u32>().max(std::mem::align_of::<AudioBuffer>());
        let stride = std::mem::size_of::<AudioBuffer>();
        for i in 0..number_buffers {
            let offset = buffers_base + i * stride;
            if offset + 4 > raw.len() {
                break;
            }
            channels += u32::from_ne_bytes([
                raw[offset],
                raw[offset + 1],
                raw[offset + 2],
                raw[offset + 3],
            ]);
        }

        Ok(channels.min(u16::MAX as u32) as u16)
    }

    fn buffer_frame_size(device_id: DeviceId) -> Option<u32> {
        let address = AudioObjectPropertyAddress {
            selector: K_AUDIO_DEVICE_PROPERTY_BUFFER_FRAME_SIZE,
            scope: K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT,
            element: K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN,
        };

        let mut frames: u32 = 0;
        let mut size = std::mem::size_of::<u32>() as u32;
        let status = unsafe {
            AudioObjectGetPropertyData(
                device_id,
                &address,
                0,
                ptr::null(),
                &mut size,
                &mut frames as *mut _ as *mut c_void,
            )
        };

        if status == NO_ERR && frames > 0 {
            Some(frames)
        } else {
            None
        }
    }

    /// 设备名称（CFString 经 core-foundation 安全转换）
    fn device_name(device_id: DeviceId) -> String {
        use core_foundation::base::TCFType;
        use core_foundation::string::CFString;
        use coreaudio_sys::{
            kAudioObjectPropertyElementMain, kAudioObjectPropertyName,
            kAudioObjectPropertyScopeGlobal, AudioObjectGetPropertyData as sysGetPropertyData,
            AudioObjectPropertyAddress as SysPropertyAddress,
        };

        let address = SysPropertyAddress {
            mSelector: kAudioObjectPropertyName,
            mScope: kAudioObjectPropertyScopeGlobal,
            mElement: kAudioObjectPropertyElementMain,
        };

        let mut size: u32 = std::mem::size_of::<*const c_void>() as u32;
        let mut cf_string_ref: *const c_void = ptr::null();

        let status = unsafe {
            sysGetPropertyData(
                device_id,
                &address,
                0,
                ptr::null(),
                &mut size,
                &mut cf_string_ref as *mut _ as *mut c_void,
            )
        };

        if status != 0 || cf_string_ref.is_null() {
            return format!("Device {}", device_id);
        }

        let cf_string =
            unsafe { CFString::wrap_under_create_rule(cf_string_ref as *const _) };
        cf_string.to_string()
    }

    fn register_listeners(&mut self, sender: Sender<DeviceEvent>) {
        self.remove_listeners();

        let state = Box::new(ListenerState { sender });
        let state_ptr = &*state as *const ListenerState as *mut c_void;

        let default_device = AudioObjectPropertyAddress {
            selector: K_AUDIO_HARDWARE_PROPERTY_DEFAULT_OUTPUT_DEVICE,
            scope: K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
            element: K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN,
        };
        let sample_rate = AudioObjectPropertyAddress {
            selector: K_AUDIO_DEVICE_PROPERTY_NOMINAL_SAMPLE_RATE,
            scope: K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
            element: K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN,
        };

        unsafe {
            let status = AudioObjectAddPropertyListener(
                K_AUDIO_OBJECT_SYSTEM_OBJECT,
                &default_device,
                property_listener,
                state_ptr,
            );
            if status != NO_ERR {
                log::warn!("Failed to register default-device listener (status {})", status);
            }
            let status = AudioObjectAddPropertyListener(
                self.device_id,
                &sample_rate,
                property_listener,
                state_ptr,
            );
            if status != NO_ERR {
                log::warn!("Failed to register format listener (status {})", status);
            }
        }

        self.listener_state = Some(state);
    }

    fn remove_listeners(&mut self) {
        let Some(state) = self.listener_state.take() else {
            return;
        };
        let state_ptr = &*state as *const ListenerState as *mut c_void;

        let default_device = AudioObjectPropertyAddress {
            selector: K_AUDIO_HARDWARE_PROPERTY_DEFAULT_OUTPUT_DEVICE,
            scope: K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
            element: K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN,
        };
        let sample_rate = AudioObjectPropertyAddress {
            selector: K_AUDIO_DEVICE_PROPERTY_NOMINAL_SAMPLE_RATE,
            scope: K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
            element: K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN,
        };

        unsafe {
            let _ = AudioObjectRemovePropertyListener(
                K_AUDIO_OBJECT_SYSTEM_OBJECT,
                &default_device,
                property_listener,
                state_ptr,
            );
            let _ = AudioObjectRemovePropertyListener(
                self.device_id,
                &sample_rate,
                property_listener,
                state_ptr,
            );
        }
        // state 在此随作用域释放；监听已移除，trampoline 不会再触碰
    }

    /// 释放 AudioUnit 资源（幂等）
    fn teardown_unit(&mut self) {
        if self.audio_unit.is_null() {
            return;
        }
        unsafe {
            let _ = AudioOutputUnitStop(self.audio_unit);
            let _ = AudioUnitUninitialize(self.audio_unit);
            let _ = AudioComponentInstanceDispose(self.audio_unit);
        }
        self.audio_unit = ptr::null_mut();
        self.context = None;
    }
}

impl DeviceBackend for CoreAudioBackend {
    fn descriptor(&self) -> DeviceDescriptor {
        self.descriptor.clone()
    }

    fn native_format(&self) -> Result<StreamFormat, OutputError> {
        let sample_rate = Self::nominal_sample_rate(self.device_id)?;
        let channels = Self::output_channel_count(self.device_id)?;
        Ok(StreamFormat::new(sample_rate, SampleFormat::Float32, channels))
    }

    fn period_frames(&self) -> usize {
        self.period_frames
    }

    fn set_event_sender(&mut self, sender: Sender<DeviceEvent>) {
        self.register_listeners(sender);
    }

    fn start(&mut self, ctx: RenderContext) -> Result<(), OutputError> {
        if !self.audio_unit.is_null() {
            return Err(OutputError::InvalidState("backend already started"));
        }

        let desc = AudioComponentDescription {
            component_type: K_AUDIO_UNIT_TYPE_OUTPUT,
            component_sub_type: K_AUDIO_UNIT_SUB_TYPE_HAL_OUTPUT,
            component_manufacturer: K_AUDIO_UNIT_MANUFACTURER_APPLE,
            component_flags: 0,
            component_flags_mask: 0,
        };

        let component = unsafe { AudioComponentFindNext(ptr::null_mut(), &desc) };
        if component.is_null() {
            return Err(OutputError::ResourceFailure("no AUHAL component found"));
        }

        let mut audio_unit: AudioUnit = ptr::null_mut();
        let status = unsafe { AudioComponentInstanceNew(component, &mut audio_unit) };
        if status != NO_ERR {
            return Err(OutputError::Backend(format!(
                "AudioComponentInstanceNew failed (status {})",
                status
            )));
        }
        self.audio_unit = audio_unit;

        // 绑定输出设备
        let status = unsafe {
            AudioUnitSetProperty(
                audio_unit,
                K_AUDIO_OUTPUT_UNIT_PROPERTY_CURRENT_DEVICE,
                K_AUDIO_UNIT_SCOPE_GLOBAL,
                0,
                &self.device_id as *const _ as *const c_void,
                std::mem::size_of::<DeviceId>() as u32,
            )
        };
        if status != NO_ERR {
            self.teardown_unit();
            return Err(OutputError::Backend(format!(
                "failed to bind device (status {})",
                status
            )));
        }

        // 输入侧流格式：Float32 interleaved，设备布局
        let device_format = ctx.device_format();
        let channels = device_format.channels as u32;
        let asbd = AudioStreamBasicDescription {
            sample_rate: device_format.sample_rate,
            format_id: K_AUDIO_FORMAT_LINEAR_PCM,
            format_flags: K_AUDIO_FORMAT_FLAG_IS_FLOAT | K_AUDIO_FORMAT_FLAG_IS_PACKED,
            bytes_per_packet: 4 * channels,
            frames_per_packet: 1,
            bytes_per_frame: 4 * channels,
            channels_per_frame: channels,
            bits_per_channel: 32,
            reserved: 0,
        };
        let status = unsafe {
            AudioUnitSetProperty(
                audio_unit,
                K_AUDIO_UNIT_PROPERTY_STREAM_FORMAT,
                K_AUDIO_UNIT_SCOPE_INPUT,
                0,
                &asbd as *const _ as *const c_void,
                std::mem::size_of::<AudioStreamBasicDescription>() as u32,
            )
        };
        if status != NO_ERR {
            self.teardown_unit();
            return Err(OutputError::FormatNegotiationFailed(format!(
                "device rejected stream format (status {})",
                status
            )));
        }

        // 注册 render callback；上下文 Box 由本后端持有，停机后回收
        let context = Box::new(ctx);
        let context_ptr = Box::into_raw(context);
        let callback_struct = AURenderCallbackStruct {
            input_proc: render_callback,
            input_proc_ref_con: context_ptr as *mut c_void,
        };
        let status = unsafe {
            AudioUnitSetProperty(
                audio_unit,
                K_AUDIO_UNIT_PROPERTY_SET_RENDER_CALLBACK,
                K_AUDIO_UNIT_SCOPE_INPUT,
                0,
                &callback_struct as *const _ as *const c_void,
                std::mem::size_of::<AURenderCallbackStruct>() as u32,
            )
        };
        if status != NO_ERR {
            // 注册失败：回收上下文，不得遗留半绑定回调
            unsafe {
                let _ = Box::from_raw(context_ptr);
            }
            self.teardown_unit();
            return Err(OutputError::Backend(format!(
                "failed to set render callback (status {})",
                status
            )));
        }
        self.context = Some(unsafe { Box::from_raw(context_ptr) });

        let status = unsafe { AudioUnitInitialize(audio_unit) };
        if status != NO_ERR {
            self.teardown_unit();
            return Err(OutputError::Backend(format!(
                "AudioUnitInitialize failed (status {})",
                status
            )));
        }

        let status = unsafe { AudioOutputUnitStart(audio_unit) };
        if status != NO_ERR {
            self.teardown_unit();
            return Err(OutputError::Backend(format!(
                "AudioOutputUnitStart failed (status {})",
                status
            )));
        }

        log::info!(
            "AUHAL started: {}Hz, {}ch, Float32 interleaved",
            device_format.sample_rate,
            channels
        );
        Ok(())
    }

    fn stop(&mut self) {
        // Uninitialize 返回后 render callback 不再被调用，
        // 之后释放上下文才是安全的
        self.teardown_unit();
    }
}

impl Drop for CoreAudioBackend {
    fn drop(&mut self) {
        self.teardown_unit();
        self.remove_listeners();
    }
}
