//! 字节环形缓冲区 + 流控
//!
//! 设计目标：
//! - 生产者只阻塞在 space 信号量，实时读线程只对 data 信号量做有界等待
//! - 两个等待条件彼此独立，写线程和读线程不可能互相等出死锁环
//! - 所有内存在初始化时预分配，可选 mlock 防止 page fault
//! - 游标各自独占一个 cache line，避免 false sharing
//!
//! 不变量：space.count + data.count == capacity（无操作进行时）。
//! 每次写入先扣减 space 再补记 data，读取反向，计数始终对账。
//!
//! 所有权约束：读写游标各属一端，实时线程只读、生产者线程只写

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

/// 计数信号量
///
/// std 没有计数信号量，用 Mutex + Condvar 实现。
/// 锁只在计数增减的瞬间持有，不跨越任何数据拷贝，
/// 实时线程可见的持锁时间有界。
///
/// `close` 唤醒所有等待者并使后续获取立即返回 0，
/// 保证 teardown 时阻塞中的生产者必定退出。
pub struct FlowSemaphore {
    state: Mutex<SemState>,
    cv: Condvar,
}

struct SemState {
    count: usize,
    closed: bool,
}

impl FlowSemaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            state: Mutex::new(SemState {
                count: initial,
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// 释放 n 个配额并唤醒等待者
    pub fn post(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.count += n;
        drop(state);
        self.cv.notify_all();
    }

    /// 获取至多 max 个配额
    ///
    /// - `timeout` 为 None：阻塞直到至少 1 个配额可用或信号量关闭
    /// - `timeout` 为 Some(d)：最多等待 d，超时返回当前可得（可能为 0）
    ///
    /// 关闭后立即返回 0
    pub fn acquire_up_to(&self, max: usize, timeout: Option<Duration>) -> usize {
        if max == 0 {
            return 0;
        }

        let mut state = self.state.lock().unwrap();
        match timeout {
            None => {
                while state.count == 0 && !state.closed {
                    state = self.cv.wait(state).unwrap();
                }
            }
            Some(budget) => {
                let deadline = Instant::now() + budget;
                while state.count == 0 && !state.closed {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (next, _) = self.cv.wait_timeout(state, deadline - now).unwrap();
                    state = next;
                }
            }
        }

        if state.closed {
            return 0;
        }
        let taken = state.count.min(max);
        state.count -= taken;
        taken
    }

    /// 当前计数（诊断/不变量检查用）
    pub fn count(&self) -> usize {
        self.state.lock().unwrap().count
    }

    /// 关闭：唤醒所有等待者，后续获取立即返回 0
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// 重置计数并重新开放（要求无并发访问）
    pub fn reset(&self, count: usize) {
        let mut state = self.state.lock().unwrap();
        state.count = count;
        state.closed = false;
    }
}

/// SPSC 字节环形缓冲区
///
/// 容量固定，绝不覆盖写：背压施加给生产者而不是丢数据。
/// 读写两侧通过独立的信号量等待，互不阻塞对方。
pub struct RingBuffer {
    buffer: Box<[UnsafeCell<u8>]>,
    capacity: usize,
    mask: usize,

    // 游标各自独占一个 cache line，避免 false sharing
    write_pos: CachePadded<AtomicUsize>,
    read_pos: CachePadded<AtomicUsize>,

    /// 可写空间配额，初始 = capacity
    space: FlowSemaphore,
    /// 可读数据配额，初始 = 0
    data: FlowSemaphore,

    memory_locked: AtomicBool,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// 创建指定容量的环形缓冲区
    ///
    /// capacity 必须是 2 的幂
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be power of two");

        let buffer: Vec<UnsafeCell<u8>> = (0..capacity).map(|_| UnsafeCell::new(0)).collect();

        Self {
            buffer: buffer.into_boxed_slice(),
            capacity,
            mask: capacity - 1,
            write_pos: CachePadded::new(AtomicUsize::new(0)),
            read_pos: CachePadded::new(AtomicUsize::new(0)),
            space: FlowSemaphore::new(capacity),
            data: FlowSemaphore::new(0),
            memory_locked: AtomicBool::new(false),
        }
    }

    /// 创建指定最小容量的缓冲区（自动向上取整到 2 的幂）
    pub fn with_min_capacity(min_capacity: usize) -> Self {
        Self::new(min_capacity.next_power_of_two().max(2))
    }

    /// 写入字节（生产者调用）
    ///
    /// 阻塞直到全部写入；缓冲区关闭时提前返回已写入的字节数。
    /// 只阻塞在 space 信号量上，与读线程的等待条件无关。
    pub fn write(&self, bytes: &[u8]) -> usize {
        let mut written = 0;
        while written < bytes.len() {
            let granted = self.space.acquire_up_to(bytes.len() - written, None);
            if granted == 0 {
                // closed
                break;
            }

            let write = self.write_pos.load(Ordering::Relaxed);
            for i in 0..granted {
                let idx = (write + i) & self.mask;
                unsafe {
                    *self.buffer[idx].get() = bytes[written + i];
                }
            }
            self.write_pos
                .store(write.wrapping_add(granted), Ordering::Release);

            self.data.post(granted);
            written += granted;
        }
        written
    }

    /// 读取字节（实时线程调用）
    ///
    /// 最多等待 `budget`；数据不足时返回短计数，由调用方补静音，
    /// 绝不使硬件回调错过期限。
    pub fn read(&self, output: &mut [u8], budget: Duration) -> usize {
        let granted = self.data.acquire_up_to(output.len(), Some(budget));
        if granted == 0 {
            return 0;
        }

        let read = self.read_pos.load(Ordering::Relaxed);
        for (i, slot) in output.iter_mut().take(granted).enumerate() {
            let idx = (read + i) & self.mask;
            *slot = unsafe { *self.buffer[idx].get() };
        }
        self.read_pos
            .store(read.wrapping_add(granted), Ordering::Release);

        self.space.post(granted);
        granted
    }

    /// 当前可读字节数
    #[inline]
    pub fn data_len(&self) -> usize {
        self.data.count()
    }

    /// 当前可写空间
    #[inline]
    pub fn free_len(&self) -> usize {
        self.space.count()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 缓冲区填充比例（监控用）
    #[inline]
    pub fn fill_ratio(&self) -> f64 {
        self.data_len() as f64 / self.capacity as f64
    }

    /// 关闭：唤醒阻塞中的生产者与等待中的读端
    ///
    /// stop 路径必须先调用，否则生产者可能永远阻塞在 write
    pub fn close(&self) {
        self.space.close();
        self.data.close();
    }

    /// 是否处于关闭状态（停止后、重开前）
    pub fn is_closed(&self) -> bool {
        self.space.is_closed()
    }

    /// 清空并重新开放（重启前由控制线程调用，要求无并发读写）
    pub fn reopen(&self) {
        let write = self.write_pos.load(Ordering::Acquire);
        self.read_pos.store(write, Ordering::Release);
        self.space.reset(self.capacity);
        self.data.reset(0);
    }

    /// 锁定缓冲区内存，防止被换页
    ///
    /// 实时场景下 page fault 会造成严重的时序抖动。
    /// 返回是否成功锁定。
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true;
        }

        let ptr = self.buffer.as_ptr() as *const libc::c_void;
        let len = self.capacity;

        let result = unsafe { libc::mlock(ptr, len) };

        if result == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("Ring buffer memory locked: {} bytes", len);
            true
        } else {
            log::warn!(
                "Failed to lock ring buffer memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    /// 解锁缓冲区内存
    pub fn unlock_memory(&self) {
        if !self.memory_locked.load(Ordering::Acquire) {
            return;
        }

        let ptr = self.buffer.as_ptr() as *const libc::c_void;
        unsafe {
            libc::munlock(ptr, self.capacity);
        }

        self.memory_locked.store(false, Ordering::Release);
        log::debug!("Ring buffer memory unlocked");
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}
