//! 可视化数据通道
//!
//! 渲染线程每个周期投递一块 mono f32 缓冲给可视化消费者：
//! - 块在建通道时预分配并循环复用，投递路径零分配
//! - 投递只用 try_recv/try_send，队列满即丢块，绝不阻塞实时线程
//! - 消费者必须容忍丢块

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::time::Duration;

/// 一块 mono 可视化数据
pub struct VisBlock {
    pub samples: Box<[f32]>,
    /// 实际有效帧数（尾部为零填充）
    pub frames: usize,
    pub sample_rate: f64,
}

/// 渲染侧投递端
#[derive(Clone)]
pub struct VisSender {
    free: Receiver<VisBlock>,
    full: Sender<VisBlock>,
}

/// 消费侧接收端
pub struct VisReceiver {
    full: Receiver<VisBlock>,
    free: Sender<VisBlock>,
}

/// 建立可视化通道，预分配 `blocks` 个 `block_frames` 帧的缓冲块
pub fn vis_channel(
    blocks: usize,
    block_frames: usize,
    sample_rate: f64,
) -> (VisSender, VisReceiver) {
    let (free_tx, free_rx) = bounded(blocks);
    let (full_tx, full_rx) = bounded(blocks);

    for _ in 0..blocks {
        let block = VisBlock {
            samples: vec![0.0; block_frames].into_boxed_slice(),
            frames: 0,
            sample_rate,
        };
        free_tx.send(block).expect("vis pool sized to channel bound");
    }

    (
        VisSender {
            free: free_rx,
            full: full_tx,
        },
        VisReceiver {
            full: full_rx,
            free: free_tx,
        },
    )
}

impl VisSender {
    /// 实时线程调用：无空闲块或队列已满时直接丢弃
    ///
    /// 返回是否成功投递
    pub fn publish(&self, mono: &[f32]) -> bool {
        let mut block = match self.free.try_recv() {
            Ok(block) => block,
            Err(_) => return false,
        };

        let n = mono.len().min(block.samples.len());
        block.samples[..n].copy_from_slice(&mono[..n]);
        for slot in block.samples[n..].iter_mut() {
            *slot = 0.0;
        }
        block.frames = n;

        match self.full.try_send(block) {
            Ok(()) => true,
            Err(TrySendError::Full(block)) => {
                // 消费者落后：归还块，本周期丢弃
                drop(block);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

impl VisReceiver {
    pub fn try_recv(&self) -> Option<VisBlock> {
        self.full.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<VisBlock> {
        match self.full.recv_timeout(timeout) {
            Ok(block) => Some(block),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// 消费完毕后归还块以供复用；不归还等同于缩小池子
    pub fn recycle(&self, block: VisBlock) {
        let _ = self.free.try_send(block);
    }
}
