use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bitflags::bitflags;

use crate::camera::BusSpeed;
use crate::error::{CameraError, Result};
use crate::frame::{Frame, FrameMemory};

// --- Driver 交互所用的数据结构 ---

/// 带宽 / 通道 / 等时资源的申请参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRequest {
    pub max_bytes_per_packet: usize,
    pub max_buffer_size: usize,
    pub speed: BusSpeed,
}

/// Driver 分配的等时资源句柄 (对核心不透明)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    pub id: u64,
    /// 分配到的等时通道
    pub channel: u8,
}

/// 长期持有的流句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle {
    pub id: u64,
    pub device_id: String,
}

bitflags! {
    /// Attach 描述符标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AttachFlags: u32 {
        /// 在 sync 位置开始写入 (帧首对齐)
        const SYNCH_ON_SY = 1 << 0;
        /// 完成时回调 (触发 completion signal)
        const USE_CALLBACK = 1 << 1;
        /// 完成后由 Driver 自动 Detach
        const AUTO_DETACH = 1 << 2;
    }
}

impl Default for AttachFlags {
    fn default() -> Self {
        Self::SYNCH_ON_SY | Self::USE_CALLBACK | Self::AUTO_DETACH
    }
}

/// 一次 Attach 请求：把某个 Buffer 挂到硬件接收队列
#[derive(Debug, Clone)]
pub struct AttachRequest {
    pub index: usize,
    pub memory: FrameMemory,
    pub flags: AttachFlags,
    pub max_bytes_per_packet: usize,
}

/// completion signal 的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// 图像已完整写入
    Ready,
    /// 仍在等待硬件
    Pending,
    /// Driver 侧超时：请求已结束 (Buffer 已脱离队列)，数据可能不完整
    TimedOut,
}

// --- 核心 Trait 定义 ---

/// 1. Driver 协作方：等时流的底层操作
///
/// 相当于内核驱动的 IOCTL 面。所有超时都由实现负责，核心不绑定 Runtime。
#[async_trait]
pub trait IsochDriver: Send + Sync {
    /// 每个 Buffer 一个的完成信号 (可轮询 / 可等待)
    type Signal: Send + Sync + fmt::Debug;

    /// 申请带宽、通道和等时资源
    async fn reserve_stream_resources(&self, request: &ResourceRequest) -> Result<ResourceHandle>;

    async fn release_stream_resources(&self, resource: ResourceHandle) -> Result<()>;

    /// 打开长期持有的流句柄
    async fn open_stream(&self, device_id: &str) -> Result<StreamHandle>;

    async fn close_stream(&self, stream: StreamHandle);

    /// 创建一个处于 "未完成" 状态的信号
    fn create_signal(&self, index: usize) -> Result<Self::Signal>;

    /// 重新 Attach 之前复位
    fn reset_signal(&self, signal: &Self::Signal);

    fn destroy_signal(&self, signal: Self::Signal);

    async fn attach_buffer(
        &self,
        stream: &StreamHandle,
        resource: &ResourceHandle,
        request: AttachRequest,
        signal: &Self::Signal,
    ) -> Result<()>;

    /// 把尚未完成的 Buffer 从硬件队列中摘下
    async fn detach_buffer(
        &self,
        stream: &StreamHandle,
        resource: &ResourceHandle,
        index: usize,
        signal: &Self::Signal,
    ) -> Result<()>;

    /// 开始接收 (isoch listen)
    async fn begin_listening(&self, stream: &StreamHandle, resource: &ResourceHandle)
        -> Result<()>;

    /// 停止接收 (isoch stop)
    async fn stop_listening(&self, stream: &StreamHandle, resource: &ResourceHandle)
        -> Result<()>;

    /// 非阻塞查询
    fn poll_completion(&self, signal: &Self::Signal) -> Result<Completion>;

    /// 阻塞等待，最多 `timeout`。等待本身到期时返回 `Completion::Pending`。
    async fn wait_completion(&self, signal: &Self::Signal, timeout: Duration)
        -> Result<Completion>;

    /// 相机开始发送 (ISO_EN)
    async fn start_video_stream(&self) -> Result<()>;

    async fn stop_video_stream(&self) -> Result<()>;
}

/// 2. 数据面：流式获取
#[async_trait]
pub trait Stream: Send {
    /// 启动采集 (分配 Buffer, Attach, Listen)
    async fn start(&mut self) -> Result<()>;

    /// 停止采集 (排空, 释放资源)
    async fn stop(&mut self) -> Result<()>;

    /// 获取下一帧
    /// 返回的 Frame 生命周期绑定到 self，实现 Ring Buffer 的借用语义
    async fn next_frame(&mut self) -> Result<Frame<'_>>;
}

/// 3. 帧内存分配器
///
/// Driver 可能对内存有对齐要求 (DMA)，因此分配策略可以替换。
pub trait FrameAllocator: Send + Sync {
    fn allocate(&self, index: usize, len: usize) -> Result<Vec<u8>>;

    fn release(&self, index: usize, bytes: Vec<u8>);
}

/// 默认分配器：堆内存，分配失败时返回 OutOfMemory 而不是 abort
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl FrameAllocator for SystemAllocator {
    fn allocate(&self, index: usize, len: usize) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| {
                tracing::error!(index, bytes = len, "frame buffer allocation failed");
                CameraError::OutOfMemory { index, bytes: len }
            })?;
        bytes.resize(len, 0);
        Ok(bytes)
    }

    fn release(&self, _index: usize, bytes: Vec<u8>) {
        drop(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_allocator_zero_fills() {
        let bytes = SystemAllocator.allocate(0, 32).unwrap();
        assert_eq!(bytes.len(), 32);
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn absurd_allocation_reports_out_of_memory() {
        let err = SystemAllocator.allocate(4, usize::MAX).unwrap_err();
        assert!(matches!(err, CameraError::OutOfMemory { index: 4, .. }));
    }
}
