//! 帧缓冲环
//!
//! Buffer 存放在定长数组中，`next = (i + 1) % n`；`first` / `current` / `last`
//! 都是下标：
//!
//! - `current` 是应用可以读取的 Buffer，永远不在硬件接收队列中。
//! - `last` 是最近一次 (重新) Attach 的 Buffer；从 `current` 之后一直到 `last`
//!   的每个 Buffer 都已 Attach。
//!
//! 本模块只负责内存和下标轮转，实际的 Attach 委托给 Driver。

use isocam_core::error::{CameraError, Result};
use isocam_core::frame::FrameMemory;
use isocam_core::traits::{
    AttachFlags, AttachRequest, FrameAllocator, IsochDriver, ResourceHandle, StreamHandle,
};

/// 一个硬件大小的图像缓冲区
#[derive(Debug)]
pub struct FrameBuffer<S> {
    index: usize,
    memory: FrameMemory,
    signal: S,
}

impl<S> FrameBuffer<S> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn memory(&self) -> &FrameMemory {
        &self.memory
    }

    pub fn signal(&self) -> &S {
        &self.signal
    }
}

/// Attach 时需要的流参数
#[derive(Debug, Clone, Copy)]
pub struct AttachTarget<'a> {
    pub stream: &'a StreamHandle,
    pub resource: &'a ResourceHandle,
    pub flags: AttachFlags,
    pub max_bytes_per_packet: usize,
}

#[derive(Debug)]
pub struct FrameBufferRing<S> {
    buffers: Vec<FrameBuffer<S>>,
    first: usize,
    current: usize,
    last: usize,
    /// 单 Buffer 时 listen 推迟到第一次 acquire
    listen_deferred: bool,
}

impl<S> FrameBufferRing<S> {
    /// 分配 `count` 个 Buffer 并连成一个环
    ///
    /// 任一 Buffer 的内存或信号获取失败时，已分配的部分全部归还后再返回错误。
    pub fn allocate<D>(
        count: usize,
        max_buffer_size: usize,
        allocator: &dyn FrameAllocator,
        driver: &D,
    ) -> Result<Self>
    where
        D: IsochDriver<Signal = S>,
    {
        if count < 1 {
            return Err(CameraError::InvalidArgument(format!(
                "invalid number of buffers: {count}"
            )));
        }

        let mut buffers = Vec::with_capacity(count);
        for index in 0..count {
            match Self::allocate_one(index, max_buffer_size, allocator, driver) {
                Ok(buffer) => {
                    tracing::trace!(index, bytes = max_buffer_size, "allocated frame buffer");
                    buffers.push(buffer);
                }
                Err(e) => {
                    tracing::error!(index, error = %e, "frame buffer allocation failed, rolling back");
                    for buffer in buffers.into_iter().rev() {
                        Self::release_one(buffer, allocator, driver);
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            buffers,
            first: 0,
            current: 0,
            last: 0,
            listen_deferred: false,
        })
    }

    fn allocate_one<D>(
        index: usize,
        len: usize,
        allocator: &dyn FrameAllocator,
        driver: &D,
    ) -> Result<FrameBuffer<S>>
    where
        D: IsochDriver<Signal = S>,
    {
        let bytes = allocator.allocate(index, len)?;
        let signal = match driver.create_signal(index) {
            Ok(signal) => signal,
            Err(e) => {
                allocator.release(index, bytes);
                return Err(e);
            }
        };
        Ok(FrameBuffer {
            index,
            memory: FrameMemory::new(bytes),
            signal,
        })
    }

    fn release_one<D>(buffer: FrameBuffer<S>, allocator: &dyn FrameAllocator, driver: &D)
    where
        D: IsochDriver<Signal = S>,
    {
        let FrameBuffer {
            index,
            memory,
            signal,
        } = buffer;
        driver.destroy_signal(signal);
        allocator.release(index, memory.take());
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn first(&self) -> usize {
        self.first
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn last(&self) -> usize {
        self.last
    }

    pub fn listen_deferred(&self) -> bool {
        self.listen_deferred
    }

    /// 环上的下一个 Buffer
    pub fn advance_to_next(&self, from: usize) -> usize {
        (from + 1) % self.buffers.len()
    }

    pub fn buffer(&self, index: usize) -> &FrameBuffer<S> {
        &self.buffers[index]
    }

    pub(crate) fn set_current(&mut self, index: usize) {
        self.current = index;
    }

    pub(crate) fn set_last(&mut self, index: usize) {
        self.last = index;
    }

    pub(crate) fn set_listen_deferred(&mut self, deferred: bool) {
        self.listen_deferred = deferred;
    }

    /// 当前在硬件队列中的 Buffer：从 current 之后到 last (含)
    pub fn in_flight(&self) -> Vec<usize> {
        let mut indices = Vec::new();
        if self.buffers.is_empty() {
            return indices;
        }
        let mut index = self.current;
        while index != self.last {
            index = self.advance_to_next(index);
            indices.push(index);
        }
        indices
    }

    /// (重新) Attach 一个 Buffer，成功后它成为 `last`
    pub async fn attach<D>(&mut self, driver: &D, target: AttachTarget<'_>, index: usize) -> Result<()>
    where
        D: IsochDriver<Signal = S>,
    {
        let buffer = &self.buffers[index];
        driver.reset_signal(&buffer.signal);

        tracing::trace!(
            index,
            size = buffer.memory.len(),
            max_bytes_per_packet = target.max_bytes_per_packet,
            "attaching buffer"
        );

        let request = AttachRequest {
            index,
            memory: buffer.memory.clone(),
            flags: target.flags,
            max_bytes_per_packet: target.max_bytes_per_packet,
        };
        driver
            .attach_buffer(target.stream, target.resource, request, &buffer.signal)
            .await?;

        self.last = index;
        Ok(())
    }

    /// 从 `last` 的下一个开始逐个 Attach，直到 `target_index` (不含)
    ///
    /// 返回本次 Attach 的数量。中途失败时 `last` 停在最后一个成功的 Buffer。
    pub async fn mark_attached_up_to<D>(
        &mut self,
        driver: &D,
        target: AttachTarget<'_>,
        target_index: usize,
    ) -> Result<usize>
    where
        D: IsochDriver<Signal = S>,
    {
        let mut attached = 0;
        let mut next = self.advance_to_next(self.last);
        while next != target_index {
            self.attach(driver, target, next).await?;
            attached += 1;
            next = self.advance_to_next(next);
        }
        Ok(attached)
    }

    /// 从 `first` 开始沿环释放所有信号与内存，回到 `first` 时停止
    ///
    /// 重复调用是安全的；释放过程不会失败。
    pub fn release<D>(&mut self, allocator: &dyn FrameAllocator, driver: &D)
    where
        D: IsochDriver<Signal = S>,
    {
        if self.buffers.is_empty() {
            return;
        }

        let count = self.buffers.len();
        let mut slots: Vec<Option<FrameBuffer<S>>> = self.buffers.drain(..).map(Some).collect();
        let mut index = self.first;
        loop {
            match slots[index].take() {
                Some(buffer) => {
                    tracing::trace!(index, "freeing buffer");
                    Self::release_one(buffer, allocator, driver);
                }
                None => tracing::warn!(index, "buffer already released"),
            }
            index = (index + 1) % count;
            if index == self.first {
                break;
            }
        }

        self.first = 0;
        self.current = 0;
        self.last = 0;
        self.listen_deferred = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isocam_core::camera::BusSpeed;
    use isocam_core::traits::ResourceRequest;
    use isocam_simulation::{FaultPlan, SimDriver, SimEvent};

    async fn handles(driver: &SimDriver) -> (StreamHandle, ResourceHandle) {
        let resource = driver
            .reserve_stream_resources(&ResourceRequest {
                max_bytes_per_packet: 1024,
                max_buffer_size: 64,
                speed: BusSpeed::S400,
            })
            .await
            .unwrap();
        let stream = driver.open_stream("ring-test").await.unwrap();
        (stream, resource)
    }

    #[test]
    fn allocate_builds_single_cycle() {
        let driver = SimDriver::new();
        let alloc = driver.allocator();
        let ring = FrameBufferRing::allocate(4, 64, &alloc, &driver).unwrap();

        assert_eq!(ring.len(), 4);
        assert_eq!((ring.first(), ring.current(), ring.last()), (0, 0, 0));
        assert_eq!(ring.advance_to_next(3), 0);

        let mut steps = 0;
        let mut index = ring.first();
        loop {
            index = ring.advance_to_next(index);
            steps += 1;
            if index == ring.first() {
                break;
            }
        }
        assert_eq!(steps, 4);
        assert_eq!(ring.buffer(2).memory().len(), 64);
        assert_eq!(ring.buffer(2).index(), 2);
    }

    #[test]
    fn zero_buffers_is_invalid() {
        let driver = SimDriver::new();
        let alloc = driver.allocator();
        let err = FrameBufferRing::allocate(0, 64, &alloc, &driver).unwrap_err();
        assert!(matches!(err, CameraError::InvalidArgument(_)));
        assert_eq!(alloc.total_allocations(), 0);
    }

    #[test]
    fn memory_failure_rolls_back_partial_ring() {
        let driver = SimDriver::new();
        let alloc = driver.allocator();
        alloc.fail_allocation_at(2);

        let err = FrameBufferRing::allocate(5, 64, &alloc, &driver).unwrap_err();
        assert!(matches!(err, CameraError::OutOfMemory { index: 2, .. }));
        assert_eq!(alloc.total_allocations(), 2);
        assert_eq!(alloc.outstanding(), 0);
        assert_eq!(driver.outstanding_signals(), 0);
    }

    #[test]
    fn signal_failure_returns_that_buffers_memory_too() {
        let driver = SimDriver::with_faults(FaultPlan {
            fail_signal_for: Some(1),
            ..Default::default()
        });
        let alloc = driver.allocator();

        assert!(FrameBufferRing::allocate(3, 64, &alloc, &driver).is_err());
        assert_eq!(alloc.outstanding(), 0);
        assert_eq!(driver.outstanding_signals(), 0);
    }

    #[tokio::test]
    async fn attach_up_to_current_leaves_current_detached() {
        let driver = SimDriver::new();
        let alloc = driver.allocator();
        let (stream, resource) = handles(&driver).await;
        let target = AttachTarget {
            stream: &stream,
            resource: &resource,
            flags: AttachFlags::default(),
            max_bytes_per_packet: 1024,
        };

        let mut ring = FrameBufferRing::allocate(4, 64, &alloc, &driver).unwrap();
        ring.set_current(3);
        ring.set_last(3);
        let attached = ring.mark_attached_up_to(&driver, target, 3).await.unwrap();

        assert_eq!(attached, 3);
        assert_eq!(ring.last(), 2);
        assert_eq!(driver.attached(), vec![0, 1, 2]);
        assert_eq!(ring.in_flight(), vec![0, 1, 2]);
        assert!(!driver.is_attached(ring.current()));

        ring.release(&alloc, &driver);
    }

    #[tokio::test]
    async fn failed_attach_leaves_last_on_previous_buffer() {
        let driver = SimDriver::with_faults(FaultPlan {
            fail_attach_call: Some(2),
            ..Default::default()
        });
        let alloc = driver.allocator();
        let (stream, resource) = handles(&driver).await;
        let target = AttachTarget {
            stream: &stream,
            resource: &resource,
            flags: AttachFlags::default(),
            max_bytes_per_packet: 1024,
        };

        let mut ring = FrameBufferRing::allocate(4, 64, &alloc, &driver).unwrap();
        ring.set_current(3);
        ring.set_last(3);
        assert!(ring.mark_attached_up_to(&driver, target, 3).await.is_err());
        assert_eq!(ring.last(), 0);
        assert_eq!(ring.in_flight(), vec![0]);

        ring.release(&alloc, &driver);
    }

    #[test]
    fn release_is_idempotent() {
        let driver = SimDriver::new();
        let alloc = driver.allocator();
        let mut ring = FrameBufferRing::allocate(3, 64, &alloc, &driver).unwrap();

        ring.release(&alloc, &driver);
        ring.release(&alloc, &driver);

        assert!(ring.is_empty());
        assert_eq!(alloc.outstanding(), 0);
        assert_eq!(driver.outstanding_signals(), 0);
        let freed = driver
            .events()
            .into_iter()
            .filter(|e| matches!(e, SimEvent::MemoryReleased { .. }))
            .count();
        assert_eq!(freed, 3);
    }
}
