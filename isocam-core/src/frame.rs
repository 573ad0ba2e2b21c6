use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{CameraError, Result};
use crate::pixel_format::PixelCoding;

/// 一个帧缓冲区的内存
///
/// Ring 拥有它；Attach 期间 Driver 持有一个克隆并向其中写入数据。
/// 按照 Ring 的不变式，同一时刻只会有一方在访问：Attach 中的 Buffer
/// 只由 Driver 写入，current Buffer 只由应用读取。
#[derive(Clone)]
pub struct FrameMemory {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl FrameMemory {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(bytes)),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Driver 侧：把一帧数据写入缓冲区
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.lock();
        f(guard.as_mut_slice())
    }

    /// 应用侧：只读视图
    pub fn read(&self) -> FrameData<'_> {
        FrameData { guard: self.lock() }
    }

    /// 取走底层内存 (释放阶段使用)，之后本对象长度为 0
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        // 写入方 panic 不影响已写入的字节，直接恢复
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("frame memory lock poisoned by a panicked writer, recovering");
            poisoned.into_inner()
        })
    }
}

impl fmt::Debug for FrameMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameMemory")
            .field("len", &self.len())
            .finish()
    }
}

/// 帧数据的只读借用
pub struct FrameData<'a> {
    guard: MutexGuard<'a, Vec<u8>>,
}

impl Deref for FrameData<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.guard.as_slice()
    }
}

impl fmt::Debug for FrameData<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameData({} bytes)", self.guard.len())
    }
}

/// acquire() 返回的帧
/// 生命周期 'a 绑定到 Session 的 Ring Buffer，实现零拷贝。
/// 下一次 acquire()/stop() 之前必须释放。
#[derive(Debug)]
pub struct Frame<'a> {
    /// 原始图像数据
    pub data: FrameData<'a>,

    /// 所在 Buffer 的序号 (Ring 内稳定)
    pub index: usize,

    /// 自 start() 以来的帧计数
    pub sequence: u64,

    /// 本次 acquire 跳过的陈旧帧数量
    pub dropped: usize,

    /// 阻塞等待超时，数据可能不完整
    pub timed_out: bool,

    pub width: u32,
    pub height: u32,
    pub coding: PixelCoding,
}

impl Frame<'_> {
    /// 将超时转换为 FrameTimeout 错误，供希望严格处理的调用方使用
    pub fn ensure_complete(&self) -> Result<()> {
        if self.timed_out {
            return Err(CameraError::FrameTimeout { index: self.index });
        }
        Ok(())
    }

    /// 以 16-bit 像素访问 (Mono16 / Raw16 / Rgb16)
    pub fn pixels_u16(&self) -> Option<&[u16]> {
        if !self.coding.is_wide() {
            return None;
        }
        let used = self.coding.frame_bytes(self.width, self.height).min(self.data.len());
        bytemuck::try_cast_slice(&self.data[..used]).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_are_visible_to_readers() {
        let mem = FrameMemory::new(vec![0; 8]);
        let driver_side = mem.clone();
        driver_side.write(|buf| buf.fill(0xab));
        assert!(mem.read().iter().all(|&b| b == 0xab));
    }

    #[test]
    fn take_leaves_empty_memory() {
        let mem = FrameMemory::new(vec![1; 16]);
        let bytes = mem.take();
        assert_eq!(bytes.len(), 16);
        assert!(mem.is_empty());
    }

    #[test]
    fn panicked_writer_does_not_lock_out_readers() {
        let mem = FrameMemory::new(vec![0; 4]);
        let driver_side = mem.clone();
        let result = std::thread::spawn(move || {
            driver_side.write(|buf| {
                buf.fill(7);
                panic!("writer died mid-frame");
            })
        })
        .join();
        assert!(result.is_err());

        assert_eq!(&*mem.read(), &[7, 7, 7, 7]);
        assert_eq!(mem.take().len(), 4);
    }

    #[test]
    fn timed_out_frame_converts_to_error() {
        let mem = FrameMemory::new(vec![0; 4]);
        let frame = Frame {
            data: mem.read(),
            index: 3,
            sequence: 1,
            dropped: 0,
            timed_out: true,
            width: 2,
            height: 2,
            coding: PixelCoding::Mono8,
        };
        assert!(matches!(
            frame.ensure_complete(),
            Err(CameraError::FrameTimeout { index: 3 })
        ));
        assert!(frame.pixels_u16().is_none());
    }
}
