use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use isocam_core::builder::AcquisitionConfig;
use isocam_core::camera::CameraProfile;
use isocam_core::pixel_format::{FourCC, PixelCoding};
use isocam_core::telemetry::AcquisitionStats;
use isocam_core::traits::{FrameAllocator, IsochDriver, SystemAllocator};

use crate::acquisition::AcquisitionSession;
use crate::internal::runtime;

/// 指令：主线程发送给后台 Worker 的命令
enum Command {
    /// 请求下一帧
    NextFrame,
    /// 查询统计数据
    Stats,
    /// 停止采集并退出 Worker
    Stop,
}

/// 响应：后台 Worker 发回的数据
enum Response {
    /// start() 的结果
    Started(Result<(), String>),
    Frame(CapturedFrame),
    Stats(AcquisitionStats),
    /// stop() 的结果
    Stopped(Result<(), String>),
    Error(String),
}

/// 拷贝出来的一帧 (拥有数据所有权)
#[derive(Debug, Clone, Default)]
pub struct CapturedFrame {
    pub data: Vec<u8>,
    pub index: usize,
    pub sequence: u64,
    pub dropped: usize,
    pub timed_out: bool,
    pub width: u32,
    pub height: u32,
    pub coding: PixelCoding,
}

impl CapturedFrame {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn fourcc(&self) -> FourCC {
        self.coding.fourcc()
    }
}

/// 阻塞式采集接口
///
/// 每个 IsochCapture 有自己的 Worker 线程，在全局 Runtime 上驱动 AcquisitionSession，调用方不需要 async。
/// 帧数据在后台拷贝到 Vec 中返回，所以 Ring 中的 Buffer 可以立即被重新 Attach。
#[derive(Debug)]
pub struct IsochCapture {
    // 发送指令的通道
    cmd_tx: Sender<Command>,
    // 接收数据的通道
    res_rx: Receiver<Response>,
    width: u32,
    height: u32,
    is_opened: bool,
}

impl IsochCapture {
    /// 启动采集。start() 失败时直接返回错误。
    pub fn open<D>(driver: D, camera: CameraProfile, config: AcquisitionConfig) -> Result<Self>
    where
        D: IsochDriver + 'static,
    {
        Self::open_with_allocator(driver, camera, config, Arc::new(SystemAllocator))
    }

    pub fn open_with_allocator<D>(
        driver: D,
        camera: CameraProfile,
        config: AcquisitionConfig,
        allocator: Arc<dyn FrameAllocator>,
    ) -> Result<Self>
    where
        D: IsochDriver + 'static,
    {
        let drop_stale = config.drop_stale_frames;
        let width = camera.video.width;
        let height = camera.video.height;
        let mut session = AcquisitionSession::with_allocator(driver, camera, config, allocator);

        // 同步通道 (容量为 1，保证背压)
        let (cmd_tx, cmd_rx) = bounded::<Command>(1);
        let (res_tx, res_rx) = bounded::<Response>(1);

        // Worker 独占一个 OS 线程，阻塞等待指令不占用 Runtime 的工作线程。
        // 一直运行到 Stop 指令或 IsochCapture 被 Drop
        let runtime = runtime::get_runtime()?;
        let worker = async move {
            if let Err(e) = session.start().await {
                let _ = res_tx.send(Response::Started(Err(e.to_string())));
                return;
            }
            if res_tx.send(Response::Started(Ok(()))).is_err() {
                let _ = session.stop().await;
                return;
            }

            while let Ok(cmd) = cmd_rx.recv() {
                match cmd {
                    Command::NextFrame => {
                        let response = match session.acquire(drop_stale).await {
                            // Frame<'_> 不能逃逸出 Worker，这里拷贝到 Vec
                            Ok(frame) => Response::Frame(CapturedFrame {
                                data: frame.data.to_vec(),
                                index: frame.index,
                                sequence: frame.sequence,
                                dropped: frame.dropped,
                                timed_out: frame.timed_out,
                                width: frame.width,
                                height: frame.height,
                                coding: frame.coding,
                            }),
                            Err(e) => Response::Error(e.to_string()),
                        };
                        let _ = res_tx.send(response);
                    }
                    Command::Stats => {
                        let _ = res_tx.send(Response::Stats(session.stats().clone()));
                    }
                    Command::Stop => {
                        let result = session.stop().await.map_err(|e| e.to_string());
                        let _ = res_tx.send(Response::Stopped(result));
                        return;
                    }
                }
            }

            // 通道断开：调用方没有显式 release()
            if let Err(e) = session.stop().await {
                tracing::warn!(error = %e, "stop after capture handle dropped failed");
            }
        };
        std::thread::Builder::new()
            .name("isocam-capture".into())
            .spawn(move || runtime.block_on(worker))
            .context("Failed to spawn capture worker thread")?;

        match res_rx.recv() {
            Ok(Response::Started(Ok(()))) => {}
            Ok(Response::Started(Err(msg))) => {
                return Err(anyhow!("Failed to start image acquisition: {}", msg))
            }
            Ok(_) => return Err(anyhow!("Unexpected response from worker")),
            Err(_) => return Err(anyhow!("Background worker is dead")),
        }
        tracing::debug!(width, height, "isochronous capture opened");

        Ok(Self {
            cmd_tx,
            res_rx,
            width,
            height,
            is_opened: true,
        })
    }

    /// 读取下一帧
    ///
    /// # 返回值
    /// * `Ok(true)` - 读取成功 (`frame.timed_out` 表示数据可能不完整)
    /// * `Ok(false)` - 已经 release
    /// * `Err(e)` - Driver 错误
    pub fn read(&mut self, frame: &mut CapturedFrame) -> Result<bool> {
        if !self.is_opened {
            return Ok(false);
        }

        match self.request(Command::NextFrame)? {
            Response::Frame(mut captured) => {
                self.width = captured.width;
                self.height = captured.height;
                // 直接交换 Vec，调用方旧的数据随 captured 一起释放
                std::mem::swap(frame, &mut captured);
                Ok(true)
            }
            Response::Error(msg) => Err(anyhow!("Capture error: {}", msg)),
            _ => Err(anyhow!("Unexpected response from worker")),
        }
    }

    pub fn stats(&self) -> Result<AcquisitionStats> {
        if !self.is_opened {
            return Err(anyhow!("Capture already released"));
        }
        match self.request(Command::Stats)? {
            Response::Stats(stats) => Ok(stats),
            _ => Err(anyhow!("Unexpected response from worker")),
        }
    }

    /// 停止采集并等待清理完成
    pub fn release(&mut self) -> Result<()> {
        if !self.is_opened {
            return Ok(());
        }
        self.is_opened = false;

        match self.request(Command::Stop)? {
            Response::Stopped(Ok(())) => Ok(()),
            Response::Stopped(Err(msg)) => Err(anyhow!("Stop finished with errors: {}", msg)),
            _ => Err(anyhow!("Unexpected response from worker")),
        }
    }

    fn request(&self, cmd: Command) -> Result<Response> {
        if self.cmd_tx.send(cmd).is_err() {
            return Err(anyhow!("Background worker is dead"));
        }
        self.res_rx
            .recv()
            .map_err(|_| anyhow!("Failed to receive response from worker"))
    }

    pub fn is_opened(&self) -> bool {
        self.is_opened
    }

    pub fn get_width(&self) -> u32 {
        self.width
    }

    pub fn get_height(&self) -> u32 {
        self.height
    }
}

// 析构函数：通知后台 Worker 停止采集
impl Drop for IsochCapture {
    fn drop(&mut self) {
        if self.is_opened {
            let _ = self.cmd_tx.send(Command::Stop);
        }
    }
}
