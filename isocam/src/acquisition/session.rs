use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use isocam_core::builder::AcquisitionConfig;
use isocam_core::camera::{CameraProfile, VideoSettings};
use isocam_core::error::{CameraError, Result};
use isocam_core::frame::Frame;
use isocam_core::telemetry::AcquisitionStats;
use isocam_core::traits::{
    Completion, FrameAllocator, IsochDriver, ResourceHandle, ResourceRequest, StreamHandle,
    Stream, SystemAllocator,
};

use super::drop_policy::{self, DropPolicy, ScanOutcome};
use super::ring::{AttachTarget, FrameBufferRing};

/// 会话类型：普通采集，或者旧式的单 Buffer 抓图
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Acquisition,
    Capture,
}

impl SessionKind {
    fn busy_reason(self) -> &'static str {
        match self {
            Self::Acquisition => "image acquisition already running",
            Self::Capture => "image capture already running",
        }
    }
}

/// Streaming 状态下才存在的资源。Ring 与它同生共死。
#[derive(Debug)]
struct ActiveStream<S> {
    ring: FrameBufferRing<S>,
    stream: StreamHandle,
    resource: ResourceHandle,
    kind: SessionKind,
    config: AcquisitionConfig,
    video: VideoSettings,
    /// 自 start() 以来硬件交付的帧数 (含被跳过的)
    sequence: u64,
}

#[derive(Debug)]
enum SessionState<S> {
    Idle,
    Streaming(ActiveStream<S>),
}

/// 采集会话
///
/// 取代全局相机对象：一个会话独占一个 Ring，`&mut self` 保证 start / acquire /
/// stop 串行执行。acquire() 返回的帧借用会话，下一次 acquire() 之前必须释放。
///
/// ```ignore
/// let mut session = AcquisitionSession::new(driver, camera, AcquisitionConfig::default());
/// session.start().await?;
/// let frame = session.acquire(true).await?;
/// println!("buffer {} dropped {}", frame.index, frame.dropped);
/// drop(frame);
/// session.stop().await?;
/// ```
pub struct AcquisitionSession<D: IsochDriver> {
    driver: D,
    allocator: Arc<dyn FrameAllocator>,
    camera: CameraProfile,
    config: AcquisitionConfig,
    state: SessionState<D::Signal>,
    stats: AcquisitionStats,
}

impl<D: IsochDriver> AcquisitionSession<D> {
    pub fn new(driver: D, camera: CameraProfile, config: AcquisitionConfig) -> Self {
        Self::with_allocator(driver, camera, config, Arc::new(SystemAllocator))
    }

    /// 使用自定义的帧内存分配器 (例如 DMA 对齐的内存)
    pub fn with_allocator(
        driver: D,
        camera: CameraProfile,
        config: AcquisitionConfig,
        allocator: Arc<dyn FrameAllocator>,
    ) -> Self {
        Self {
            driver,
            allocator,
            camera,
            config,
            state: SessionState::Idle,
            stats: AcquisitionStats::default(),
        }
    }

    // --- 启动 ---

    /// 按当前配置启动采集 (默认 6 个 Buffer)
    pub async fn start(&mut self) -> Result<()> {
        let config = self.config.clone();
        self.start_with(config, SessionKind::Acquisition).await
    }

    /// 指定 Buffer 数量与单帧超时启动采集
    pub async fn start_ex(&mut self, buffer_count: usize, frame_timeout: Duration) -> Result<()> {
        let config = self
            .config
            .clone()
            .buffer_count(buffer_count)
            .frame_timeout(frame_timeout);
        self.start_with(config, SessionKind::Acquisition).await
    }

    /// 旧式抓图：单 Buffer，listen 推迟到第一次 capture()
    pub async fn start_capture(&mut self) -> Result<()> {
        let config = self.config.clone().buffer_count(1);
        self.start_with(config, SessionKind::Capture).await
    }

    async fn start_with(&mut self, config: AcquisitionConfig, kind: SessionKind) -> Result<()> {
        self.camera.validate()?;
        if let SessionState::Streaming(active) = &self.state {
            return Err(CameraError::Busy(active.kind.busy_reason()));
        }
        config.validate()?;

        let video = self.camera.video.clone();
        tracing::info!(
            device = %self.camera.device_id,
            buffers = config.buffer_count,
            kind = ?kind,
            format = video.format,
            mode = video.mode,
            rate = video.frame_rate,
            fourcc = %video.coding.fourcc(),
            "starting image acquisition"
        );

        let request = ResourceRequest {
            max_bytes_per_packet: video.max_bytes_per_packet,
            max_buffer_size: video.max_buffer_size,
            speed: self.camera.speed,
        };
        let resource = self
            .driver
            .reserve_stream_resources(&request)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "isochronous resource allocation failed");
                CameraError::InsufficientResources(e.to_string())
            })?;

        let mut ring = match FrameBufferRing::allocate(
            config.buffer_count,
            video.max_buffer_size,
            self.allocator.as_ref(),
            &self.driver,
        ) {
            Ok(ring) => ring,
            Err(e) => {
                self.release_resources_quietly(resource).await;
                return Err(e);
            }
        };

        let stream = match self.driver.open_stream(&self.camera.device_id).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "failed to open stream handle");
                ring.release(self.allocator.as_ref(), &self.driver);
                self.release_resources_quietly(resource).await;
                return Err(e);
            }
        };

        let target = AttachTarget {
            stream: &stream,
            resource: &resource,
            flags: config.attach_flags,
            max_bytes_per_packet: video.max_bytes_per_packet,
        };
        let attached = match Self::prime(&self.driver, &mut ring, target).await {
            Ok(attached) => attached,
            Err(e) => {
                tracing::error!(error = %e, "failed to prime buffer ring, rolling back");
                for index in ring.in_flight() {
                    drop_policy::detach_quietly(&ring, &self.driver, target, index).await;
                }
                self.driver.close_stream(stream).await;
                ring.release(self.allocator.as_ref(), &self.driver);
                self.release_resources_quietly(resource).await;
                return Err(e);
            }
        };

        self.stats.sessions_started += 1;
        self.stats.attachments += attached as u64;
        tracing::debug!(
            attached,
            listen_deferred = ring.listen_deferred(),
            "image acquisition started"
        );

        self.state = SessionState::Streaming(ActiveStream {
            ring,
            stream,
            resource,
            kind,
            config,
            video,
            sequence: 0,
        });
        Ok(())
    }

    /// 最后一个 Buffer 作为 current，其余全部 Attach；多 Buffer 时立即 listen
    async fn prime(
        driver: &D,
        ring: &mut FrameBufferRing<D::Signal>,
        target: AttachTarget<'_>,
    ) -> Result<usize> {
        let current = ring.len() - 1;
        ring.set_current(current);
        ring.set_last(current);

        let attached = ring.mark_attached_up_to(driver, target, current).await?;

        if ring.len() > 1 {
            drop_policy::listen(driver, target).await?;
        } else {
            ring.set_listen_deferred(true);
        }
        Ok(attached)
    }

    // --- 取帧 ---

    /// 取下一帧
    ///
    /// `drop_stale` 为 true 时跳到最新完成的帧，`Frame::dropped` 是跳过的数量。
    /// 等待超时不是错误：帧照常返回，`Frame::timed_out` 置位。其他错误返回后
    /// 会话仍处于 Streaming。
    pub async fn acquire(&mut self, drop_stale: bool) -> Result<Frame<'_>> {
        let Self {
            driver,
            state,
            stats,
            ..
        } = self;
        let active = match state {
            SessionState::Streaming(active) => active,
            SessionState::Idle => {
                return Err(CameraError::NotInitialized("image acquisition not running"))
            }
        };
        let ActiveStream {
            ring,
            stream,
            resource,
            config,
            video,
            sequence,
            ..
        } = active;

        let target = AttachTarget {
            stream,
            resource,
            flags: config.attach_flags,
            max_bytes_per_packet: video.max_bytes_per_packet,
        };
        let policy = DropPolicy::new(drop_stale, config.frame_timeout_duration());
        let outcome = policy.acquire_next(ring, &*driver, target).await?;

        Self::record(stats, &outcome);
        *sequence += outcome.completed() as u64;
        if outcome.dropped() > 0 {
            tracing::debug!(dropped = outcome.dropped(), index = outcome.claimed, "skipped stale frames");
        }

        let index = outcome.claimed;
        Ok(Frame {
            data: ring.buffer(index).memory().read(),
            index,
            sequence: *sequence,
            dropped: outcome.dropped(),
            timed_out: outcome.timed_out,
            width: video.width,
            height: video.height,
            coding: video.coding,
        })
    }

    /// 旧式抓图取帧，等价于 acquire(true)
    pub async fn capture(&mut self) -> Result<Frame<'_>> {
        match self.kind() {
            Some(SessionKind::Capture) => self.acquire(true).await,
            _ => Err(CameraError::NotInitialized("image capture not running")),
        }
    }

    fn record(stats: &mut AcquisitionStats, outcome: &ScanOutcome) {
        stats.frames_acquired += 1;
        stats.frames_dropped += outcome.dropped() as u64;
        stats.frame_timeouts += u64::from(outcome.timed_out);
        stats.stalled_frames += outcome.stalled as u64;
        stats.attachments += outcome.attached as u64;
    }

    // --- 停止 ---

    /// 停止采集
    ///
    /// 先等待所有在途 Buffer 完成 (累计预算内)，再停止接收并释放内存与资源。
    /// 清理过程是尽力而为的：无论中途出现什么错误，返回时会话都已回到 Idle，
    /// 收集到的错误以 `CameraError::Teardown` 返回。
    pub async fn stop(&mut self) -> Result<()> {
        let active = match mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Streaming(active) => active,
            SessionState::Idle => {
                return Err(CameraError::NotInitialized("image acquisition not running"))
            }
        };
        let ActiveStream {
            mut ring,
            stream,
            resource,
            kind,
            config,
            video,
            ..
        } = active;

        tracing::info!(kind = ?kind, in_flight = ring.in_flight().len(), "stopping image acquisition");

        let target = AttachTarget {
            stream: &stream,
            resource: &resource,
            flags: config.attach_flags,
            max_bytes_per_packet: video.max_bytes_per_packet,
        };
        let mut errors = Vec::new();

        if let Err(e) = Self::drain(
            &self.driver,
            &mut ring,
            target,
            config.frame_timeout_duration(),
            config.drain_budget_duration(),
        )
        .await
        {
            errors.push(e);
        }

        // listen 从未发出时相机也没有开始发送
        if !ring.listen_deferred() {
            if let Err(e) = self.driver.stop_listening(&stream, &resource).await {
                tracing::warn!(error = %e, "isoch stop failed");
                errors.push(e);
            }
            if let Err(e) = self.driver.stop_video_stream().await {
                tracing::warn!(error = %e, "failed to stop camera transmission");
                errors.push(e);
            }
        }

        self.driver.close_stream(stream).await;
        ring.release(self.allocator.as_ref(), &self.driver);

        if let Err(e) = self.driver.release_stream_resources(resource).await {
            tracing::warn!(error = %e, "failed to free isochronous resources");
            errors.push(e);
        }

        if errors.is_empty() {
            tracing::info!("image acquisition stopped");
            Ok(())
        } else {
            tracing::warn!(errors = errors.len(), "image acquisition stopped with errors");
            Err(CameraError::Teardown(errors))
        }
    }

    /// 等待 current 之后的每个在途 Buffer 完成
    ///
    /// 每次等待不超过单帧超时，总时长不超过 `budget`。预算耗尽或等待出错时
    /// 摘下剩余的 Buffer，返回的错误不阻止后续清理。
    async fn drain(
        driver: &D,
        ring: &mut FrameBufferRing<D::Signal>,
        target: AttachTarget<'_>,
        frame_timeout: Duration,
        budget: Duration,
    ) -> Result<()> {
        let mut spent = Duration::ZERO;

        while ring.current() != ring.last() {
            let next = ring.advance_to_next(ring.current());
            let remaining = budget.saturating_sub(spent);
            if remaining.is_zero() {
                tracing::warn!(
                    index = next,
                    budget_ms = budget.as_millis() as u64,
                    "drain budget exhausted, abandoning in-flight buffers"
                );
                Self::abandon(driver, ring, target).await;
                return Err(CameraError::FrameTimeout { index: next });
            }

            let wait = frame_timeout.min(remaining);
            let started = Instant::now();
            match driver.wait_completion(ring.buffer(next).signal(), wait).await {
                Ok(Completion::Ready) => {
                    spent += started.elapsed();
                    ring.set_current(next);
                }
                Ok(Completion::TimedOut) => {
                    tracing::warn!(index = next, "in-flight buffer finished with a driver timeout");
                    spent += started.elapsed();
                    ring.set_current(next);
                }
                // 等待本身到期，整段时间计入预算
                Ok(Completion::Pending) => spent += wait,
                Err(e) => {
                    tracing::error!(index = next, error = %e, "wait failed while draining");
                    Self::abandon(driver, ring, target).await;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn abandon(driver: &D, ring: &mut FrameBufferRing<D::Signal>, target: AttachTarget<'_>) {
        for index in ring.in_flight() {
            drop_policy::detach_quietly(ring, driver, target, index).await;
        }
        ring.set_last(ring.current());
    }

    async fn release_resources_quietly(&self, resource: ResourceHandle) {
        if let Err(e) = self.driver.release_stream_resources(resource).await {
            tracing::warn!(error = %e, "failed to free isochronous resources during rollback");
        }
    }

    // --- 查询与配置 ---

    pub fn is_streaming(&self) -> bool {
        matches!(self.state, SessionState::Streaming(_))
    }

    pub fn kind(&self) -> Option<SessionKind> {
        match &self.state {
            SessionState::Streaming(active) => Some(active.kind),
            SessionState::Idle => None,
        }
    }

    /// 下一个待完成 Buffer 的完成信号 (未在采集时为 None)
    ///
    /// 应用可以在自己的事件循环中等待它，然后再调用 acquire()。
    pub fn frame_ready_signal(&self) -> Option<&D::Signal> {
        match &self.state {
            SessionState::Streaming(active) => {
                let ring = &active.ring;
                let next = ring.advance_to_next(ring.current());
                Some(ring.buffer(next).signal())
            }
            SessionState::Idle => None,
        }
    }

    /// Streaming 时的 Ring (只读)
    pub fn ring(&self) -> Option<&FrameBufferRing<D::Signal>> {
        match &self.state {
            SessionState::Streaming(active) => Some(&active.ring),
            SessionState::Idle => None,
        }
    }

    pub fn stats(&self) -> &AcquisitionStats {
        &self.stats
    }

    pub fn camera(&self) -> &CameraProfile {
        &self.camera
    }

    /// 更换相机状态 (视频模式、速率等)；采集中不允许修改
    pub fn update_camera(&mut self, camera: CameraProfile) -> Result<()> {
        if let SessionState::Streaming(active) = &self.state {
            return Err(CameraError::Busy(active.kind.busy_reason()));
        }
        self.camera = camera;
        Ok(())
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// 修改默认配置，下一次 start() 生效
    pub fn set_config(&mut self, config: AcquisitionConfig) {
        self.config = config;
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }
}

impl<D: IsochDriver> Drop for AcquisitionSession<D> {
    fn drop(&mut self) {
        // 析构中无法 await：只能同步归还帧内存，流句柄与带宽交给 Driver 回收
        if let SessionState::Streaming(mut active) = mem::replace(&mut self.state, SessionState::Idle) {
            tracing::warn!(
                in_flight = active.ring.in_flight().len(),
                "session dropped while streaming, call stop() first"
            );
            active.ring.release(self.allocator.as_ref(), &self.driver);
        }
    }
}

impl<D> fmt::Debug for AcquisitionSession<D>
where
    D: IsochDriver + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionSession")
            .field("driver", &self.driver)
            .field("device", &self.camera.device_id)
            .field("kind", &self.kind())
            .field("stats", &self.stats)
            .finish()
    }
}

#[async_trait]
impl<D: IsochDriver> Stream for AcquisitionSession<D> {
    async fn start(&mut self) -> Result<()> {
        AcquisitionSession::start(self).await
    }

    async fn stop(&mut self) -> Result<()> {
        AcquisitionSession::stop(self).await
    }

    async fn next_frame(&mut self) -> Result<Frame<'_>> {
        let drop_stale = self.config.drop_stale_frames;
        self.acquire(drop_stale).await
    }
}
