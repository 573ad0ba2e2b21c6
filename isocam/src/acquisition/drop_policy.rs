//! 陈旧帧策略
//!
//! acquire() 的核心：从 current 开始向前扫描已完成的 Buffer，每越过一个就把
//! 空出来的 Buffer 重新 Attach 回硬件队列。开启 drop-stale 时一直跳到最新的
//! 已完成帧；否则只取下一帧。没有任何帧就绪时阻塞等待一帧。

use std::time::Duration;

use isocam_core::error::Result;
use isocam_core::traits::{Completion, IsochDriver};

use super::ring::{AttachTarget, FrameBufferRing};

/// 一次扫描的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOutcome {
    /// 交给应用的 Buffer (扫描结束后的 current)
    pub claimed: usize,
    /// 本次越过的已完成帧数 (含 claimed)
    pub ready: usize,
    /// 阻塞等待超时，claimed 中的数据可能不完整
    pub timed_out: bool,
    /// 等待期限到了硬件仍未写完 claimed (ready 中包含它，但它不是一帧)
    pub expired: bool,
    /// Driver 侧超时完成、按就绪处理的帧数
    pub stalled: usize,
    /// 本次重新 Attach 的 Buffer 数
    pub attached: usize,
}

impl ScanOutcome {
    pub fn dropped(&self) -> usize {
        self.ready.saturating_sub(1)
    }

    /// 硬件实际完成的帧数
    pub fn completed(&self) -> usize {
        self.ready - usize::from(self.expired)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DropPolicy {
    pub drop_stale: bool,
    pub frame_timeout: Duration,
}

impl DropPolicy {
    pub fn new(drop_stale: bool, frame_timeout: Duration) -> Self {
        Self {
            drop_stale,
            frame_timeout,
        }
    }

    /// 推进 current 到下一帧 (或最新帧)
    ///
    /// 返回错误时 Ring 仍满足 "current 不在硬件队列中"，Session 可以继续使用。
    pub async fn acquire_next<D>(
        &self,
        ring: &mut FrameBufferRing<D::Signal>,
        driver: &D,
        target: AttachTarget<'_>,
    ) -> Result<ScanOutcome>
    where
        D: IsochDriver,
    {
        let start = ring.current();
        let mut outcome = ScanOutcome {
            claimed: start,
            ready: 0,
            timed_out: false,
            expired: false,
            stalled: 0,
            attached: 0,
        };

        let mut probe = start;
        loop {
            let candidate = ring.advance_to_next(probe);
            if candidate == start {
                break;
            }

            match driver.poll_completion(ring.buffer(candidate).signal())? {
                Completion::Pending => break,
                Completion::TimedOut => {
                    tracing::warn!(index = candidate, "buffer finished with a driver timeout, using it anyway");
                    outcome.stalled += 1;
                }
                Completion::Ready => {}
            }

            outcome.ready += 1;
            reattach(ring, driver, target, probe).await?;
            outcome.attached += 1;
            probe = candidate;
            ring.set_current(probe);

            if !self.drop_stale {
                break;
            }
        }

        if outcome.ready == 0 || (self.drop_stale && probe == start) {
            self.wait_for_next(ring, driver, target, &mut outcome).await?;
        }

        outcome.claimed = ring.current();
        tracing::trace!(
            index = outcome.claimed,
            dropped = outcome.dropped(),
            timed_out = outcome.timed_out,
            "claimed buffer"
        );
        Ok(outcome)
    }

    /// 把空出来的 current 挂回去，然后阻塞等待它后面的那一帧
    async fn wait_for_next<D>(
        &self,
        ring: &mut FrameBufferRing<D::Signal>,
        driver: &D,
        target: AttachTarget<'_>,
        outcome: &mut ScanOutcome,
    ) -> Result<()>
    where
        D: IsochDriver,
    {
        let vacated = ring.current();
        let previous_last = ring.last();
        reattach(ring, driver, target, vacated).await?;
        outcome.attached += 1;

        let candidate = ring.advance_to_next(vacated);
        let waited = driver
            .wait_completion(ring.buffer(candidate).signal(), self.frame_timeout)
            .await;

        let completion = match waited {
            Ok(completion) => completion,
            Err(e) => {
                // 等待失败时 vacated 仍是 current，必须重新摘下
                detach_quietly(ring, driver, target, vacated).await;
                ring.set_last(previous_last);
                return Err(e);
            }
        };

        match completion {
            Completion::Ready => {}
            Completion::TimedOut => {
                tracing::warn!(index = candidate, "frame finished with a driver timeout");
                outcome.stalled += 1;
                outcome.timed_out = true;
            }
            Completion::Pending => {
                tracing::warn!(
                    index = candidate,
                    timeout_ms = self.frame_timeout.as_millis() as u64,
                    "timed out waiting for frame"
                );
                // 仍在硬件队列中的 Buffer 不能交给应用
                detach_quietly(ring, driver, target, candidate).await;
                if ring.last() == candidate {
                    ring.set_last(previous_last);
                }
                outcome.timed_out = true;
                outcome.expired = true;
            }
        }

        outcome.ready += 1;
        ring.set_current(candidate);
        Ok(())
    }
}

/// 重新 Attach 一个 Buffer；单 Buffer 的 Ring 在这里补发推迟的 listen
pub(crate) async fn reattach<D>(
    ring: &mut FrameBufferRing<D::Signal>,
    driver: &D,
    target: AttachTarget<'_>,
    index: usize,
) -> Result<()>
where
    D: IsochDriver,
{
    let previous_last = ring.last();
    ring.attach(driver, target, index).await?;
    if !ring.listen_deferred() {
        return Ok(());
    }

    tracing::debug!("issuing deferred listen request");
    if let Err(e) = listen(driver, target).await {
        detach_quietly(ring, driver, target, index).await;
        ring.set_last(previous_last);
        return Err(e);
    }
    ring.set_listen_deferred(false);
    Ok(())
}

/// listen 之后让相机开始发送；发送失败时撤销 listen
pub(crate) async fn listen<D>(driver: &D, target: AttachTarget<'_>) -> Result<()>
where
    D: IsochDriver,
{
    driver.begin_listening(target.stream, target.resource).await?;
    if let Err(e) = driver.start_video_stream().await {
        if let Err(stop_err) = driver.stop_listening(target.stream, target.resource).await {
            tracing::warn!(error = %stop_err, "failed to stop listening after video start failure");
        }
        return Err(e);
    }
    Ok(())
}

pub(crate) async fn detach_quietly<D>(
    ring: &FrameBufferRing<D::Signal>,
    driver: &D,
    target: AttachTarget<'_>,
    index: usize,
) where
    D: IsochDriver,
{
    if let Err(e) = driver
        .detach_buffer(target.stream, target.resource, index, ring.buffer(index).signal())
        .await
    {
        tracing::warn!(index, error = %e, "failed to detach buffer");
    }
}
