use std::fmt;

/// 采集统计
///
/// 由 Session 在每次 acquire() 时更新，跨 start()/stop() 累计。
#[derive(Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub struct AcquisitionStats {
    /// 成功 start() 的次数
    pub sessions_started: u64,

    /// 交付给应用的帧数
    pub frames_acquired: u64,

    /// 因 drop-stale 策略被跳过的帧数
    pub frames_dropped: u64,

    /// 阻塞等待超时的次数 (帧仍被交付)
    pub frame_timeouts: u64,

    /// Driver 侧超时完成的帧 ("迟到但已就绪")
    pub stalled_frames: u64,

    /// Attach 请求总数 (含首次 Attach)
    pub attachments: u64,
}

impl fmt::Debug for AcquisitionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionStats")
            .field("acquired", &self.frames_acquired)
            .field("dropped", &self.frames_dropped)
            .field("timeouts", &self.frame_timeouts)
            .field("stalled", &self.stalled_frames)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamHealth {
    Healthy,
    Warning(HealthIssue),
    Critical(HealthIssue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthIssue {
    /// 应用消费太慢，大部分帧被跳过
    ConsumerTooSlow,
    /// 硬件迟迟不交付帧
    FrameStarvation,
}

impl AcquisitionStats {
    /// 基于统计数据的简单健康评估
    pub fn assess_health(&self) -> StreamHealth {
        if self.frames_acquired == 0 {
            return StreamHealth::Healthy;
        }

        let late = self.frame_timeouts + self.stalled_frames;
        if late * 2 > self.frames_acquired {
            return StreamHealth::Critical(HealthIssue::FrameStarvation);
        }
        if late > 0 {
            return StreamHealth::Warning(HealthIssue::FrameStarvation);
        }

        if self.frames_dropped > self.frames_acquired {
            return StreamHealth::Warning(HealthIssue::ConsumerTooSlow);
        }

        StreamHealth::Healthy
    }

    /// 导出当前统计快照
    #[cfg(feature = "serialize")]
    pub fn export_state(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
