use std::time::Duration;

use crate::error::{CameraError, Result};
use crate::traits::AttachFlags;

/// 缺省 Ring Buffer 大小 (与旧版 StartImageAcquisition() 一致)
pub const DEFAULT_BUFFER_COUNT: usize = 6;

/// 单帧等待上限
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_millis(1000);

/// stop() 排空在途 Buffer 的累计时间预算
pub const DEFAULT_DRAIN_BUDGET: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(default))]
pub struct AcquisitionConfig {
    pub buffer_count: usize,       // Ring Buffer 大小，默认 6
    pub frame_timeout_ms: u64,     // 单帧阻塞等待上限
    pub drain_budget_ms: u64,      // stop() 排空的累计预算
    pub drop_stale_frames: bool,   // acquire 默认是否跳到最新帧
    #[cfg_attr(feature = "serialize", serde(with = "attach_flags_bits"))]
    pub attach_flags: AttachFlags, // 每个 Attach 描述符携带的标志
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionConfig {
    pub fn new() -> Self {
        Self {
            buffer_count: DEFAULT_BUFFER_COUNT,
            frame_timeout_ms: DEFAULT_FRAME_TIMEOUT.as_millis() as u64,
            drain_budget_ms: DEFAULT_DRAIN_BUDGET.as_millis() as u64,
            drop_stale_frames: true,
            attach_flags: AttachFlags::default(),
        }
    }

    /// 设置缓冲区数量 (默认 6，最少 1)
    pub fn buffer_count(mut self, count: usize) -> Self {
        self.buffer_count = count;
        self
    }

    /// 不足 1ms 的部分向上取整，非零的超时不会变成 0
    pub fn frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout_ms = millis_ceil(timeout);
        self
    }

    /// stop() 时等待在途帧的累计预算
    pub fn drain_budget(mut self, budget: Duration) -> Self {
        self.drain_budget_ms = millis_ceil(budget);
        self
    }

    pub fn drop_stale_frames(mut self, drop: bool) -> Self {
        self.drop_stale_frames = drop;
        self
    }

    pub fn attach_flags(mut self, flags: AttachFlags) -> Self {
        self.attach_flags = flags;
        self
    }

    pub fn frame_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn drain_budget_duration(&self) -> Duration {
        Duration::from_millis(self.drain_budget_ms)
    }

    /// 参数合法性检查 (start() 之前调用)
    pub fn validate(&self) -> Result<()> {
        if self.buffer_count < 1 {
            return Err(CameraError::InvalidArgument(format!(
                "buffer_count must be at least 1, got {}",
                self.buffer_count
            )));
        }
        if self.frame_timeout_ms == 0 {
            return Err(CameraError::InvalidArgument(
                "frame_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// 从 JSON 加载配置，缺省字段使用默认值
    #[cfg(feature = "serialize")]
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| CameraError::InvalidArgument(format!("bad acquisition config: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}

fn millis_ceil(d: Duration) -> u64 {
    let ms = d.as_millis() as u64;
    if Duration::from_millis(ms) < d {
        ms + 1
    } else {
        ms
    }
}

#[cfg(feature = "serialize")]
mod attach_flags_bits {
    use super::AttachFlags;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(flags: &AttachFlags, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u32(flags.bits())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<AttachFlags, D::Error> {
        let bits = u32::deserialize(d)?;
        Ok(AttachFlags::from_bits_truncate(bits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_legacy_start() {
        let cfg = AcquisitionConfig::default();
        assert_eq!(cfg.buffer_count, 6);
        assert_eq!(cfg.drain_budget_duration(), Duration::from_secs(10));
        assert!(cfg.drop_stale_frames);
        assert!(cfg.attach_flags.contains(AttachFlags::AUTO_DETACH));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn sub_millisecond_timeouts_round_up() {
        let cfg = AcquisitionConfig::new()
            .frame_timeout(Duration::from_micros(500))
            .drain_budget(Duration::from_micros(1_500));
        assert_eq!(cfg.frame_timeout_duration(), Duration::from_millis(1));
        assert_eq!(cfg.drain_budget_duration(), Duration::from_millis(2));
        assert!(cfg.validate().is_ok());

        let cfg = cfg.frame_timeout(Duration::from_millis(250));
        assert_eq!(cfg.frame_timeout_duration(), Duration::from_millis(250));
        assert!(AcquisitionConfig::new().frame_timeout(Duration::ZERO).validate().is_err());
    }

    #[test]
    fn zero_buffers_is_rejected() {
        let err = AcquisitionConfig::new().buffer_count(0).validate().unwrap_err();
        assert!(matches!(err, CameraError::InvalidArgument(_)));
    }

    #[cfg(feature = "serialize")]
    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let cfg = AcquisitionConfig::from_json(r#"{ "buffer_count": 3, "drop_stale_frames": false }"#)
            .unwrap();
        assert_eq!(cfg.buffer_count, 3);
        assert!(!cfg.drop_stale_frames);
        assert_eq!(cfg.frame_timeout_duration(), DEFAULT_FRAME_TIMEOUT);

        assert!(AcquisitionConfig::from_json(r#"{ "buffer_count": 0 }"#).is_err());
    }
}
