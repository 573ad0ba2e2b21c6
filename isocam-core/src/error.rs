use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Camera not initialized: {0}")]
    NotInitialized(&'static str),

    #[error("Current video settings ({format},{mode},{rate}) are not supported")]
    InvalidVideoSettings { format: u8, mode: u8, rate: u8 },

    #[error("Device busy: {0}")]
    Busy(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Insufficient isochronous resources: {0}")]
    InsufficientResources(String),

    #[error("Out of memory allocating frame buffer {index} ({bytes} bytes)")]
    OutOfMemory { index: usize, bytes: usize },

    /// 单帧等待超时，可恢复，不代表流失败
    #[error("Frame timeout on buffer {index}")]
    FrameTimeout { index: usize },

    /// Driver 返回的底层错误码
    #[error("Driver error {code:#010x} during {op}")]
    Driver { op: &'static str, code: u32 },

    #[error("Device disconnected: {0}")]
    Disconnected(String),

    /// stop() 的尽力清理过程中收集到的错误 (此时 Session 已回到 Idle)
    #[error("Teardown finished with {} error(s): {}", .0.len(), summarize(.0))]
    Teardown(Vec<CameraError>),
}

impl CameraError {
    /// 是否为可恢复错误 (调用方可以继续 acquire)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::FrameTimeout { .. })
    }

    /// 底层 Driver 错误码 (如果有)
    pub fn driver_code(&self) -> Option<u32> {
        match self {
            Self::Driver { code, .. } => Some(*code),
            _ => None,
        }
    }
}

fn summarize(errors: &[CameraError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, CameraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teardown_lists_every_failure() {
        let err = CameraError::Teardown(vec![
            CameraError::Driver {
                op: "isoch stop",
                code: 0x1f,
            },
            CameraError::InsufficientResources("channel 3 still owned".into()),
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("Teardown finished with 2 error(s)"));
        assert!(msg.contains("0x0000001f"));
        assert!(msg.contains("channel 3"));
    }

    #[test]
    fn only_frame_timeout_is_recoverable() {
        assert!(CameraError::FrameTimeout { index: 2 }.is_recoverable());
        assert!(!CameraError::Busy("acquiring").is_recoverable());
        assert_eq!(
            CameraError::Driver {
                op: "attach",
                code: 87
            }
            .driver_code(),
            Some(87)
        );
    }
}
