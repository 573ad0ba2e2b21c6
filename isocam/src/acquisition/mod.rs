//! 采集引擎：帧缓冲环、陈旧帧策略与采集会话

pub mod drop_policy;
pub mod ring;
pub mod session;

pub use drop_policy::{DropPolicy, ScanOutcome};
pub use ring::{AttachTarget, FrameBuffer, FrameBufferRing};
pub use session::{AcquisitionSession, SessionKind};
