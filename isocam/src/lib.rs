pub mod acquisition;
pub(crate) mod internal;
pub mod videoio;

// Re-export 核心 crate，方便实现自定义 Driver
pub use isocam_core;

pub use acquisition::{AcquisitionSession, FrameBufferRing, SessionKind};
pub use videoio::{CapturedFrame, IsochCapture};

/// 预置模块，用户可以通过 `use isocam::prelude::*;` 导入常用项
pub mod prelude {
    pub use crate::acquisition::{AcquisitionSession, SessionKind};
    pub use crate::videoio::{CapturedFrame, IsochCapture};
    pub use isocam_core::prelude::*;
}
