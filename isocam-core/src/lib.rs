// 开启一些 Clippy 检查，保证代码质量
#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

// 模块定义
pub mod builder;
pub mod camera;
pub mod error;
pub mod frame;
pub mod pixel_format;
pub mod telemetry;
pub mod traits;

// 方便用户使用的 Prelude
pub mod prelude {
    pub use crate::builder::AcquisitionConfig;
    pub use crate::camera::{BusSpeed, CameraProfile, VideoSettings};
    pub use crate::error::{CameraError, Result};
    pub use crate::frame::{Frame, FrameData, FrameMemory};
    pub use crate::pixel_format::PixelCoding;
    pub use crate::telemetry::AcquisitionStats;
    pub use crate::traits::{Completion, FrameAllocator, IsochDriver, Stream, SystemAllocator};
}

// 重新导出依赖中的关键类型，避免用户版本冲突
pub use async_trait::async_trait;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
