//! 仿真的 1394 等时驱动
//!
//! 模拟内核驱动的行为：Attach 的 Buffer 按顺序进入硬件接收队列，只有在
//! listen 之后才会被写满并触发完成信号。所有资源 (带宽、流句柄、信号、帧内存)
//! 都有记账，便于在测试中检查泄漏与调用顺序。

pub mod allocator;
pub mod driver;
pub mod events;
pub mod signal;

pub use allocator::TrackingAllocator;
pub use driver::{FaultPlan, Producer, SimDriver, SIM_DOUBLE_ATTACH, SIM_FAULT, SIM_NO_BANDWIDTH};
pub use events::SimEvent;
pub use signal::SimSignal;
