use std::sync::{Arc, Mutex, PoisonError};

/// 仿真器记录的可观测事件，用于在测试中断言调用顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    ResourcesReserved { id: u64 },
    ResourcesReleased { id: u64 },
    StreamOpened { id: u64 },
    StreamClosed { id: u64 },
    SignalCreated { index: usize },
    SignalDestroyed { index: usize },
    MemoryAllocated { index: usize },
    MemoryReleased { index: usize },
    Attached { index: usize },
    Detached { index: usize },
    /// 硬件写完一帧
    Completed { index: usize },
    /// Driver 侧超时结束了一次 Attach
    Stalled { index: usize },
    ListenStarted,
    ListenStopped,
    VideoOn,
    VideoOff,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct EventLog {
    inner: Arc<Mutex<Vec<SimEvent>>>,
}

impl EventLog {
    pub(crate) fn push(&self, event: SimEvent) {
        tracing::trace!(?event, "sim event");
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    pub(crate) fn snapshot(&self) -> Vec<SimEvent> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
