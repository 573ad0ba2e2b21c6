use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use isocam_core::error::{CameraError, Result};
use isocam_core::traits::FrameAllocator;

use crate::events::{EventLog, SimEvent};

#[derive(Debug, Default)]
struct Accounting {
    live: BTreeSet<usize>,
    total_allocations: usize,
    fail_index: Option<usize>,
}

/// 记账型帧分配器：统计在用的 Buffer，并可在指定序号上模拟分配失败
#[derive(Debug, Clone)]
pub struct TrackingAllocator {
    accounting: Arc<Mutex<Accounting>>,
    events: EventLog,
}

impl TrackingAllocator {
    pub(crate) fn new(events: EventLog) -> Self {
        Self {
            accounting: Arc::new(Mutex::new(Accounting::default())),
            events,
        }
    }

    /// 下一次为 `index` 分配内存时返回 OutOfMemory
    pub fn fail_allocation_at(&self, index: usize) {
        self.lock().fail_index = Some(index);
    }

    /// 尚未归还的 Buffer 数量
    pub fn outstanding(&self) -> usize {
        self.lock().live.len()
    }

    pub fn total_allocations(&self) -> usize {
        self.lock().total_allocations
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Accounting> {
        self.accounting.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameAllocator for TrackingAllocator {
    fn allocate(&self, index: usize, len: usize) -> Result<Vec<u8>> {
        let mut acct = self.lock();
        if acct.fail_index == Some(index) {
            acct.fail_index = None;
            return Err(CameraError::OutOfMemory { index, bytes: len });
        }
        acct.live.insert(index);
        acct.total_allocations += 1;
        drop(acct);

        self.events.push(SimEvent::MemoryAllocated { index });
        Ok(vec![0; len])
    }

    fn release(&self, index: usize, bytes: Vec<u8>) {
        drop(bytes);
        if !self.lock().live.remove(&index) {
            tracing::warn!(index, "release of a buffer that was never allocated");
        }
        self.events.push(SimEvent::MemoryReleased { index });
    }
}
