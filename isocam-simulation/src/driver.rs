use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use isocam_core::error::{CameraError, Result};
use isocam_core::frame::FrameMemory;
use isocam_core::traits::{
    AttachFlags, AttachRequest, Completion, IsochDriver, ResourceHandle, ResourceRequest,
    StreamHandle,
};

use crate::allocator::TrackingAllocator;
use crate::events::{EventLog, SimEvent};
use crate::signal::SimSignal;

/// 注入故障时返回的错误码 (ERROR_GEN_FAILURE)
pub const SIM_FAULT: u32 = 0x1f;
/// 同一 Buffer 在完成前被重复 Attach (ERROR_BUSY)
pub const SIM_DOUBLE_ATTACH: u32 = 0xaa;
/// 带宽不足 (ERROR_NO_SYSTEM_RESOURCES)
pub const SIM_NO_BANDWIDTH: u32 = 0x5aa;

/// 故障注入计划，每个字段对应一个 Driver 调用
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    pub fail_reserve: bool,
    pub fail_open: bool,
    /// 第 N 次 attach 调用失败 (从 1 开始计数)
    pub fail_attach_call: Option<usize>,
    pub fail_listen: bool,
    pub fail_video_start: bool,
    /// 为该序号创建信号时失败
    pub fail_signal_for: Option<usize>,
    pub fail_isoch_stop: bool,
    pub fail_release: bool,
    pub fail_poll: bool,
}

#[derive(Debug)]
struct Queued {
    index: usize,
    memory: FrameMemory,
    signal: SimSignal,
}

#[derive(Debug, Default)]
struct Ledger {
    /// 硬件接收队列 (按 Attach 顺序完成)
    queue: VecDeque<Queued>,
    listening: bool,
    video_on: bool,
    listen_calls: usize,
    attach_calls: usize,
    double_attaches: usize,
    live_resources: usize,
    live_streams: usize,
    live_signals: usize,
    next_id: u64,
    frames_delivered: u64,
    faults: FaultPlan,
}

#[derive(Debug)]
struct Shared {
    ledger: Mutex<Ledger>,
    events: EventLog,
    allocator: TrackingAllocator,
}

/// 仿真的等时驱动
///
/// 克隆共享同一个硬件状态：测试把一个克隆交给 Session，另一个用来
/// 推动帧完成并检查记账。
#[derive(Debug, Clone)]
pub struct SimDriver {
    shared: Arc<Shared>,
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDriver {
    pub fn new() -> Self {
        let events = EventLog::default();
        Self {
            shared: Arc::new(Shared {
                ledger: Mutex::new(Ledger::default()),
                allocator: TrackingAllocator::new(events.clone()),
                events,
            }),
        }
    }

    pub fn with_faults(faults: FaultPlan) -> Self {
        let driver = Self::new();
        driver.set_faults(faults);
        driver
    }

    pub fn set_faults(&self, faults: FaultPlan) {
        self.ledger().faults = faults;
    }

    /// 与本驱动共享事件日志的分配器
    pub fn allocator(&self) -> TrackingAllocator {
        self.shared.allocator.clone()
    }

    // --- 硬件侧操作 (由测试或生产者任务调用) ---

    /// 硬件写完队首的 Buffer。未在接收或队列为空时返回 None。
    pub fn complete_next(&self) -> Option<usize> {
        let mut ledger = self.ledger();
        if !ledger.listening {
            return None;
        }
        let queued = ledger.queue.pop_front()?;
        ledger.frames_delivered += 1;
        let fill = (ledger.frames_delivered % 256) as u8;
        drop(ledger);

        queued.memory.write(|buf| buf.fill(fill));
        self.shared.events.push(SimEvent::Completed {
            index: queued.index,
        });
        queued.signal.set(Completion::Ready);
        Some(queued.index)
    }

    /// 连续完成 n 帧，返回实际完成的序号
    pub fn complete_frames(&self, n: usize) -> Vec<usize> {
        (0..n).map_while(|_| self.complete_next()).collect()
    }

    /// Driver 侧超时：队首的 Attach 以 TimedOut 结束
    pub fn stall_next(&self) -> Option<usize> {
        let queued = self.ledger().queue.pop_front()?;
        self.shared.events.push(SimEvent::Stalled {
            index: queued.index,
        });
        queued.signal.set(Completion::TimedOut);
        Some(queued.index)
    }

    /// 周期性完成帧的后台任务，句柄析构时停止
    pub fn spawn_producer(&self, interval: Duration) -> Producer {
        let driver = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if driver.ledger().video_on {
                    driver.complete_next();
                }
            }
        });
        Producer { task }
    }

    // --- 记账查询 ---

    /// 当前挂在硬件队列上的 Buffer (按完成顺序)
    pub fn attached(&self) -> Vec<usize> {
        self.ledger().queue.iter().map(|q| q.index).collect()
    }

    pub fn is_attached(&self, index: usize) -> bool {
        self.ledger().queue.iter().any(|q| q.index == index)
    }

    pub fn is_listening(&self) -> bool {
        self.ledger().listening
    }

    pub fn listen_calls(&self) -> usize {
        self.ledger().listen_calls
    }

    pub fn attach_calls(&self) -> usize {
        self.ledger().attach_calls
    }

    pub fn double_attaches(&self) -> usize {
        self.ledger().double_attaches
    }

    pub fn video_streaming(&self) -> bool {
        self.ledger().video_on
    }

    pub fn outstanding_resources(&self) -> usize {
        self.ledger().live_resources
    }

    pub fn open_streams(&self) -> usize {
        self.ledger().live_streams
    }

    pub fn outstanding_signals(&self) -> usize {
        self.ledger().live_signals
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.shared.events.snapshot()
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.shared
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn fault(op: &'static str) -> CameraError {
        CameraError::Driver {
            op,
            code: SIM_FAULT,
        }
    }
}

/// 生产者任务句柄
#[derive(Debug)]
pub struct Producer {
    task: JoinHandle<()>,
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl IsochDriver for SimDriver {
    type Signal = SimSignal;

    async fn reserve_stream_resources(&self, request: &ResourceRequest) -> Result<ResourceHandle> {
        let mut ledger = self.ledger();
        if ledger.faults.fail_reserve {
            return Err(Self::fault("allocate resources"));
        }
        if request.max_bytes_per_packet > request.speed.max_isoch_payload() {
            return Err(CameraError::Driver {
                op: "allocate bandwidth",
                code: SIM_NO_BANDWIDTH,
            });
        }
        ledger.next_id += 1;
        ledger.live_resources += 1;
        let id = ledger.next_id;
        drop(ledger);

        self.shared.events.push(SimEvent::ResourcesReserved { id });
        Ok(ResourceHandle {
            id,
            channel: (id % 64) as u8,
        })
    }

    async fn release_stream_resources(&self, resource: ResourceHandle) -> Result<()> {
        let mut ledger = self.ledger();
        if ledger.faults.fail_release {
            return Err(Self::fault("free resources"));
        }
        ledger.live_resources = ledger.live_resources.saturating_sub(1);
        drop(ledger);

        self.shared
            .events
            .push(SimEvent::ResourcesReleased { id: resource.id });
        Ok(())
    }

    async fn open_stream(&self, device_id: &str) -> Result<StreamHandle> {
        let mut ledger = self.ledger();
        if ledger.faults.fail_open {
            return Err(Self::fault("open device"));
        }
        ledger.next_id += 1;
        ledger.live_streams += 1;
        let id = ledger.next_id;
        drop(ledger);

        self.shared.events.push(SimEvent::StreamOpened { id });
        Ok(StreamHandle {
            id,
            device_id: device_id.to_string(),
        })
    }

    async fn close_stream(&self, stream: StreamHandle) {
        {
            let mut ledger = self.ledger();
            ledger.live_streams = ledger.live_streams.saturating_sub(1);
        }
        self.shared
            .events
            .push(SimEvent::StreamClosed { id: stream.id });
    }

    fn create_signal(&self, index: usize) -> Result<Self::Signal> {
        let mut ledger = self.ledger();
        if ledger.faults.fail_signal_for == Some(index) {
            return Err(Self::fault("create event"));
        }
        ledger.live_signals += 1;
        drop(ledger);

        self.shared.events.push(SimEvent::SignalCreated { index });
        Ok(SimSignal::new(index))
    }

    fn reset_signal(&self, signal: &Self::Signal) {
        signal.set(Completion::Pending);
    }

    fn destroy_signal(&self, signal: Self::Signal) {
        {
            let mut ledger = self.ledger();
            ledger.live_signals = ledger.live_signals.saturating_sub(1);
        }
        self.shared.events.push(SimEvent::SignalDestroyed {
            index: signal.index(),
        });
    }

    async fn attach_buffer(
        &self,
        _stream: &StreamHandle,
        _resource: &ResourceHandle,
        request: AttachRequest,
        signal: &Self::Signal,
    ) -> Result<()> {
        let mut ledger = self.ledger();
        ledger.attach_calls += 1;
        if ledger.faults.fail_attach_call == Some(ledger.attach_calls) {
            return Err(Self::fault("attach buffer"));
        }
        if ledger.queue.iter().any(|q| q.index == request.index) {
            ledger.double_attaches += 1;
            return Err(CameraError::Driver {
                op: "attach buffer",
                code: SIM_DOUBLE_ATTACH,
            });
        }
        if !request.flags.contains(AttachFlags::USE_CALLBACK) {
            tracing::warn!(
                index = request.index,
                "attach without USE_CALLBACK never signals completion"
            );
        }
        ledger.queue.push_back(Queued {
            index: request.index,
            memory: request.memory,
            signal: signal.clone(),
        });
        drop(ledger);

        self.shared.events.push(SimEvent::Attached {
            index: request.index,
        });
        Ok(())
    }

    async fn detach_buffer(
        &self,
        _stream: &StreamHandle,
        _resource: &ResourceHandle,
        index: usize,
        _signal: &Self::Signal,
    ) -> Result<()> {
        let removed = {
            let mut ledger = self.ledger();
            let before = ledger.queue.len();
            ledger.queue.retain(|q| q.index != index);
            before != ledger.queue.len()
        };
        if removed {
            self.shared.events.push(SimEvent::Detached { index });
        }
        Ok(())
    }

    async fn begin_listening(
        &self,
        _stream: &StreamHandle,
        _resource: &ResourceHandle,
    ) -> Result<()> {
        let mut ledger = self.ledger();
        if ledger.faults.fail_listen {
            return Err(Self::fault("isoch listen"));
        }
        ledger.listen_calls += 1;
        ledger.listening = true;
        drop(ledger);

        self.shared.events.push(SimEvent::ListenStarted);
        Ok(())
    }

    async fn stop_listening(
        &self,
        _stream: &StreamHandle,
        _resource: &ResourceHandle,
    ) -> Result<()> {
        let mut ledger = self.ledger();
        if ledger.faults.fail_isoch_stop {
            return Err(Self::fault("isoch stop"));
        }
        ledger.listening = false;
        drop(ledger);

        self.shared.events.push(SimEvent::ListenStopped);
        Ok(())
    }

    fn poll_completion(&self, signal: &Self::Signal) -> Result<Completion> {
        if self.ledger().faults.fail_poll {
            return Err(Self::fault("get overlapped result"));
        }
        Ok(signal.state())
    }

    async fn wait_completion(&self, signal: &Self::Signal, timeout: Duration) -> Result<Completion> {
        signal.wait(timeout).await
    }

    async fn start_video_stream(&self) -> Result<()> {
        let mut ledger = self.ledger();
        if ledger.faults.fail_video_start {
            return Err(Self::fault("write ISO_EN"));
        }
        ledger.video_on = true;
        drop(ledger);

        self.shared.events.push(SimEvent::VideoOn);
        Ok(())
    }

    async fn stop_video_stream(&self) -> Result<()> {
        self.ledger().video_on = false;
        self.shared.events.push(SimEvent::VideoOff);
        Ok(())
    }
}
