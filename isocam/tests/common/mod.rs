#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use isocam::prelude::*;
use isocam_simulation::{SimDriver, SimEvent};

/// Format 0, Mode 1, 30fps: 320x240 YUV422
pub fn camera() -> CameraProfile {
    CameraProfile::new(
        "sim-cam-0",
        BusSpeed::S400,
        VideoSettings::fixed((0, 1, 4), 320, 240, PixelCoding::Yuv422, 320),
    )
}

pub fn config(buffers: usize) -> AcquisitionConfig {
    AcquisitionConfig::new()
        .buffer_count(buffers)
        .frame_timeout(Duration::from_millis(100))
        .drain_budget(Duration::from_secs(1))
}

pub fn session(driver: &SimDriver, buffers: usize) -> AcquisitionSession<SimDriver> {
    AcquisitionSession::with_allocator(
        driver.clone(),
        camera(),
        config(buffers),
        Arc::new(driver.allocator()),
    )
}

/// current 不在硬件队列中，其余 n-1 个 Buffer 都已 Attach (或已完成待取)
pub fn assert_ring_consistent(session: &AcquisitionSession<SimDriver>, driver: &SimDriver) {
    let ring = session.ring().expect("session should be streaming");
    let in_flight = ring.in_flight();

    assert!(
        !driver.is_attached(ring.current()),
        "current buffer {} is attached",
        ring.current()
    );
    assert!(!in_flight.contains(&ring.current()));
    assert_eq!(in_flight.len(), ring.len() - 1);
    for index in driver.attached() {
        assert!(in_flight.contains(&index), "buffer {index} attached outside the in-flight window");
    }
    assert_eq!(driver.double_attaches(), 0);
}

/// 所有 Driver 资源与帧内存都已归还
pub fn assert_nothing_leaked(driver: &SimDriver) {
    assert_eq!(driver.outstanding_resources(), 0, "resources leaked");
    assert_eq!(driver.open_streams(), 0, "stream handle leaked");
    assert_eq!(driver.outstanding_signals(), 0, "signals leaked");
    assert_eq!(driver.allocator().outstanding(), 0, "frame memory leaked");
    assert!(driver.attached().is_empty(), "buffers left on the hardware queue");
}

pub fn position(events: &[SimEvent], wanted: SimEvent) -> usize {
    events
        .iter()
        .position(|e| *e == wanted)
        .unwrap_or_else(|| panic!("{wanted:?} not found in {events:?}"))
}

pub fn count(events: &[SimEvent], pred: impl Fn(&SimEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}
