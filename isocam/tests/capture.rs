mod common;

use std::sync::{mpsc, Arc};
use std::time::Duration;

use isocam::prelude::*;
use isocam_simulation::{FaultPlan, SimDriver};

use common::{assert_nothing_leaked, camera, config};

fn producer_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap()
}

#[test]
fn blocking_capture_reads_copied_frames() {
    let rt = producer_runtime();
    let driver = SimDriver::new();
    let _producer = {
        let _guard = rt.enter();
        driver.spawn_producer(Duration::from_millis(5))
    };

    let mut cap = IsochCapture::open_with_allocator(
        driver.clone(),
        camera(),
        config(4).frame_timeout(Duration::from_millis(500)),
        Arc::new(driver.allocator()),
    )
    .unwrap();
    assert!(cap.is_opened());
    assert_eq!((cap.get_width(), cap.get_height()), (320, 240));

    let mut frame = CapturedFrame::default();
    assert!(frame.is_empty());
    let mut last_sequence = 0;
    for _ in 0..5 {
        assert!(cap.read(&mut frame).unwrap());
        assert_eq!(frame.data.len(), 320 * 240 * 2);
        assert_eq!(frame.coding, PixelCoding::Yuv422);
        assert_eq!(frame.fourcc().to_string(), "UYVY");
        assert!(frame.sequence > last_sequence);
        last_sequence = frame.sequence;
    }

    let stats = cap.stats().unwrap();
    assert_eq!(stats.frames_acquired, 5);

    cap.release().unwrap();
    assert!(!cap.is_opened());
    assert!(!cap.read(&mut frame).unwrap());
    assert_nothing_leaked(&driver);
}

#[test]
fn open_reports_start_failure() {
    let driver = SimDriver::with_faults(FaultPlan {
        fail_listen: true,
        ..Default::default()
    });

    let err = IsochCapture::open_with_allocator(
        driver.clone(),
        camera(),
        config(3),
        Arc::new(driver.allocator()),
    )
    .unwrap_err();
    assert!(err.to_string().contains("Failed to start image acquisition"));
    assert_nothing_leaked(&driver);
}

#[test]
fn several_captures_run_side_by_side() {
    const CAPTURES: usize = 3;

    let rt = producer_runtime();
    let drivers: Vec<SimDriver> = (0..CAPTURES).map(|_| SimDriver::new()).collect();
    let _producers: Vec<_> = {
        let _guard = rt.enter();
        drivers
            .iter()
            .map(|driver| driver.spawn_producer(Duration::from_millis(5)))
            .collect()
    };

    // 卡死时测试失败而不是一直挂起
    let (done_tx, done_rx) = mpsc::channel();
    let worker_drivers = drivers.clone();
    std::thread::spawn(move || {
        let mut caps: Vec<IsochCapture> = worker_drivers
            .iter()
            .map(|driver| {
                IsochCapture::open_with_allocator(
                    driver.clone(),
                    camera(),
                    config(3).frame_timeout(Duration::from_millis(500)),
                    Arc::new(driver.allocator()),
                )
                .unwrap()
            })
            .collect();

        let mut frame = CapturedFrame::default();
        for _ in 0..2 {
            for cap in caps.iter_mut() {
                assert!(cap.read(&mut frame).unwrap());
                assert_eq!(frame.data.len(), 320 * 240 * 2);
            }
        }
        for cap in caps.iter_mut() {
            cap.release().unwrap();
        }
        done_tx.send(()).unwrap();
    });

    done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("captures did not finish in time");
    for driver in &drivers {
        assert_nothing_leaked(driver);
    }
}
