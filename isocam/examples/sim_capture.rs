// isocam/examples/sim_capture.rs

use std::time::{Duration, Instant};

use anyhow::Result;
use isocam::prelude::*;
use isocam_simulation::SimDriver;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    // 1. 仿真的相机：Format 0 / Mode 3 / 30fps，640x480 YUV422
    let camera = CameraProfile::new(
        "sim-cam-0",
        BusSpeed::S400,
        VideoSettings::fixed((0, 3, 4), 640, 480, PixelCoding::Yuv422, 640),
    );

    // 2. 硬件侧：每 33ms 写完一帧
    let hw = tokio::runtime::Runtime::new()?;
    let driver = SimDriver::new();
    let _producer = {
        let _guard = hw.enter();
        driver.spawn_producer(Duration::from_millis(33))
    };

    // 3. 打开采集 (后台自动启动 Runtime 和 Worker)
    let config = AcquisitionConfig::new()
        .buffer_count(6)
        .frame_timeout(Duration::from_millis(500))
        .drop_stale_frames(true);
    let mut cap = IsochCapture::open(driver.clone(), camera, config)?;
    println!(
        "Capturing {}x{} from simulated camera...",
        cap.get_width(),
        cap.get_height()
    );

    let mut frame = CapturedFrame::default();
    let started = Instant::now();
    let mut frames = 0;

    while frames < 60 && cap.read(&mut frame)? {
        frames += 1;

        // 模拟一个偶尔很慢的消费者，让 drop-stale 生效
        if frames % 15 == 0 {
            std::thread::sleep(Duration::from_millis(150));
        }

        if frame.dropped > 0 || frame.timed_out {
            println!(
                "frame #{:<4} buffer {} dropped {} timed_out {}",
                frame.sequence, frame.index, frame.dropped, frame.timed_out
            );
        }
    }

    let stats = cap.stats()?;
    let elapsed = started.elapsed().as_secs_f64();
    println!(
        "{} frames in {:.2}s ({:.1} fps), {} dropped, health {:?}",
        stats.frames_acquired,
        elapsed,
        stats.frames_acquired as f64 / elapsed,
        stats.frames_dropped,
        stats.assess_health()
    );

    cap.release()?;
    Ok(())
}
