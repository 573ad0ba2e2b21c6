use std::sync::OnceLock;

use anyhow::{Context, Result};
use tokio::runtime::Runtime;

// 全局单例 Runtime
static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// 获取全局 Runtime，如果不存在则创建
/// 这允许用户不写 #[tokio::main] 也能使用阻塞式的 IsochCapture
pub fn get_runtime() -> Result<&'static Runtime> {
    if let Some(runtime) = RUNTIME.get() {
        return Ok(runtime);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        // Worker 各自在独立线程上 block_on，这里只跑定时器和 Driver 派生的任务
        .worker_threads(2)
        .thread_name("isocam-bg-worker")
        .build()
        .context("Failed to create isocam background runtime")?;

    // 并发初始化时多建的那个直接丢弃
    Ok(RUNTIME.get_or_init(|| runtime))
}
