use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use isocam_core::error::{CameraError, Result};
use isocam_core::traits::Completion;

/// 仿真的完成信号 (对应一个 manual-reset event)
///
/// 克隆共享同一个状态，既可被 Driver 触发，也可交给外部事件循环等待。
#[derive(Debug, Clone)]
pub struct SimSignal {
    index: usize,
    state: Arc<watch::Sender<Completion>>,
}

impl SimSignal {
    pub(crate) fn new(index: usize) -> Self {
        let (tx, _rx) = watch::channel(Completion::Pending);
        Self {
            index,
            state: Arc::new(tx),
        }
    }

    /// 所属 Buffer 的序号
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> Completion {
        *self.state.borrow()
    }

    pub(crate) fn set(&self, completion: Completion) {
        self.state.send_replace(completion);
    }

    /// 等待信号离开 Pending，最多 `timeout`；到期仍未完成则返回 Pending
    pub async fn wait(&self, timeout: Duration) -> Result<Completion> {
        let mut rx = self.state.subscribe();
        let waited = tokio::time::timeout(timeout, async move {
            rx.wait_for(|c| *c != Completion::Pending)
                .await
                .map(|c| *c)
        })
        .await;

        match waited {
            Ok(Ok(completion)) => Ok(completion),
            Ok(Err(_)) => Err(CameraError::Disconnected(format!(
                "completion source for buffer {} dropped",
                self.index
            ))),
            Err(_elapsed) => Ok(Completion::Pending),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn wait_expires_as_pending() {
        let sig = SimSignal::new(0);
        let got = sig.wait(Duration::from_millis(50)).await.unwrap();
        assert_eq!(got, Completion::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sees_completion_from_another_task() {
        let sig = SimSignal::new(1);
        let producer = sig.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            producer.set(Completion::Ready);
        });
        let got = sig.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, Completion::Ready);
    }

    #[tokio::test]
    async fn already_signalled_returns_immediately() {
        let sig = SimSignal::new(2);
        sig.set(Completion::TimedOut);
        let got = sig.wait(Duration::from_millis(1)).await.unwrap();
        assert_eq!(got, Completion::TimedOut);
    }
}
