//! 优雅关闭
//!
//! 关闭信号通过广播通道扇出到所有后台循环；各循环在 tick 之间检查信号退出。
//! 在途的执行器调用不被取消，由下次启动的恢复流程重新排队。

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct ShutdownManager {
    tx: broadcast::Sender<()>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// 广播关闭信号
    pub fn shutdown(&self) {
        info!("广播关闭信号");
        // 没有订阅者时发送失败，无需处理
        let _ = self.tx.send(());
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 限时等待所有后台任务退出，超时后放弃（任务随进程终止）
pub async fn drain_with_timeout(handles: Vec<JoinHandle<()>>, timeout_secs: u64) {
    let drain = async {
        for handle in handles {
            let _ = handle.await;
        }
    };

    match tokio::time::timeout(std::time::Duration::from_secs(timeout_secs), drain).await {
        Ok(()) => info!("所有后台循环已退出"),
        Err(_) => warn!("后台循环在 {}s 内未全部退出，强制终止", timeout_secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_reaches_all_subscribers() {
        let manager = ShutdownManager::new();
        let mut rx1 = manager.subscribe();
        let mut rx2 = manager.subscribe();

        manager.shutdown();

        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }

    #[tokio::test]
    async fn drain_returns_when_tasks_finish() {
        let handle = tokio::spawn(async {});
        drain_with_timeout(vec![handle], 1).await;
    }

    #[tokio::test]
    async fn drain_gives_up_on_stuck_tasks() {
        let handle = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(600)).await;
        });
        // 不会悬挂
        drain_with_timeout(vec![handle], 1).await;
    }
}
