//! 调度循环
//!
//! 周期性扫描到期任务并原子认领给活跃 Worker。
//! 认领落空（另一个调度器抢先）是正常分支；到期集合每个周期重读，
//! 漏掉的任务下个周期自然重试。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use taskforge_domain::{
    entities::TaskStatus,
    errors::SchedulerResult,
    repositories::{TaskRepository, WorkerRepository},
};

pub struct TaskScheduler {
    task_repo: Arc<dyn TaskRepository>,
    worker_repo: Arc<dyn WorkerRepository>,
    /// 判定 Worker 活跃的心跳时限
    heartbeat_timeout: Duration,
    /// 活跃 Worker 的轮转游标
    next_worker: AtomicUsize,
}

impl TaskScheduler {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        worker_repo: Arc<dyn WorkerRepository>,
        heartbeat_timeout_ms: u64,
    ) -> Self {
        Self {
            task_repo,
            worker_repo,
            heartbeat_timeout: Duration::milliseconds(heartbeat_timeout_ms as i64),
            next_worker: AtomicUsize::new(0),
        }
    }

    /// 单次调度 tick：返回本周期成功认领的任务数
    pub async fn poll_and_assign(&self) -> SchedulerResult<usize> {
        let now = Utc::now();
        let due = self.task_repo.find_due(now).await?;
        if due.is_empty() {
            return Ok(0);
        }

        let active = self
            .worker_repo
            .find_active(now - self.heartbeat_timeout)
            .await?;
        if active.is_empty() {
            // 没有活跃 Worker 时任务保持 PENDING，等待下个周期
            debug!("{} 个到期任务等待中，当前无活跃Worker", due.len());
            return Ok(0);
        }

        debug!("发现 {} 个到期任务，{} 个活跃Worker", due.len(), active.len());

        let mut claimed = 0usize;
        for task in due {
            let cursor = self.next_worker.fetch_add(1, Ordering::Relaxed);
            let worker_id = active[cursor % active.len()].worker_id.clone();

            match self
                .task_repo
                .claim(task.id, TaskStatus::Pending, TaskStatus::Running, &worker_id, now)
                .await
            {
                Ok(true) => {
                    info!(
                        "任务 {} (类型 {}) 已认领给Worker {}",
                        task.id, task.task_type, worker_id
                    );
                    claimed += 1;
                }
                Ok(false) => {
                    // 另一个调度器赢得该行，无需回滚
                    debug!("任务 {} 已被其他调度器认领", task.id);
                }
                Err(e) => {
                    error!("认领任务 {} 时出错: {}", task.id, e);
                }
            }
        }

        Ok(claimed)
    }

    /// 调度循环：按 polling_interval_ms 周期运行，收到停止信号后退出
    pub async fn run(self: Arc<Self>, polling_interval_ms: u64, mut shutdown: broadcast::Receiver<()>) {
        info!("调度循环启动，周期 {}ms", polling_interval_ms);
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_millis(polling_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("调度循环收到停止信号");
                    break;
                }
                _ = ticker.tick() => {
                    // 单个周期的失败不终止循环
                    if let Err(e) = self.poll_and_assign().await {
                        warn!("调度周期出错: {}", e);
                    }
                }
            }
        }
    }
}
