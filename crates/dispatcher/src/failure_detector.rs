//! Worker 失联检测
//!
//! 周期性扫描心跳表，把失联 Worker 名下的 RUNNING 任务重置回就绪池。
//! 检测到失联时不立即删除心跳行（给监控工具留观察窗口），
//! 由 24 小时阈值的清理兜底控制表大小。

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use taskforge_domain::{
    entities::TaskStatus,
    errors::SchedulerResult,
    repositories::{TaskRepository, WorkerRepository},
};

use crate::retry_policy::RetryPolicy;

#[derive(Debug, Clone)]
pub struct FailureDetectorConfig {
    /// 心跳超时（毫秒），超过即判定失联
    pub heartbeat_timeout_ms: u64,
    /// 心跳行保留时长（小时），过期行被清理
    pub heartbeat_retention_hours: i64,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 60_000,
            heartbeat_retention_hours: 24,
        }
    }
}

/// 单次检测周期的结果汇总
#[derive(Debug, Clone, Default)]
pub struct FailureScanReport {
    pub stale_workers: usize,
    pub reassigned_tasks: u64,
    pub cleaned_heartbeats: u64,
    pub finalised_tasks: u64,
}

pub struct FailureDetector {
    task_repo: Arc<dyn TaskRepository>,
    worker_repo: Arc<dyn WorkerRepository>,
    retry_policy: Arc<RetryPolicy>,
    config: FailureDetectorConfig,
}

impl FailureDetector {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        worker_repo: Arc<dyn WorkerRepository>,
        retry_policy: Arc<RetryPolicy>,
        config: FailureDetectorConfig,
    ) -> Self {
        Self {
            task_repo,
            worker_repo,
            retry_policy,
            config,
        }
    }

    /// 单次检测周期
    pub async fn detect_and_handle(&self) -> SchedulerResult<FailureScanReport> {
        let now = Utc::now();
        let cutoff = now - Duration::milliseconds(self.config.heartbeat_timeout_ms as i64);

        let stale = self.worker_repo.find_stale(cutoff).await?;
        let mut report = FailureScanReport {
            stale_workers: stale.len(),
            ..Default::default()
        };

        if stale.is_empty() {
            debug!("未检测到失联Worker");
        }

        for worker in &stale {
            warn!(
                "检测到失联Worker: {} (上次心跳: {}, 距今 {}s)",
                worker.worker_id,
                worker.last_heartbeat.format("%Y-%m-%d %H:%M:%S UTC"),
                worker.seconds_since_heartbeat(now)
            );

            // 单个 Worker 的重置失败不阻塞其余处理
            match self
                .task_repo
                .reset_abandoned(&worker.worker_id, TaskStatus::Running, TaskStatus::Pending, now)
                .await
            {
                Ok(0) => {
                    info!("失联Worker {} 名下没有需要重置的任务", worker.worker_id);
                }
                Ok(count) => {
                    warn!(
                        "已把失联Worker {} 的 {} 个任务重置回就绪池",
                        worker.worker_id, count
                    );
                    report.reassigned_tasks += count;
                }
                Err(e) => {
                    error!("重置失联Worker {} 的任务时出错: {}", worker.worker_id, e);
                }
            }
        }

        // 清理长期失联的心跳行，限制表大小
        let retention_cutoff = now - Duration::hours(self.config.heartbeat_retention_hours);
        report.cleaned_heartbeats = self.worker_repo.cleanup_stale(retention_cutoff).await?;

        // 重试安全网与失联检测同节奏运行
        report.finalised_tasks = self.retry_policy.process_tasks_exceeding_retry_limit().await?;

        Ok(report)
    }

    /// 检测循环：按 detection_interval_ms 周期运行
    pub async fn run(
        self: Arc<Self>,
        detection_interval_ms: u64,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("失联检测循环启动，周期 {}ms", detection_interval_ms);
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_millis(detection_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("失联检测循环收到停止信号");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.detect_and_handle().await {
                        warn!("失联检测周期出错: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry_policy::RetryPolicyConfig;
    use std::time::Duration as StdDuration;
    use taskforge_domain::entities::Task;
    use taskforge_infrastructure::DatabaseManager;

    async fn setup() -> (DatabaseManager, FailureDetector) {
        let db = DatabaseManager::connect("sqlite::memory:", 5, 1, StdDuration::from_secs(5))
            .await
            .unwrap();
        let retry_policy = Arc::new(RetryPolicy::new(
            db.task_repository(),
            RetryPolicyConfig::default(),
        ));
        let detector = FailureDetector::new(
            db.task_repository(),
            db.worker_repository(),
            retry_policy,
            FailureDetectorConfig::default(),
        );
        (db, detector)
    }

    #[tokio::test]
    async fn stale_worker_tasks_return_to_ready_pool() {
        let (db, detector) = setup().await;
        let tasks = db.task_repository();
        let workers = db.worker_repository();
        let now = Utc::now();

        // 心跳停在 120 秒前，超过 60 秒超时
        workers
            .upsert("host-dead", now - Duration::seconds(120), None)
            .await
            .unwrap();

        let task = tasks
            .create(&Task::new("dummy", "{}", now, 3))
            .await
            .unwrap();
        tasks
            .claim(task.id, TaskStatus::Pending, TaskStatus::Running, "host-dead", now)
            .await
            .unwrap();

        let report = detector.detect_and_handle().await.unwrap();
        assert_eq!(report.stale_workers, 1);
        assert_eq!(report.reassigned_tasks, 1);

        let row = tasks.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Pending);
        assert!(row.worker_id.is_none());
        assert!(row.assigned_at.is_none());

        // 检测不删除心跳行本身（留给 24 小时清理）
        assert!(workers.get("host-dead").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn detection_is_idempotent() {
        let (db, detector) = setup().await;
        let tasks = db.task_repository();
        let workers = db.worker_repository();
        let now = Utc::now();

        workers
            .upsert("host-dead", now - Duration::seconds(120), None)
            .await
            .unwrap();
        let task = tasks
            .create(&Task::new("dummy", "{}", now, 3))
            .await
            .unwrap();
        tasks
            .claim(task.id, TaskStatus::Pending, TaskStatus::Running, "host-dead", now)
            .await
            .unwrap();

        let first = detector.detect_and_handle().await.unwrap();
        assert_eq!(first.reassigned_tasks, 1);

        // 第二轮无事可做
        let second = detector.detect_and_handle().await.unwrap();
        assert_eq!(second.reassigned_tasks, 0);
    }

    #[tokio::test]
    async fn healthy_workers_are_untouched() {
        let (db, detector) = setup().await;
        let tasks = db.task_repository();
        let workers = db.worker_repository();
        let now = Utc::now();

        workers.upsert("host-live", now, None).await.unwrap();
        let task = tasks
            .create(&Task::new("dummy", "{}", now, 3))
            .await
            .unwrap();
        tasks
            .claim(task.id, TaskStatus::Pending, TaskStatus::Running, "host-live", now)
            .await
            .unwrap();

        let report = detector.detect_and_handle().await.unwrap();
        assert_eq!(report.stale_workers, 0);
        assert_eq!(report.reassigned_tasks, 0);

        let row = tasks.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Running);
        assert_eq!(row.worker_id.as_deref(), Some("host-live"));
    }

    #[tokio::test]
    async fn ancient_heartbeats_are_cleaned_up() {
        let (db, detector) = setup().await;
        let workers = db.worker_repository();
        let now = Utc::now();

        workers
            .upsert("host-ancient", now - Duration::hours(48), None)
            .await
            .unwrap();
        workers
            .upsert("host-recent-dead", now - Duration::seconds(120), None)
            .await
            .unwrap();

        let report = detector.detect_and_handle().await.unwrap();
        // 两个都失联，但只有超过保留时长的被删除
        assert_eq!(report.stale_workers, 2);
        assert_eq!(report.cleaned_heartbeats, 1);
        assert!(workers.get("host-ancient").await.unwrap().is_none());
        assert!(workers.get("host-recent-dead").await.unwrap().is_some());
    }
}
