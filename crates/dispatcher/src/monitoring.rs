//! 监控视图
//!
//! 只读聚合：状态计数、Worker 存活、执行指标窗口、运行时长和整体健康判定。
//! 所有数据即时从存储读取，进程内只保留启动时刻。

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{error, warn};

use taskforge_domain::{
    entities::TaskStatus,
    errors::SchedulerResult,
    repositories::{TaskAttemptRepository, TaskRepository, WorkerRepository},
};

/// 超过该时长仍未完成的执行记录视为疑似卡死
const STUCK_THRESHOLD_MINUTES: i64 = 10;
/// 疑似卡死数量超过该值时系统降级
const DEGRADED_STUCK_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    #[serde(rename = "UP")]
    Up,
    #[serde(rename = "DEGRADED")]
    Degraded,
    #[serde(rename = "DOWN")]
    Down,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Up => "UP",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Down => "DOWN",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusCounts {
    pub pending: i64,
    pub running: i64,
    pub success: i64,
    pub failed: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatusReport {
    pub worker_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub active: bool,
    pub seconds_since_heartbeat: i64,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ExecutionMetrics {
    pub total_executions: i64,
    pub successful_executions: i64,
    pub failed_executions: i64,
    pub success_rate_percent: f64,
    pub average_execution_time_ms: i64,
    pub currently_running: usize,
    pub potentially_stuck: usize,
    pub period_hours: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

pub struct MonitoringService {
    task_repo: Arc<dyn TaskRepository>,
    attempt_repo: Arc<dyn TaskAttemptRepository>,
    worker_repo: Arc<dyn WorkerRepository>,
    heartbeat_timeout: Duration,
    started_at: DateTime<Utc>,
}

impl MonitoringService {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        attempt_repo: Arc<dyn TaskAttemptRepository>,
        worker_repo: Arc<dyn WorkerRepository>,
        heartbeat_timeout_ms: u64,
    ) -> Self {
        Self {
            task_repo,
            attempt_repo,
            worker_repo,
            heartbeat_timeout: Duration::milliseconds(heartbeat_timeout_ms as i64),
            started_at: Utc::now(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }

    pub async fn status_counts(&self) -> SchedulerResult<TaskStatusCounts> {
        Ok(TaskStatusCounts {
            pending: self.task_repo.count_by_status(TaskStatus::Pending).await?,
            running: self.task_repo.count_by_status(TaskStatus::Running).await?,
            success: self.task_repo.count_by_status(TaskStatus::Success).await?,
            failed: self.task_repo.count_by_status(TaskStatus::Failed).await?,
            total: self.task_repo.count_all().await?,
        })
    }

    pub async fn active_worker_count(&self) -> SchedulerResult<i64> {
        let cutoff = Utc::now() - self.heartbeat_timeout;
        self.worker_repo.count_active(cutoff).await
    }

    pub async fn worker_statuses(&self) -> SchedulerResult<Vec<WorkerStatusReport>> {
        let now = Utc::now();
        let cutoff = now - self.heartbeat_timeout;
        let workers = self.worker_repo.find_all().await?;

        Ok(workers
            .into_iter()
            .map(|w| WorkerStatusReport {
                active: w.last_heartbeat >= cutoff,
                seconds_since_heartbeat: w.seconds_since_heartbeat(now),
                worker_id: w.worker_id,
                last_heartbeat: w.last_heartbeat,
                registered_at: w.registered_at,
                metadata: w.metadata,
            })
            .collect())
    }

    /// 最近 N 小时的执行指标
    pub async fn execution_metrics(&self, hours: i64) -> SchedulerResult<ExecutionMetrics> {
        let end = Utc::now();
        let start = end - Duration::hours(hours);

        let total = self.attempt_repo.count_in_window(start, end).await?;
        let successful = self
            .attempt_repo
            .count_successful_in_window(start, end)
            .await?;
        let failed = self.attempt_repo.count_failed_in_window(start, end).await?;

        let success_rate = if total > 0 {
            ((successful as f64 / total as f64) * 100.0 * 100.0).round() / 100.0
        } else {
            0.0
        };

        let average_ms = self
            .attempt_repo
            .average_duration_ms_in_window(start, end)
            .await?
            .map(|avg| avg.round() as i64)
            .unwrap_or(0);

        let currently_running = self.attempt_repo.find_running().await?.len();
        let stuck_cutoff = end - Duration::minutes(STUCK_THRESHOLD_MINUTES);
        let potentially_stuck = self.attempt_repo.find_stuck(stuck_cutoff).await?.len();

        Ok(ExecutionMetrics {
            total_executions: total,
            successful_executions: successful,
            failed_executions: failed,
            success_rate_percent: success_rate,
            average_execution_time_ms: average_ms,
            currently_running,
            potentially_stuck,
            period_hours: hours,
            period_start: start,
            period_end: end,
        })
    }

    /// 整体健康判定
    ///
    /// DEGRADED：有积压任务却没有活跃 Worker，或疑似卡死的执行过多；
    /// DOWN：存储不可达。
    pub async fn health_status(&self) -> HealthStatus {
        let verdict = async {
            let active_workers = self.active_worker_count().await?;
            let pending = self.task_repo.count_by_status(TaskStatus::Pending).await?;

            if pending > 0 && active_workers == 0 {
                warn!(
                    "系统降级：{} 个待执行任务但没有活跃Worker",
                    pending
                );
                return Ok::<_, taskforge_domain::SchedulerError>(HealthStatus::Degraded);
            }

            let stuck_cutoff = Utc::now() - Duration::minutes(STUCK_THRESHOLD_MINUTES);
            let stuck = self.attempt_repo.find_stuck(stuck_cutoff).await?.len();
            if stuck > DEGRADED_STUCK_LIMIT {
                warn!("系统降级：{} 条疑似卡死的执行记录", stuck);
                return Ok(HealthStatus::Degraded);
            }

            Ok(HealthStatus::Up)
        }
        .await;

        match verdict {
            Ok(status) => status,
            Err(e) => {
                error!("健康检查失败: {}", e);
                HealthStatus::Down
            }
        }
    }

    /// 就绪探针：存储可达即就绪
    pub async fn is_ready(&self) -> bool {
        self.task_repo.count_all().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use taskforge_domain::entities::Task;
    use taskforge_infrastructure::DatabaseManager;

    async fn setup() -> (DatabaseManager, MonitoringService) {
        let db = DatabaseManager::connect("sqlite::memory:", 5, 1, StdDuration::from_secs(5))
            .await
            .unwrap();
        let monitoring = MonitoringService::new(
            db.task_repository(),
            db.attempt_repository(),
            db.worker_repository(),
            60_000,
        );
        (db, monitoring)
    }

    #[tokio::test]
    async fn empty_system_is_up() {
        let (_db, monitoring) = setup().await;
        assert_eq!(monitoring.health_status().await, HealthStatus::Up);
        assert!(monitoring.is_ready().await);
        assert!(monitoring.uptime_seconds() >= 0);
    }

    #[tokio::test]
    async fn pending_without_workers_degrades() {
        let (db, monitoring) = setup().await;
        let tasks = db.task_repository();

        tasks
            .create(&Task::new("dummy", "{}", Utc::now(), 3))
            .await
            .unwrap();
        assert_eq!(monitoring.health_status().await, HealthStatus::Degraded);

        // 注册一个活跃 Worker 后恢复
        db.worker_repository()
            .upsert("host-w1", Utc::now(), None)
            .await
            .unwrap();
        assert_eq!(monitoring.health_status().await, HealthStatus::Up);
    }

    #[tokio::test]
    async fn status_counts_cover_all_statuses() {
        let (db, monitoring) = setup().await;
        let tasks = db.task_repository();
        let now = Utc::now();

        tasks.create(&Task::new("dummy", "{}", now, 3)).await.unwrap();
        let done = tasks.create(&Task::new("dummy", "{}", now, 3)).await.unwrap();
        tasks
            .claim(done.id, TaskStatus::Pending, TaskStatus::Running, "w", now)
            .await
            .unwrap();
        tasks
            .complete(done.id, TaskStatus::Success, now, None, None, now)
            .await
            .unwrap();

        let counts = monitoring.status_counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.running, 0);
        assert_eq!(counts.success, 1);
        assert_eq!(counts.failed, 0);
        assert_eq!(counts.total, 2);
    }

    #[tokio::test]
    async fn execution_metrics_aggregate_window() {
        let (db, monitoring) = setup().await;
        let tasks = db.task_repository();
        let attempts = db.attempt_repository();
        let now = Utc::now();

        let task = tasks.create(&Task::new("dummy", "{}", now, 3)).await.unwrap();

        let ok = attempts.start(task.id, "w").await.unwrap();
        attempts
            .finish(ok.id, true, Some("done"), None, None, now)
            .await
            .unwrap();
        let bad = attempts.start(task.id, "w").await.unwrap();
        attempts
            .finish(bad.id, false, None, Some("boom"), None, now)
            .await
            .unwrap();
        // 第三条仍在执行
        attempts.start(task.id, "w").await.unwrap();

        let metrics = monitoring.execution_metrics(1).await.unwrap();
        assert_eq!(metrics.total_executions, 3);
        assert_eq!(metrics.successful_executions, 1);
        assert_eq!(metrics.failed_executions, 1);
        assert!((metrics.success_rate_percent - 33.33).abs() < 0.01);
        assert_eq!(metrics.currently_running, 1);
        assert_eq!(metrics.potentially_stuck, 0);
        assert_eq!(metrics.period_hours, 1);
    }

    #[tokio::test]
    async fn worker_statuses_flag_activity() {
        let (db, monitoring) = setup().await;
        let workers = db.worker_repository();
        let now = Utc::now();

        workers.upsert("host-live", now, None).await.unwrap();
        workers
            .upsert("host-dead", now - Duration::seconds(300), None)
            .await
            .unwrap();

        let statuses = monitoring.worker_statuses().await.unwrap();
        assert_eq!(statuses.len(), 2);

        let live = statuses.iter().find(|w| w.worker_id == "host-live").unwrap();
        assert!(live.active);
        let dead = statuses.iter().find(|w| w.worker_id == "host-dead").unwrap();
        assert!(!dead.active);
        assert!(dead.seconds_since_heartbeat >= 300);
    }
}
