//! 重试策略
//!
//! 指数退避：delay = min(base · 2ⁿ, max)，n 为本次失败前的重试计数。
//! 预算内的失败回到 PENDING 并推迟调度时间；预算耗尽转 FAILED 终态。

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use taskforge_domain::{
    entities::{Task, TaskStatus},
    errors::SchedulerResult,
    repositories::TaskRepository,
};

#[derive(Debug, Clone)]
pub struct RetryPolicyConfig {
    pub default_max_retries: i32,
    /// 退避基数（毫秒）
    pub base_delay_ms: u64,
    /// 退避上限（毫秒）
    pub max_delay_ms: u64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 300_000,
        }
    }
}

pub struct RetryPolicy {
    task_repo: Arc<dyn TaskRepository>,
    config: RetryPolicyConfig,
}

impl RetryPolicy {
    pub fn new(task_repo: Arc<dyn TaskRepository>, config: RetryPolicyConfig) -> Self {
        Self { task_repo, config }
    }

    pub fn default_max_retries(&self) -> i32 {
        self.config.default_max_retries
    }

    /// 第 n 次重试前的等待时长（毫秒）
    ///
    /// n 以 0 起始；负数按基数处理。
    pub fn calculate_retry_delay_ms(&self, retry_count: i32) -> u64 {
        if retry_count < 0 {
            return self.config.base_delay_ms;
        }
        // 2^n 溢出即视为超出上限
        let delay = if retry_count >= 63 {
            u64::MAX
        } else {
            self.config.base_delay_ms.saturating_mul(1u64 << retry_count)
        };
        delay.min(self.config.max_delay_ms)
    }

    /// 下次重试时刻；预算已耗尽时返回 None
    pub fn next_retry_time(&self, task: &Task) -> Option<DateTime<Utc>> {
        if !task.can_retry() {
            return None;
        }
        let delay = self.calculate_retry_delay_ms(task.retry_count);
        Some(Utc::now() + Duration::milliseconds(delay as i64))
    }

    /// 处理一次任务失败
    ///
    /// 返回 Ok(true) 表示任务已重新排期等待下次执行；
    /// Ok(false) 表示任务已被终结为 FAILED（或已处于终态 / 输掉并发竞争）。
    pub async fn handle_task_failure(&self, task: &Task) -> SchedulerResult<bool> {
        // 终态行不再驱动
        if task.is_terminal() {
            debug!("任务 {} 已处于终态 {}，跳过失败处理", task.id, task.status);
            return Ok(false);
        }

        info!(
            "处理任务 {} 的失败 (重试 {}/{})",
            task.id, task.retry_count, task.max_retries
        );

        if task.can_retry() {
            self.reschedule_for_retry(task).await
        } else {
            self.mark_permanently_failed(task).await?;
            Ok(false)
        }
    }

    async fn reschedule_for_retry(&self, task: &Task) -> SchedulerResult<bool> {
        let delay_ms = self.calculate_retry_delay_ms(task.retry_count);
        let now = Utc::now();
        let new_schedule_at = now + Duration::milliseconds(delay_ms as i64);

        let updated = self
            .task_repo
            .increment_retry_and_reschedule(task.id, new_schedule_at, now)
            .await?;

        if updated {
            info!(
                "任务 {} 第 {} 次重试已排期，{}ms 后执行",
                task.id,
                task.retry_count + 1,
                delay_ms
            );
            Ok(true)
        } else {
            warn!("任务 {} 重新排期失败，行可能已被并发修改", task.id);
            Ok(false)
        }
    }

    async fn mark_permanently_failed(&self, task: &Task) -> SchedulerResult<bool> {
        info!(
            "任务 {} 重试预算耗尽 ({})，标记为 FAILED",
            task.id, task.max_retries
        );

        let updated = self
            .task_repo
            .update_status(task.id, task.status, TaskStatus::Failed, Utc::now())
            .await?;

        if !updated {
            warn!("任务 {} 终结失败，行可能已被并发修改", task.id);
        }
        Ok(updated)
    }

    /// 安全网扫描：把 retry_count ≥ max_retries 的 PENDING 行终结为 FAILED
    ///
    /// 这类行是并发竞争的残留（两个失败报告同时到达时的瞬态），
    /// 按失联检测的节奏周期性调用。
    pub async fn process_tasks_exceeding_retry_limit(&self) -> SchedulerResult<u64> {
        let over_limit = self
            .task_repo
            .find_exceeding_retry_limit(TaskStatus::Pending)
            .await?;

        let mut finalised = 0u64;
        for task in over_limit {
            if self
                .task_repo
                .update_status(task.id, TaskStatus::Pending, TaskStatus::Failed, Utc::now())
                .await?
            {
                finalised += 1;
            }
        }

        if finalised > 0 {
            info!("安全网扫描终结了 {} 个超出重试预算的任务", finalised);
        }
        Ok(finalised)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use taskforge_infrastructure::DatabaseManager;

    fn policy_with(config: RetryPolicyConfig, repo: Arc<dyn TaskRepository>) -> RetryPolicy {
        RetryPolicy::new(repo, config)
    }

    async fn setup() -> DatabaseManager {
        DatabaseManager::connect("sqlite::memory:", 5, 1, StdDuration::from_secs(5))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn backoff_doubles_and_caps() {
        let db = setup().await;
        let policy = policy_with(RetryPolicyConfig::default(), db.task_repository());

        assert_eq!(policy.calculate_retry_delay_ms(0), 1000);
        assert_eq!(policy.calculate_retry_delay_ms(1), 2000);
        assert_eq!(policy.calculate_retry_delay_ms(2), 4000);
        assert_eq!(policy.calculate_retry_delay_ms(3), 8000);
        // 2^9 · 1000 = 512000 > 300000
        assert_eq!(policy.calculate_retry_delay_ms(9), 300_000);
        assert_eq!(policy.calculate_retry_delay_ms(40), 300_000);
        assert_eq!(policy.calculate_retry_delay_ms(100), 300_000);
        assert_eq!(policy.calculate_retry_delay_ms(-1), 1000);
    }

    #[tokio::test]
    async fn backoff_is_monotone_and_bounded() {
        let db = setup().await;
        let policy = policy_with(RetryPolicyConfig::default(), db.task_repository());

        let mut previous = 0u64;
        for n in 0..64 {
            let delay = policy.calculate_retry_delay_ms(n);
            assert!(delay >= previous);
            assert!(delay <= 300_000);
            previous = delay;
        }
    }

    #[tokio::test]
    async fn failure_within_budget_reschedules() {
        let db = setup().await;
        let repo = db.task_repository();
        let policy = policy_with(
            RetryPolicyConfig {
                base_delay_ms: 10,
                max_delay_ms: 100,
                ..Default::default()
            },
            Arc::clone(&repo),
        );

        let task = repo
            .create(&Task::new("dummy", "{}", Utc::now(), 2))
            .await
            .unwrap();
        let before = Utc::now();

        let rescheduled = policy.handle_task_failure(&task).await.unwrap();
        assert!(rescheduled);

        let row = repo.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Pending);
        assert_eq!(row.retry_count, 1);
        assert!(row.worker_id.is_none());
        // 首次重试延迟 10ms
        assert!(row.schedule_at >= before + Duration::milliseconds(10));
    }

    #[tokio::test]
    async fn exhausted_budget_marks_failed() {
        let db = setup().await;
        let repo = db.task_repository();
        let policy = policy_with(RetryPolicyConfig::default(), Arc::clone(&repo));

        let task = repo
            .create(&Task::new("dummy", "{}", Utc::now(), 1))
            .await
            .unwrap();

        assert!(policy.handle_task_failure(&task).await.unwrap());
        let after_first = repo.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(after_first.retry_count, 1);

        // 预算（1 次）已用完
        let rescheduled = policy.handle_task_failure(&after_first).await.unwrap();
        assert!(!rescheduled);
        let finalised = repo.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(finalised.status, TaskStatus::Failed);

        // 对 FAILED 行重复驱动是空操作
        let version_before = finalised.version;
        assert!(!policy.handle_task_failure(&finalised).await.unwrap());
        let untouched = repo.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(untouched.version, version_before);
    }

    #[tokio::test]
    async fn sweep_finalises_pending_rows_over_budget() {
        let db = setup().await;
        let repo = db.task_repository();
        let policy = policy_with(RetryPolicyConfig::default(), Arc::clone(&repo));
        let now = Utc::now();

        // retry_count(1) ≥ max_retries(1) 的 PENDING 行：竞争残留
        let leaked = repo
            .create(&Task::new("dummy", "{}", now, 1))
            .await
            .unwrap();
        repo.increment_retry_and_reschedule(leaked.id, now, now)
            .await
            .unwrap();

        let healthy = repo
            .create(&Task::new("dummy", "{}", now, 3))
            .await
            .unwrap();

        assert_eq!(policy.process_tasks_exceeding_retry_limit().await.unwrap(), 1);

        let finalised = repo.get_by_id(leaked.id).await.unwrap().unwrap();
        assert_eq!(finalised.status, TaskStatus::Failed);
        let untouched = repo.get_by_id(healthy.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, TaskStatus::Pending);

        // 幂等
        assert_eq!(policy.process_tasks_exceeding_retry_limit().await.unwrap(), 0);
    }
}
