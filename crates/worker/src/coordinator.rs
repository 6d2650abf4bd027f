//! 执行协调器
//!
//! 驱动一个已认领的任务走完单次执行：先落执行记录，再分发到执行器，
//! 最后提交任务终态或把控制权交还调用方走重试路径。
//! 执行器调用期间不持有任何数据库事务。

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use taskforge_domain::{
    entities::{Task, TaskStatus},
    errors::SchedulerResult,
    repositories::{TaskAttemptRepository, TaskRepository},
};

use crate::registry::ExecutorRegistry;

/// 单次执行的结局
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// 任务已提交为 SUCCESS
    Succeeded,
    /// 执行失败，任务保持 RUNNING，由调用方交给重试策略
    RetryableFailure(String),
    /// 任务已直接提交为 FAILED（无执行器或不可恢复错误），不走重试
    FatalFailure(String),
}

pub struct ExecutionCoordinator {
    registry: Arc<ExecutorRegistry>,
    task_repo: Arc<dyn TaskRepository>,
    attempt_repo: Arc<dyn TaskAttemptRepository>,
}

impl ExecutionCoordinator {
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        task_repo: Arc<dyn TaskRepository>,
        attempt_repo: Arc<dyn TaskAttemptRepository>,
    ) -> Self {
        Self {
            registry,
            task_repo,
            attempt_repo,
        }
    }

    /// 执行一个已认领给 `worker_id` 的任务
    pub async fn execute_task(
        &self,
        task: &Task,
        worker_id: &str,
    ) -> SchedulerResult<ExecutionOutcome> {
        info!("开始执行任务 {} (Worker {})", task.id, worker_id);

        let attempt = self.attempt_repo.start(task.id, worker_id).await?;

        let executor = match self.registry.find_for(&task.task_type) {
            Some(executor) => executor,
            None => {
                let message = format!("no executor for type {}", task.task_type);
                error!("任务 {} 没有匹配的执行器: {}", task.id, task.task_type);

                let now = Utc::now();
                self.attempt_repo
                    .finish(attempt.id, false, None, Some(&message), None, now)
                    .await?;
                self.task_repo
                    .complete(task.id, TaskStatus::Failed, now, Some(&message), None, now)
                    .await?;
                return Ok(ExecutionOutcome::FatalFailure(message));
            }
        };

        match executor.execute(task).await {
            Ok(result) if result.success => {
                let now = Utc::now();
                let metadata = result.metadata_json();
                self.attempt_repo
                    .finish(
                        attempt.id,
                        true,
                        result.output.as_deref(),
                        None,
                        metadata.as_deref(),
                        now,
                    )
                    .await?;
                self.task_repo
                    .complete(
                        task.id,
                        TaskStatus::Success,
                        now,
                        result.output.as_deref(),
                        metadata.as_deref(),
                        now,
                    )
                    .await?;

                info!("任务 {} 执行成功", task.id);
                Ok(ExecutionOutcome::Succeeded)
            }
            Ok(result) => {
                // 失败必须带错误消息，缺失时兜底
                let message = result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "execution failed".to_string());
                let now = Utc::now();
                self.attempt_repo
                    .finish(
                        attempt.id,
                        false,
                        result.output.as_deref(),
                        Some(&message),
                        result.metadata_json().as_deref(),
                        now,
                    )
                    .await?;

                // 任务状态留给重试策略决定
                warn!("任务 {} 执行失败: {}", task.id, message);
                Ok(ExecutionOutcome::RetryableFailure(message))
            }
            Err(e) if e.is_unrecoverable() => {
                let message = e.to_string();
                error!("任务 {} 执行器拒绝任务: {}", task.id, message);

                let now = Utc::now();
                self.attempt_repo
                    .finish(attempt.id, false, None, Some(&message), None, now)
                    .await?;
                self.task_repo
                    .complete(task.id, TaskStatus::Failed, now, Some(&message), None, now)
                    .await?;
                Ok(ExecutionOutcome::FatalFailure(message))
            }
            Err(e) => {
                // 未预期的故障按可恢复失败处理（安全默认：重试）
                let message = format!("unexpected error: {e}");
                error!("任务 {} 执行出现未预期错误: {}", task.id, e);

                self.attempt_repo
                    .finish(attempt.id, false, None, Some(&message), None, Utc::now())
                    .await?;
                Ok(ExecutionOutcome::RetryableFailure(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::{DummyExecutor, TaskExecutor};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration as StdDuration;
    use taskforge_domain::entities::ExecutionResult;
    use taskforge_domain::SchedulerError;
    use taskforge_infrastructure::DatabaseManager;

    /// 按脚本依次返回预设结果的执行器
    struct ScriptedExecutor {
        results: Mutex<Vec<SchedulerResult<ExecutionResult>>>,
    }

    impl ScriptedExecutor {
        fn new(mut results: Vec<SchedulerResult<ExecutionResult>>) -> Self {
            results.reverse();
            Self {
                results: Mutex::new(results),
            }
        }
    }

    #[async_trait]
    impl TaskExecutor for ScriptedExecutor {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute(&self, _task: &Task) -> SchedulerResult<ExecutionResult> {
            self.results
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(ExecutionResult::failure("script exhausted")))
        }
    }

    async fn setup(
        executor: Option<Arc<dyn TaskExecutor>>,
    ) -> (DatabaseManager, ExecutionCoordinator) {
        let db = DatabaseManager::connect("sqlite::memory:", 5, 1, StdDuration::from_secs(5))
            .await
            .unwrap();
        let mut registry = ExecutorRegistry::new();
        if let Some(executor) = executor {
            registry.register(executor);
        }
        let coordinator = ExecutionCoordinator::new(
            Arc::new(registry),
            db.task_repository(),
            db.attempt_repository(),
        );
        (db, coordinator)
    }

    async fn claimed_task(db: &DatabaseManager, task_type: &str, payload: &str) -> Task {
        let tasks = db.task_repository();
        let now = Utc::now();
        let task = tasks
            .create(&Task::new(task_type, payload, now, 3))
            .await
            .unwrap();
        tasks
            .claim(task.id, TaskStatus::Pending, TaskStatus::Running, "w-test", now)
            .await
            .unwrap();
        tasks.get_by_id(task.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn success_commits_terminal_state_and_attempt() {
        let (db, coordinator) = setup(Some(Arc::new(DummyExecutor))).await;
        let task = claimed_task(&db, "dummy", r#"{"sleepDurationMs":5,"logMessage":"ok"}"#).await;

        let outcome = coordinator.execute_task(&task, "w-test").await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Succeeded);

        let row = db.task_repository().get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Success);
        assert!(row.completed_at.is_some());
        assert!(row.execution_output.as_deref().unwrap().contains("ok"));
        assert!(row.execution_metadata.is_some());

        let attempts = db
            .attempt_repository()
            .find_by_task(task.id)
            .await
            .unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].success, Some(true));
        assert_eq!(attempts[0].worker_id, "w-test");
    }

    #[tokio::test]
    async fn failure_leaves_task_running_for_retry_policy() {
        let executor = Arc::new(ScriptedExecutor::new(vec![Ok(ExecutionResult::failure(
            "transient",
        ))]));
        let (db, coordinator) = setup(Some(executor)).await;
        let task = claimed_task(&db, "scripted", "{}").await;

        let outcome = coordinator.execute_task(&task, "w-test").await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::RetryableFailure("transient".to_string())
        );

        // 任务状态不由协调器改写，留给重试策略
        let row = db.task_repository().get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Running);

        let attempts = db
            .attempt_repository()
            .find_by_task(task.id)
            .await
            .unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].success, Some(false));
        assert_eq!(attempts[0].error_message.as_deref(), Some("transient"));
    }

    #[tokio::test]
    async fn missing_executor_is_fatal_without_retry() {
        let (db, coordinator) = setup(None).await;
        let task = claimed_task(&db, "ftp", "{}").await;

        let outcome = coordinator.execute_task(&task, "w-test").await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::FatalFailure(_)));

        let row = db.task_repository().get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Failed);
        assert!(row
            .execution_output
            .as_deref()
            .unwrap()
            .contains("no executor for type ftp"));

        let attempts = db
            .attempt_repository()
            .find_by_task(task.id)
            .await
            .unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].success, Some(false));
    }

    #[tokio::test]
    async fn unrecoverable_error_skips_retry_policy() {
        let executor = Arc::new(ScriptedExecutor::new(vec![Err(
            SchedulerError::invalid_params("bad shape"),
        )]));
        let (db, coordinator) = setup(Some(executor)).await;
        let task = claimed_task(&db, "scripted", "{}").await;

        let outcome = coordinator.execute_task(&task, "w-test").await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::FatalFailure(_)));

        let row = db.task_repository().get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn unexpected_error_defaults_to_retry() {
        let executor = Arc::new(ScriptedExecutor::new(vec![Err(
            SchedulerError::Internal("panic-ish".to_string()),
        )]));
        let (db, coordinator) = setup(Some(executor)).await;
        let task = claimed_task(&db, "scripted", "{}").await;

        let outcome = coordinator.execute_task(&task, "w-test").await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::RetryableFailure(_)));

        let row = db.task_repository().get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Running);
    }
}
