//! 仓库接口
//!
//! 存储层是系统中唯一允许修改持久化状态的组件。
//! 所有条件更新（CAS）在零行命中时返回 `false`/`0` 而不是错误——
//! 这是并发竞争的正常分支，调用方须重新读取当前状态后再做决定。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entities::{Task, TaskAttempt, TaskFilter, TaskStatus, WorkerHeartbeat};
use crate::errors::SchedulerResult;

/// 任务仓库
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 插入新任务，返回带数据库生成 id 的完整行
    async fn create(&self, task: &Task) -> SchedulerResult<Task>;

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Task>>;

    /// 所有 `status=PENDING ∧ schedule_at ≤ now` 的行，按 schedule_at 升序
    async fn find_due(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<Task>>;

    /// 原子认领：状态 CAS + 写入 worker 归属。恰好更新一行时返回 true
    async fn claim(
        &self,
        id: i64,
        from: TaskStatus,
        to: TaskStatus,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 状态 CAS（不带归属字段），用于终态转换
    async fn update_status(
        &self,
        id: i64,
        from: TaskStatus,
        to: TaskStatus,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 无条件按 id 写入终态字段（仅在执行器返回后调用）
    #[allow(clippy::too_many_arguments)]
    async fn complete(
        &self,
        id: i64,
        to: TaskStatus,
        completed_at: DateTime<Utc>,
        output: Option<&str>,
        metadata: Option<&str>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 单行：retry_count+1，清空归属，状态回 PENDING，推迟 schedule_at
    async fn increment_retry_and_reschedule(
        &self,
        id: i64,
        new_schedule_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 批量：把某 worker 的所有 `from` 状态任务重置为 `to`，返回影响行数
    async fn reset_abandoned(
        &self,
        worker_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        now: DateTime<Utc>,
    ) -> SchedulerResult<u64>;

    async fn count_by_status(&self, status: TaskStatus) -> SchedulerResult<i64>;

    async fn count_all(&self) -> SchedulerResult<i64>;

    async fn find_by_status(&self, status: TaskStatus) -> SchedulerResult<Vec<Task>>;

    /// 某 worker 名下指定状态的任务，按 assigned_at 升序（worker 顺序处理的依据）
    async fn find_by_worker_and_status(
        &self,
        worker_id: &str,
        status: TaskStatus,
    ) -> SchedulerResult<Vec<Task>>;

    /// `retry_count ≥ max_retries` 且处于指定状态的行（重试安全网扫描）
    async fn find_exceeding_retry_limit(&self, status: TaskStatus) -> SchedulerResult<Vec<Task>>;

    /// 分页列表，返回 (本页行, 总数)
    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<(Vec<Task>, i64)>;

    /// 仅当行仍为 PENDING 时删除（取消语义），删除成功返回 true
    async fn delete_if_pending(&self, id: i64) -> SchedulerResult<bool>;
}

/// 执行记录仓库
#[async_trait]
pub trait TaskAttemptRepository: Send + Sync {
    /// 插入执行中记录（completed_at/success 为空）
    async fn start(&self, task_id: i64, worker_id: &str) -> SchedulerResult<TaskAttempt>;

    /// 终态更新执行记录
    async fn finish(
        &self,
        attempt_id: i64,
        success: bool,
        output: Option<&str>,
        error_message: Option<&str>,
        metadata: Option<&str>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 某任务的全部执行记录，最新在前
    async fn find_by_task(&self, task_id: i64) -> SchedulerResult<Vec<TaskAttempt>>;

    /// 执行中的记录（completed_at 为空）
    async fn find_running(&self) -> SchedulerResult<Vec<TaskAttempt>>;

    /// 开始时间早于 cutoff 且仍未完成的记录（疑似卡死）
    async fn find_stuck(&self, cutoff: DateTime<Utc>) -> SchedulerResult<Vec<TaskAttempt>>;

    async fn count_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SchedulerResult<i64>;

    async fn count_successful_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SchedulerResult<i64>;

    async fn count_failed_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SchedulerResult<i64>;

    /// 窗口内已完成记录的平均执行时长（毫秒）
    async fn average_duration_ms_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SchedulerResult<Option<f64>>;

    async fn count_all(&self) -> SchedulerResult<i64>;
}

/// Worker 心跳仓库
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    /// 注册或刷新心跳行（存在则更新 last_heartbeat 和 metadata）
    async fn upsert(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        metadata: Option<&str>,
    ) -> SchedulerResult<()>;

    /// 仅刷新 last_heartbeat，返回影响行数。
    /// 零行说明心跳行已被清理，调用方须重新注册
    async fn touch(&self, worker_id: &str, now: DateTime<Utc>) -> SchedulerResult<u64>;

    async fn get(&self, worker_id: &str) -> SchedulerResult<Option<WorkerHeartbeat>>;

    /// 全部心跳行，最近心跳在前
    async fn find_all(&self) -> SchedulerResult<Vec<WorkerHeartbeat>>;

    /// last_heartbeat ≥ cutoff 的 worker
    async fn find_active(&self, cutoff: DateTime<Utc>) -> SchedulerResult<Vec<WorkerHeartbeat>>;

    /// last_heartbeat < cutoff 的 worker
    async fn find_stale(&self, cutoff: DateTime<Utc>) -> SchedulerResult<Vec<WorkerHeartbeat>>;

    async fn count_active(&self, cutoff: DateTime<Utc>) -> SchedulerResult<i64>;

    /// 删除 last_heartbeat < cutoff 的行，返回删除数（用于 24 小时清理）
    async fn cleanup_stale(&self, cutoff: DateTime<Utc>) -> SchedulerResult<u64>;

    /// 整表清空（启动恢复用），返回删除数
    async fn delete_all(&self) -> SchedulerResult<u64>;

    async fn count_all(&self) -> SchedulerResult<i64>;
}
