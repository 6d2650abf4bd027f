//! 领域实体
//!
//! 任务、执行记录和Worker心跳是系统仅有的三类持久化实体。
//! 所有可变行都携带单调递增的 `version` 列，用于乐观并发控制。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// 任务相关实体
// ============================================================================

/// 任务状态
///
/// 生命周期：PENDING → RUNNING → SUCCESS | FAILED。
/// 失败且重试预算未耗尽的任务会回到 PENDING 并推迟 `schedule_at`。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILED")]
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TaskStatus::Pending),
            "RUNNING" => Some(TaskStatus::Running),
            "SUCCESS" => Some(TaskStatus::Success),
            "FAILED" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// 终态行不会再被调度或改写
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// SQLx 数据库类型支持 - TaskStatus
impl sqlx::Type<sqlx::Postgres> for TaskStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl sqlx::Type<sqlx::Sqlite> for TaskStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for TaskStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        TaskStatus::parse(s).ok_or_else(|| format!("Invalid task status: {s}").into())
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        TaskStatus::parse(s).ok_or_else(|| format!("Invalid task status: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for TaskStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 任务定义
///
/// 一次性的持久化工作单元：类型标签 + 不透明载荷 + 调度时间 + 重试预算。
/// `worker_id`/`assigned_at` 仅在 RUNNING 期间有意义（终态行保留最后归属）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub task_type: String, // "http", "shell", "dummy", ...
    pub payload: String,
    pub status: TaskStatus,
    pub schedule_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub worker_id: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_output: Option<String>,
    pub execution_metadata: Option<String>,
    pub version: i64,
}

impl Task {
    /// 创建新任务（id 将由数据库生成）
    pub fn new(
        task_type: impl Into<String>,
        payload: impl Into<String>,
        schedule_at: DateTime<Utc>,
        max_retries: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            task_type: task_type.into(),
            payload: payload.into(),
            status: TaskStatus::Pending,
            schedule_at,
            created_at: now,
            updated_at: now,
            retry_count: 0,
            max_retries,
            worker_id: None,
            assigned_at: None,
            completed_at: None,
            execution_output: None,
            execution_metadata: None,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 重试预算是否尚未耗尽
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.schedule_at <= now
    }
}

/// 任务列表过滤条件
#[derive(Debug, Clone)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub page: i64,
    pub page_size: i64,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            status: None,
            task_type: None,
            page: 0,
            page_size: 20,
        }
    }
}

impl TaskFilter {
    pub fn offset(&self) -> i64 {
        self.page * self.page_size
    }
}

// ============================================================================
// 执行记录
// ============================================================================

/// 任务执行记录
///
/// 每次执行器调用写入一行，不复用。
/// 不变量：`completed_at` 为空 ⇔ `success` 为空（执行中）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub id: i64,
    pub task_id: i64,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub metadata: Option<String>,
}

impl TaskAttempt {
    pub fn is_finished(&self) -> bool {
        self.completed_at.is_some()
    }

    /// 执行时长（毫秒），执行中返回 None
    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|done| (done - self.started_at).num_milliseconds())
    }
}

// ============================================================================
// Worker 心跳
// ============================================================================

/// Worker 心跳记录
///
/// `worker_id` 为主键；进程重启后由恢复流程整表清空。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub metadata: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub version: i64,
}

impl WorkerHeartbeat {
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_heartbeat < cutoff
    }

    pub fn seconds_since_heartbeat(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_heartbeat).num_seconds()
    }
}

/// Worker 自描述信息，序列化后存入心跳行的 metadata 字段
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMetadata {
    pub hostname: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

// ============================================================================
// 执行结果
// ============================================================================

/// 执行器返回的结果
///
/// 成功时 output 可以为空；失败必须带错误消息。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ExecutionResult {
    pub fn success(output: Option<String>) -> Self {
        Self {
            success: true,
            output,
            error_message: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn success_with_metadata(
        output: Option<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            success: true,
            output,
            error_message: None,
            metadata,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error_message: Some(message.into()),
            metadata: serde_json::Map::new(),
        }
    }

    /// metadata 序列化为 JSON 字符串；为空时返回 None
    pub fn metadata_json(&self) -> Option<String> {
        if self.metadata.is_empty() {
            None
        } else {
            serde_json::to_string(&self.metadata).ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn task_status_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Success,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("CANCELLED"), None);
    }

    #[test]
    fn new_task_starts_pending_with_zero_retries() {
        let task = Task::new("dummy", "{}", Utc::now(), 3);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.version, 0);
        assert!(task.worker_id.is_none());
        assert!(task.can_retry());
        assert!(!task.is_terminal());
    }

    #[test]
    fn task_due_check_respects_schedule_time() {
        let now = Utc::now();
        let mut task = Task::new("dummy", "{}", now + Duration::seconds(60), 3);
        assert!(!task.is_due(now));
        task.schedule_at = now - Duration::seconds(1);
        assert!(task.is_due(now));
        task.status = TaskStatus::Running;
        assert!(!task.is_due(now));
    }

    #[test]
    fn attempt_duration_only_when_finished() {
        let now = Utc::now();
        let mut attempt = TaskAttempt {
            id: 1,
            task_id: 1,
            worker_id: "w-1".to_string(),
            started_at: now,
            completed_at: None,
            success: None,
            output: None,
            error_message: None,
            metadata: None,
        };
        assert!(!attempt.is_finished());
        assert_eq!(attempt.duration_ms(), None);

        attempt.completed_at = Some(now + Duration::milliseconds(250));
        attempt.success = Some(true);
        assert!(attempt.is_finished());
        assert_eq!(attempt.duration_ms(), Some(250));
    }

    #[test]
    fn heartbeat_staleness() {
        let now = Utc::now();
        let hb = WorkerHeartbeat {
            worker_id: "host-abc12345".to_string(),
            last_heartbeat: now - Duration::seconds(120),
            metadata: None,
            registered_at: now - Duration::seconds(3600),
            version: 0,
        };
        assert!(hb.is_stale(now - Duration::seconds(60)));
        assert!(!hb.is_stale(now - Duration::seconds(180)));
        assert_eq!(hb.seconds_since_heartbeat(now), 120);
    }

    #[test]
    fn execution_result_constructors() {
        let ok = ExecutionResult::success(Some("done".to_string()));
        assert!(ok.success);
        assert!(ok.error_message.is_none());
        assert!(ok.metadata_json().is_none());

        let failed = ExecutionResult::failure("boom");
        assert!(!failed.success);
        assert_eq!(failed.error_message.as_deref(), Some("boom"));

        let mut meta = serde_json::Map::new();
        meta.insert("statusCode".to_string(), serde_json::json!(200));
        let with_meta = ExecutionResult::success_with_metadata(None, meta);
        assert!(with_meta.metadata_json().unwrap().contains("statusCode"));
    }
}
