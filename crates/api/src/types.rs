//! API 数据传输对象

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskforge_domain::entities::{Task, TaskAttempt, TaskStatus};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: String,
    pub schedule_at: Option<DateTime<Utc>>,
    pub max_retries: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct TaskQueryParams {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub task_type: Option<String>,
    pub page: Option<i64>,
    pub size: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct MetricsQueryParams {
    pub hours: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub id: i64,
    #[serde(rename = "type")]
    pub task_type: String,
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

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            task_type: task.task_type,
            payload: task.payload,
            status: task.status,
            schedule_at: task.schedule_at,
            created_at: task.created_at,
            updated_at: task.updated_at,
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            worker_id: task.worker_id,
            assigned_at: task.assigned_at,
            completed_at: task.completed_at,
            execution_output: task.execution_output,
            execution_metadata: task.execution_metadata,
            version: task.version,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptResponse {
    pub id: i64,
    pub task_id: i64,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub metadata: Option<String>,
    pub duration_ms: Option<i64>,
}

impl From<TaskAttempt> for AttemptResponse {
    fn from(attempt: TaskAttempt) -> Self {
        let duration_ms = attempt.duration_ms();
        Self {
            id: attempt.id,
            task_id: attempt.task_id,
            worker_id: attempt.worker_id,
            started_at: attempt.started_at,
            completed_at: attempt.completed_at,
            success: attempt.success,
            output: attempt.output,
            error_message: attempt.error_message,
            metadata: attempt.metadata,
            duration_ms,
        }
    }
}

/// 任务详情：任务视图 + 执行历史
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDetailResponse {
    #[serde(flatten)]
    pub task: TaskResponse,
    pub attempts: Vec<AttemptResponse>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListResponse {
    pub tasks: Vec<TaskResponse>,
    pub page: i64,
    pub size: i64,
    pub total_elements: i64,
    pub total_pages: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteTaskResponse {
    pub id: i64,
    pub message: String,
}
