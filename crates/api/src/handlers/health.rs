//! 健康与监控端点

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use taskforge_dispatcher::{ExecutionMetrics, RecoveryReport, TaskStatusCounts, WorkerStatusReport};

use crate::{
    error::{ApiError, ApiResult},
    routes::AppState,
    types::MetricsQueryParams,
};

const MAX_METRICS_WINDOW_HOURS: i64 = 168;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: i64,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub active_workers: i64,
    pub task_counts: TaskStatusCounts,
    pub hourly_metrics: ExecutionMetrics,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyResponse {
    pub consistent: bool,
    pub orphaned_running_tasks: Vec<OrphanedTaskView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanedTaskView {
    pub task_id: i64,
    pub worker_id: Option<String>,
}

/// GET /health — 聚合状态
pub async fn health(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let monitoring = &state.monitoring;

    let status = monitoring.health_status().await;
    let task_counts = monitoring.status_counts().await?;
    let active_workers = monitoring.active_worker_count().await?;
    let hourly_metrics = monitoring.execution_metrics(1).await?;

    Ok(Json(HealthResponse {
        status: status.as_str().to_string(),
        uptime_seconds: monitoring.uptime_seconds(),
        started_at: monitoring.started_at(),
        active_workers,
        task_counts,
        hourly_metrics,
    }))
}

/// GET /health/workers — 每个 Worker 的存活状态
pub async fn workers(State(state): State<AppState>) -> ApiResult<Json<Vec<WorkerStatusReport>>> {
    Ok(Json(state.monitoring.worker_statuses().await?))
}

/// GET /health/metrics?hours=N — 指定窗口的执行指标
pub async fn metrics(
    State(state): State<AppState>,
    Query(params): Query<MetricsQueryParams>,
) -> ApiResult<Json<ExecutionMetrics>> {
    let hours = params.hours.unwrap_or(24);
    if !(1..=MAX_METRICS_WINDOW_HOURS).contains(&hours) {
        return Err(ApiError::IllegalArgument(format!(
            "hours 必须在 1..={MAX_METRICS_WINDOW_HOURS} 之间"
        )));
    }
    Ok(Json(state.monitoring.execution_metrics(hours).await?))
}

/// POST /health/recovery — 手动触发恢复
pub async fn trigger_recovery(State(state): State<AppState>) -> ApiResult<Json<RecoveryReport>> {
    info!("手动触发系统恢复");
    Ok(Json(state.recovery.recover().await?))
}

/// GET /health/consistency — RUNNING 任务与心跳表的一致性检查
pub async fn consistency(State(state): State<AppState>) -> ApiResult<Json<ConsistencyResponse>> {
    let orphaned = state.recovery.find_orphaned_running_tasks().await?;
    Ok(Json(ConsistencyResponse {
        consistent: orphaned.is_empty(),
        orphaned_running_tasks: orphaned
            .into_iter()
            .map(|t| OrphanedTaskView {
                task_id: t.id,
                worker_id: t.worker_id,
            })
            .collect(),
    }))
}

/// GET /health/live — 存活探针
pub async fn live() -> Json<serde_json::Value> {
    Json(json!({"status": "UP"}))
}

/// GET /health/ready — 就绪探针（存储可达即就绪）
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    if state.monitoring.is_ready().await {
        (StatusCode::OK, Json(json!({"status": "UP"})))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "DOWN"})))
    }
}
