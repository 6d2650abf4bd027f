//! 任务端点

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use tracing::info;

use taskforge_domain::entities::{Task, TaskFilter, TaskStatus};

use crate::{
    error::{ApiError, ApiResult},
    routes::AppState,
    types::{
        AttemptResponse, CreateTaskRequest, DeleteTaskResponse, TaskDetailResponse,
        TaskListResponse, TaskQueryParams, TaskResponse,
    },
};

/// 载荷大小上限（字节）
const MAX_PAYLOAD_BYTES: usize = 64 * 1024;
const MAX_RETRIES_LIMIT: i32 = 100;
const MAX_PAGE_SIZE: i64 = 200;

/// POST /tasks
pub async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<TaskResponse>)> {
    let task_type = request.task_type.trim().to_lowercase();
    if task_type.is_empty() {
        return Err(ApiError::Validation("type 不能为空".to_string()));
    }
    if !state.supported_types.iter().any(|t| t == &task_type) {
        return Err(ApiError::Validation(format!(
            "不支持的任务类型: {task_type}，可用类型: {}",
            state.supported_types.join(", ")
        )));
    }

    if request.payload.is_empty() {
        return Err(ApiError::Validation("payload 不能为空".to_string()));
    }
    if request.payload.len() > MAX_PAYLOAD_BYTES {
        return Err(ApiError::Constraint(format!(
            "payload 超过 {MAX_PAYLOAD_BYTES} 字节上限"
        )));
    }
    // 内置执行器都按 JSON 解读载荷，入库前先把格式问题挡掉
    if serde_json::from_str::<serde_json::Value>(&request.payload).is_err() {
        return Err(ApiError::InvalidJson("payload 不是合法的 JSON".to_string()));
    }

    let max_retries = request.max_retries.unwrap_or(state.default_max_retries);
    if !(0..=MAX_RETRIES_LIMIT).contains(&max_retries) {
        return Err(ApiError::Constraint(format!(
            "maxRetries 必须在 0..={MAX_RETRIES_LIMIT} 之间"
        )));
    }

    let schedule_at = request.schedule_at.unwrap_or_else(chrono::Utc::now);

    let task = Task::new(task_type, request.payload, schedule_at, max_retries);
    let created = state.task_repo.create(&task).await?;

    info!("创建任务: id={}, 类型={}", created.id, created.task_type);
    Ok((StatusCode::CREATED, Json(created.into())))
}

/// GET /tasks/{id}
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<TaskDetailResponse>> {
    let task = state
        .task_repo
        .get_by_id(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("任务 {id} 不存在")))?;

    let attempts = state.attempt_repo.find_by_task(id).await?;

    Ok(Json(TaskDetailResponse {
        task: task.into(),
        attempts: attempts.into_iter().map(AttemptResponse::from).collect(),
    }))
}

/// GET /tasks?status=&type=&page=&size=
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<TaskQueryParams>,
) -> ApiResult<Json<TaskListResponse>> {
    let status = match params.status.as_deref() {
        Some(raw) => Some(TaskStatus::parse(&raw.to_uppercase()).ok_or_else(|| {
            ApiError::TypeMismatch(format!("status 取值非法: {raw}"))
        })?),
        None => None,
    };

    let page = params.page.unwrap_or(0);
    let size = params.size.unwrap_or(20);
    if page < 0 {
        return Err(ApiError::IllegalArgument("page 不能为负数".to_string()));
    }
    if !(1..=MAX_PAGE_SIZE).contains(&size) {
        return Err(ApiError::IllegalArgument(format!(
            "size 必须在 1..={MAX_PAGE_SIZE} 之间"
        )));
    }

    let filter = TaskFilter {
        status,
        task_type: params.task_type.map(|t| t.to_lowercase()),
        page,
        page_size: size,
    };
    let (tasks, total) = state.task_repo.list(&filter).await?;

    let total_pages = if total == 0 { 0 } else { (total + size - 1) / size };
    Ok(Json(TaskListResponse {
        tasks: tasks.into_iter().map(TaskResponse::from).collect(),
        page,
        size,
        total_elements: total,
        total_pages,
    }))
}

/// DELETE /tasks/{id} — 取消：仅 PENDING 任务可删除
pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<DeleteTaskResponse>> {
    let task = state
        .task_repo
        .get_by_id(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("任务 {id} 不存在")))?;

    if task.status != TaskStatus::Pending {
        return Err(ApiError::Conflict(format!(
            "任务 {id} 当前状态为 {}，仅 PENDING 任务可取消",
            task.status
        )));
    }

    // CAS 删除：读检之后行仍可能被调度器抢走
    if !state.task_repo.delete_if_pending(id).await? {
        return Err(ApiError::Conflict(format!(
            "任务 {id} 已被调度器认领，无法取消"
        )));
    }

    info!("取消任务: id={}", id);
    Ok(Json(DeleteTaskResponse {
        id,
        message: "task cancelled".to_string(),
    }))
}
