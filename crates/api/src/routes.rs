use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use taskforge_dispatcher::{MonitoringService, RecoveryService};
use taskforge_domain::repositories::{TaskAttemptRepository, TaskRepository};

use crate::{
    error::attach_error_path,
    handlers::{
        health::{consistency, health, live, metrics, ready, trigger_recovery, workers},
        tasks::{create_task, delete_task, get_task, list_tasks},
    },
    middleware::{correlation_id, cors_layer, request_logging},
};

#[derive(Clone)]
pub struct AppState {
    pub task_repo: Arc<dyn TaskRepository>,
    pub attempt_repo: Arc<dyn TaskAttemptRepository>,
    pub monitoring: Arc<MonitoringService>,
    pub recovery: Arc<RecoveryService>,
    /// 注册表声明的类型标签，创建请求按此校验
    pub supported_types: Vec<String>,
    pub default_max_retries: i32,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/{id}", get(get_task).delete(delete_task))
        .route("/health", get(health))
        .route("/health/workers", get(workers))
        .route("/health/metrics", get(metrics))
        .route("/health/recovery", post(trigger_recovery))
        .route("/health/consistency", get(consistency))
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .layer(middleware::from_fn(attach_error_path))
        .layer(middleware::from_fn(correlation_id))
        .layer(middleware::from_fn(request_logging))
        .layer(cors_layer())
        .with_state(state)
}
