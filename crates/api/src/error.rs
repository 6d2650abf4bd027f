//! API 错误与统一响应信封
//!
//! 所有错误响应共享同一 JSON 结构：
//! `{error, message, status, timestamp, path, details[]}`。
//! `path` 在中间件里补齐（IntoResponse 拿不到请求 URI）。

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use taskforge_domain::SchedulerError;

/// API 错误类型，变体对应错误码分类
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Constraint(String),
    #[error("{0}")]
    InvalidJson(String),
    #[error("{0}")]
    TypeMismatch(String),
    #[error("{0}")]
    IllegalArgument(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("调度器错误: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("{0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// 统一错误响应体
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub status: u16,
    pub timestamp: DateTime<Utc>,
    pub path: String,
    pub details: Vec<String>,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            ApiError::Constraint(_) => (StatusCode::BAD_REQUEST, "CONSTRAINT_VIOLATION"),
            ApiError::InvalidJson(_) => (StatusCode::BAD_REQUEST, "INVALID_JSON"),
            ApiError::TypeMismatch(_) => (StatusCode::BAD_REQUEST, "TYPE_MISMATCH"),
            ApiError::IllegalArgument(_) => (StatusCode::BAD_REQUEST, "ILLEGAL_ARGUMENT"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Scheduler(SchedulerError::TaskNotFound { .. }) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            ApiError::Scheduler(SchedulerError::AttemptNotFound { .. }) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            ApiError::Scheduler(SchedulerError::WorkerNotFound { .. }) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            ApiError::Scheduler(SchedulerError::InvalidTaskParams(_)) => {
                (StatusCode::BAD_REQUEST, "ILLEGAL_ARGUMENT")
            }
            ApiError::Scheduler(SchedulerError::ValidationError(_)) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
            }
            ApiError::Scheduler(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        // 内部错误不向外泄露细节
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("内部错误: {}", self);
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = ErrorBody {
            error: code.to_string(),
            message,
            status: status.as_u16(),
            timestamp: Utc::now(),
            path: String::new(),
            details: Vec::new(),
        };

        let mut response = (status, Json(body.clone())).into_response();
        // 中间件读取该扩展补齐 path 后重新序列化
        response.extensions_mut().insert(body);
        response
    }
}

/// 在错误响应体里补上请求路径
pub async fn attach_error_path(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let response = next.run(request).await;

    if let Some(body) = response.extensions().get::<ErrorBody>() {
        let mut body = body.clone();
        body.path = path;
        return (response.status(), Json(body)).into_response();
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_error_classes() {
        assert_eq!(
            ApiError::Validation("x".into()).status_and_code(),
            (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
        );
        assert_eq!(
            ApiError::Conflict("x".into()).status_and_code(),
            (StatusCode::CONFLICT, "CONFLICT")
        );
        assert_eq!(
            ApiError::NotFound("x".into()).status_and_code(),
            (StatusCode::NOT_FOUND, "NOT_FOUND")
        );
        assert_eq!(
            ApiError::Scheduler(SchedulerError::task_not_found(1)).status_and_code(),
            (StatusCode::NOT_FOUND, "NOT_FOUND")
        );
        assert_eq!(
            ApiError::Scheduler(SchedulerError::Internal("x".into())).status_and_code(),
            (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
        );
    }
}
