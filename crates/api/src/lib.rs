//! Taskforge HTTP 层
//!
//! axum 路由、任务与健康端点、统一错误响应信封以及关联 ID 中间件。

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod types;

pub use error::{ApiError, ApiResult};
pub use routes::{create_router, AppState};
