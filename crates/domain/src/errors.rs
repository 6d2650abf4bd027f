use thiserror::Error;

/// 调度引擎统一错误类型
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },
    #[error("执行记录未找到: {id}")]
    AttemptNotFound { id: i64 },
    #[error("Worker未找到: {id}")]
    WorkerNotFound { id: String },
    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),
    #[error("任务执行错误: {0}")]
    TaskExecution(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("数据验证失败: {0}")]
    ValidationError(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn task_not_found(id: i64) -> Self {
        Self::TaskNotFound { id }
    }

    pub fn attempt_not_found(id: i64) -> Self {
        Self::AttemptNotFound { id }
    }

    pub fn worker_not_found<S: Into<String>>(id: S) -> Self {
        Self::WorkerNotFound { id: id.into() }
    }

    pub fn invalid_params<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTaskParams(msg.into())
    }

    pub fn execution<S: Into<String>>(msg: S) -> Self {
        Self::TaskExecution(msg.into())
    }

    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }

    /// 执行器抛出的不可恢复错误：任务形态本身有问题，跳过重试直接终结
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidTaskParams(_) | SchedulerError::ValidationError(_)
        )
    }

    /// 存储/网络类瞬时故障，下个周期自然重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Database(_) | SchedulerError::TaskExecution(_)
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}
