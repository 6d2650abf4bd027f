//! Taskforge 领域层
//!
//! 任务调度引擎的核心实体、错误类型和仓库接口定义。
//! 该层不依赖任何具体的数据库或网络实现。

pub mod entities;
pub mod errors;
pub mod repositories;

pub use entities::{
    ExecutionResult, Task, TaskAttempt, TaskFilter, TaskStatus, WorkerHeartbeat, WorkerMetadata,
};
pub use errors::{SchedulerError, SchedulerResult};
pub use repositories::{TaskAttemptRepository, TaskRepository, WorkerRepository};
