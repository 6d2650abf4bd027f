//! Taskforge Worker 侧组件
//!
//! 执行器契约与内置执行器（http / shell / dummy）、执行器注册表、
//! 执行协调器以及 Worker 服务（注册、心跳、轮询认领任务）。

pub mod coordinator;
pub mod executors;
pub mod registry;
pub mod service;

pub use coordinator::{ExecutionCoordinator, ExecutionOutcome};
pub use executors::{DummyExecutor, HttpExecutor, ShellExecutor, TaskExecutor};
pub use registry::ExecutorRegistry;
pub use service::WorkerService;
