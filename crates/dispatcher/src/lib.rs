//! Taskforge 调度侧组件
//!
//! 到期扫描与原子认领、重试决策、Worker 失联检测、启动恢复以及只读监控视图。
//! 各周期性组件通过广播通道接收停止信号，单次 tick 内的错误只记录日志，
//! 不会终止循环。

pub mod failure_detector;
pub mod monitoring;
pub mod recovery;
pub mod retry_policy;
pub mod scheduler;

pub use failure_detector::{FailureDetector, FailureDetectorConfig, FailureScanReport};
pub use monitoring::{
    ExecutionMetrics, HealthStatus, MonitoringService, TaskStatusCounts, WorkerStatusReport,
};
pub use recovery::{RecoveryReport, RecoveryService};
pub use retry_policy::{RetryPolicy, RetryPolicyConfig};
pub use scheduler::TaskScheduler;
