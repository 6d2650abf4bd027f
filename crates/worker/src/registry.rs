//! 执行器注册表
//!
//! 有序的能力列表，按注册顺序取第一个声明能处理该类型的执行器。
//! 新任务类型 = 注册一个新执行器，核心不需要感知类型全集。

use std::sync::Arc;

use tracing::info;

use crate::executors::TaskExecutor;

#[derive(Default)]
pub struct ExecutorRegistry {
    executors: Vec<Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn TaskExecutor>) {
        info!("注册任务执行器: {}", executor.name());
        self.executors.push(executor);
    }

    /// 第一个声明处理该类型的执行器；没有则返回 None
    pub fn find_for(&self, task_type: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors
            .iter()
            .find(|e| e.handles(task_type))
            .cloned()
    }

    pub fn supported_types(&self) -> Vec<String> {
        self.executors.iter().map(|e| e.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
