//! 启动恢复
//!
//! 进程启动时、任何循环开始前恰好执行一次：
//! 上个进程遗留的 RUNNING 任务回到就绪池，心跳表整表清空。
//! 旧进程的 worker id 在重启后没有意义，整体重置比跑一遍失联检测更省。
//! 至少一次执行是系统契约，重复驱动一个可能已成功但未提交的任务是可接受的。

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use taskforge_domain::{
    entities::{Task, TaskStatus},
    errors::SchedulerResult,
    repositories::{TaskAttemptRepository, TaskRepository, WorkerRepository},
};

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub recovered_tasks: u64,
    pub cleaned_workers: u64,
}

pub struct RecoveryService {
    task_repo: Arc<dyn TaskRepository>,
    attempt_repo: Arc<dyn TaskAttemptRepository>,
    worker_repo: Arc<dyn WorkerRepository>,
}

impl RecoveryService {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        attempt_repo: Arc<dyn TaskAttemptRepository>,
        worker_repo: Arc<dyn WorkerRepository>,
    ) -> Self {
        Self {
            task_repo,
            attempt_repo,
            worker_repo,
        }
    }

    /// 执行恢复流程
    ///
    /// 启动路径上任何错误都向上传播——带着不一致状态启动比不启动更糟。
    pub async fn recover(&self) -> SchedulerResult<RecoveryReport> {
        info!("开始系统恢复...");

        self.verify_store_reachable().await?;

        let recovered_tasks = self.recover_running_tasks().await?;
        let cleaned_workers = self.worker_repo.delete_all().await?;

        info!(
            "系统恢复完成：重置 {} 个任务，清除 {} 条心跳记录",
            recovered_tasks, cleaned_workers
        );

        Ok(RecoveryReport {
            recovered_tasks,
            cleaned_workers,
        })
    }

    /// 可达性探测：每张表各做一次平凡计数
    async fn verify_store_reachable(&self) -> SchedulerResult<()> {
        let tasks = self.task_repo.count_all().await?;
        let attempts = self.attempt_repo.count_all().await?;
        let heartbeats = self.worker_repo.count_all().await?;
        info!(
            "存储可达：{} 个任务，{} 条执行记录，{} 条心跳",
            tasks, attempts, heartbeats
        );
        Ok(())
    }

    /// 把上个进程遗留的全部 RUNNING 任务重置为 PENDING
    async fn recover_running_tasks(&self) -> SchedulerResult<u64> {
        let running = self.task_repo.find_by_status(TaskStatus::Running).await?;
        if running.is_empty() {
            info!("没有需要恢复的 RUNNING 任务");
            return Ok(0);
        }

        info!("发现 {} 个遗留的 RUNNING 任务", running.len());
        let now = Utc::now();
        let mut recovered = 0u64;

        // 按 worker 分组走批量重置原语（同时清空归属字段）
        let mut owners: Vec<String> = running
            .iter()
            .filter_map(|t| t.worker_id.clone())
            .collect();
        owners.sort();
        owners.dedup();

        for owner in owners {
            recovered += self
                .task_repo
                .reset_abandoned(&owner, TaskStatus::Running, TaskStatus::Pending, now)
                .await?;
        }

        // 归属字段缺失的 RUNNING 行不应存在，兜底走状态 CAS
        for task in running.iter().filter(|t| t.worker_id.is_none()) {
            warn!("RUNNING 任务 {} 没有归属Worker，直接重置状态", task.id);
            if self
                .task_repo
                .update_status(task.id, TaskStatus::Running, TaskStatus::Pending, now)
                .await?
            {
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    /// 一致性检查：RUNNING 任务的归属 Worker 必须有心跳行
    pub async fn find_orphaned_running_tasks(&self) -> SchedulerResult<Vec<Task>> {
        let running = self.task_repo.find_by_status(TaskStatus::Running).await?;
        let mut orphaned = Vec::new();

        for task in running {
            let owner_alive = match &task.worker_id {
                Some(worker_id) => self.worker_repo.get(worker_id).await?.is_some(),
                None => false,
            };
            if !owner_alive {
                warn!(
                    "发现孤儿 RUNNING 任务 {}，归属Worker {:?} 没有心跳记录",
                    task.id, task.worker_id
                );
                orphaned.push(task);
            }
        }

        Ok(orphaned)
    }
}
