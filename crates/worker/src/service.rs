//! Worker 服务
//!
//! 进程内的后台角色：启动时注册身份，之后两个子循环并行——
//! 心跳写入（心跳行消失则重新注册）和任务轮询（按 assigned_at 顺序
//! 逐个驱动协调器，失败结果交给重试策略）。

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use taskforge_dispatcher::RetryPolicy;
use taskforge_domain::{
    entities::{TaskStatus, WorkerMetadata},
    errors::SchedulerResult,
    repositories::{TaskRepository, WorkerRepository},
};

use crate::coordinator::{ExecutionCoordinator, ExecutionOutcome};

#[derive(Debug, Clone)]
pub struct WorkerServiceConfig {
    pub heartbeat_interval_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for WorkerServiceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            poll_interval_ms: 1000,
        }
    }
}

pub struct WorkerService {
    worker_id: String,
    task_repo: Arc<dyn TaskRepository>,
    worker_repo: Arc<dyn WorkerRepository>,
    coordinator: Arc<ExecutionCoordinator>,
    retry_policy: Arc<RetryPolicy>,
    config: WorkerServiceConfig,
    started_at: chrono::DateTime<Utc>,
}

impl WorkerService {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        worker_repo: Arc<dyn WorkerRepository>,
        coordinator: Arc<ExecutionCoordinator>,
        retry_policy: Arc<RetryPolicy>,
        config: WorkerServiceConfig,
    ) -> Self {
        Self {
            worker_id: generate_worker_id(),
            task_repo,
            worker_repo,
            coordinator,
            retry_policy,
            config,
            started_at: Utc::now(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// 注册身份：写入（或刷新）心跳行，metadata 记录主机名、pid 和启动时刻
    pub async fn register(&self) -> SchedulerResult<()> {
        let metadata = WorkerMetadata {
            hostname: hostname_string(),
            pid: std::process::id(),
            started_at: self.started_at,
        };
        let metadata_json = serde_json::to_string(&metadata)
            .map_err(taskforge_domain::SchedulerError::from)?;

        self.worker_repo
            .upsert(&self.worker_id, Utc::now(), Some(&metadata_json))
            .await?;

        info!("Worker {} 注册成功", self.worker_id);
        Ok(())
    }

    /// 心跳子循环的单次 tick
    ///
    /// 零行命中说明心跳行已被清理（如 GC 停顿后被失联检测清除），重新注册。
    /// 已被重置回就绪池的任务不会再出现在本 Worker 的 RUNNING 查询里。
    pub async fn heartbeat_tick(&self) -> SchedulerResult<()> {
        let updated = self.worker_repo.touch(&self.worker_id, Utc::now()).await?;
        if updated == 0 {
            warn!("Worker {} 的心跳行已消失，重新注册", self.worker_id);
            self.register().await?;
        } else {
            debug!("Worker {} 心跳已刷新", self.worker_id);
        }
        Ok(())
    }

    /// 处理子循环的单次 tick：顺序驱动所有认领给本 Worker 的任务
    pub async fn process_tick(&self) -> SchedulerResult<usize> {
        let tasks = self
            .task_repo
            .find_by_worker_and_status(&self.worker_id, TaskStatus::Running)
            .await?;

        if tasks.is_empty() {
            return Ok(0);
        }

        info!("Worker {} 发现 {} 个待处理任务", self.worker_id, tasks.len());
        let mut processed = 0usize;

        for task in &tasks {
            match self.coordinator.execute_task(task, &self.worker_id).await {
                Ok(ExecutionOutcome::Succeeded) | Ok(ExecutionOutcome::FatalFailure(_)) => {
                    processed += 1;
                }
                Ok(ExecutionOutcome::RetryableFailure(_)) => {
                    processed += 1;
                    // 重新读取当前行，重试决策基于最新的 retry_count
                    match self.task_repo.get_by_id(task.id).await? {
                        Some(current) => {
                            if let Err(e) = self.retry_policy.handle_task_failure(&current).await {
                                error!("任务 {} 的重试处理失败: {}", task.id, e);
                            }
                        }
                        None => {
                            warn!("任务 {} 在失败处理前被删除", task.id);
                        }
                    }
                }
                Err(e) => {
                    // 单个任务的故障不阻塞同批其余任务
                    error!("Worker {} 处理任务 {} 出错: {}", self.worker_id, task.id, e);
                }
            }
        }

        Ok(processed)
    }

    /// Worker 主循环：注册后并行驱动心跳与任务处理两个子周期
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if let Err(e) = self.register().await {
            error!("Worker {} 注册失败，服务不启动: {}", self.worker_id, e);
            return;
        }

        info!(
            "Worker {} 启动（心跳 {}ms，轮询 {}ms）",
            self.worker_id, self.config.heartbeat_interval_ms, self.config.poll_interval_ms
        );

        let mut heartbeat = tokio::time::interval(std::time::Duration::from_millis(
            self.config.heartbeat_interval_ms,
        ));
        let mut poll = tokio::time::interval(std::time::Duration::from_millis(
            self.config.poll_interval_ms,
        ));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    // 在途执行不取消，留给下次启动的恢复流程重新排队
                    info!("Worker {} 收到停止信号", self.worker_id);
                    break;
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.heartbeat_tick().await {
                        error!("Worker {} 心跳出错: {}", self.worker_id, e);
                    }
                }
                _ = poll.tick() => {
                    if let Err(e) = self.process_tick().await {
                        error!("Worker {} 任务轮询出错: {}", self.worker_id, e);
                    }
                }
            }
        }

        info!("Worker {} 已停止", self.worker_id);
    }
}

/// 身份：主机名 + 8 位随机后缀
fn generate_worker_id() -> String {
    let suffix = uuid::Uuid::new_v4().to_string();
    format!("{}-{}", hostname_string(), &suffix[..8])
}

fn hostname_string() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}
