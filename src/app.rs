//! 应用组装
//!
//! 显式的初始化顺序：存储 → 启动恢复 → 执行器注册表 → 各后台循环 → HTTP 服务。
//! 恢复失败则进程不启动——半初始化的调度器比没有更糟。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use taskforge_api::{create_router, AppState};
use taskforge_config::AppConfig;
use taskforge_dispatcher::{
    FailureDetector, FailureDetectorConfig, MonitoringService, RecoveryService, RetryPolicy,
    RetryPolicyConfig, TaskScheduler,
};
use taskforge_infrastructure::DatabaseManager;
use taskforge_worker::{
    service::WorkerServiceConfig, DummyExecutor, ExecutionCoordinator, ExecutorRegistry,
    HttpExecutor, ShellExecutor, WorkerService,
};

use crate::shutdown::ShutdownManager;

pub struct Application {
    config: AppConfig,
    scheduler: Arc<TaskScheduler>,
    worker: Arc<WorkerService>,
    detector: Arc<FailureDetector>,
    state: AppState,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        // 1. 存储：连接池 + 内嵌迁移
        info!("初始化数据库: {}", config.database.url);
        let db = DatabaseManager::connect(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
            Duration::from_secs(config.database.connect_timeout_seconds),
        )
        .await
        .context("初始化数据库失败")?;

        let task_repo = db.task_repository();
        let attempt_repo = db.attempt_repository();
        let worker_repo = db.worker_repository();

        // 2. 启动恢复：任何循环开始前恰好执行一次
        let recovery = Arc::new(RecoveryService::new(
            Arc::clone(&task_repo),
            Arc::clone(&attempt_repo),
            Arc::clone(&worker_repo),
        ));
        let report = recovery.recover().await.context("启动恢复失败")?;
        info!(
            "启动恢复完成：重置 {} 个任务，清除 {} 条心跳",
            report.recovered_tasks, report.cleaned_workers
        );

        // 3. 执行器注册表
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(HttpExecutor::new()));
        registry.register(Arc::new(ShellExecutor));
        registry.register(Arc::new(DummyExecutor));
        let supported_types = registry.supported_types();
        let registry = Arc::new(registry);

        // 4. 服务组件
        let retry_policy = Arc::new(RetryPolicy::new(
            Arc::clone(&task_repo),
            RetryPolicyConfig {
                default_max_retries: config.retry.default_max_retries,
                base_delay_ms: config.retry.base_delay_ms,
                max_delay_ms: config.retry.max_delay_ms,
            },
        ));
        let coordinator = Arc::new(ExecutionCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&task_repo),
            Arc::clone(&attempt_repo),
        ));
        let monitoring = Arc::new(MonitoringService::new(
            Arc::clone(&task_repo),
            Arc::clone(&attempt_repo),
            Arc::clone(&worker_repo),
            config.worker.heartbeat_timeout_ms,
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            Arc::clone(&task_repo),
            Arc::clone(&worker_repo),
            config.worker.heartbeat_timeout_ms,
        ));
        let worker = Arc::new(WorkerService::new(
            Arc::clone(&task_repo),
            Arc::clone(&worker_repo),
            coordinator,
            Arc::clone(&retry_policy),
            WorkerServiceConfig {
                heartbeat_interval_ms: config.worker.heartbeat_interval_ms,
                poll_interval_ms: config.worker.poll_interval_ms,
            },
        ));
        let detector = Arc::new(FailureDetector::new(
            Arc::clone(&task_repo),
            Arc::clone(&worker_repo),
            retry_policy,
            FailureDetectorConfig {
                heartbeat_timeout_ms: config.worker.heartbeat_timeout_ms,
                ..Default::default()
            },
        ));

        let state = AppState {
            task_repo,
            attempt_repo,
            monitoring,
            recovery,
            supported_types,
            default_max_retries: config.retry.default_max_retries,
        };

        Ok(Self {
            config,
            scheduler,
            worker,
            detector,
            state,
        })
    }

    /// 启动各后台循环并运行 HTTP 服务直到收到关闭信号
    pub async fn run(&self, shutdown: &ShutdownManager) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();

        if self.config.scheduler.enabled {
            let scheduler = Arc::clone(&self.scheduler);
            let interval = self.config.scheduler.polling_interval_ms;
            let rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                scheduler.run(interval, rx).await;
            }));
        } else {
            warn!("调度循环已在配置中禁用");
        }

        if self.config.worker.enabled {
            let worker = Arc::clone(&self.worker);
            let rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                worker.run(rx).await;
            }));
        } else {
            warn!("Worker 服务已在配置中禁用");
        }

        {
            let detector = Arc::clone(&self.detector);
            let interval = self.config.monitoring.failure_detection_interval_ms;
            let rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                detector.run(interval, rx).await;
            }));
        }

        if self.config.api.enabled {
            let router = create_router(self.state.clone());
            let addr = self.config.api.bind_address.clone();
            let mut rx = shutdown.subscribe();

            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("监听地址绑定失败: {addr}"))?;
            info!("HTTP 服务监听于 {}", addr);

            handles.push(tokio::spawn(async move {
                let result = axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        let _ = rx.recv().await;
                    })
                    .await;
                if let Err(e) = result {
                    tracing::error!("HTTP 服务异常退出: {e}");
                }
            }));
        } else {
            warn!("HTTP 服务已在配置中禁用");
        }

        info!(
            "应用启动完成（调度 {}ms，心跳 {}ms / 超时 {}ms，失联检测 {}ms）",
            self.config.scheduler.polling_interval_ms,
            self.config.worker.heartbeat_interval_ms,
            self.config.worker.heartbeat_timeout_ms,
            self.config.monitoring.failure_detection_interval_ms
        );

        Ok(handles)
    }
}
