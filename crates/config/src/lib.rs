//! 应用配置
//!
//! 分层加载：内置默认值 → 可选 TOML 文件 → `TASKFORGE__` 前缀环境变量。
//! 所有配置项均有默认值，加载后统一校验。

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// 到期扫描周期（毫秒）
    pub polling_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// 心跳写入周期（毫秒）
    pub heartbeat_interval_ms: u64,
    /// 超过该时长未心跳即判定失联（毫秒）
    pub heartbeat_timeout_ms: u64,
    /// 已认领任务的轮询周期（毫秒）
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub default_max_retries: i32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// 失联检测周期（毫秒）
    pub failure_detection_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite:taskforge.db".to_string(),
                max_connections: 10,
                min_connections: 1,
                connect_timeout_seconds: 30,
            },
            api: ApiConfig {
                enabled: true,
                bind_address: "0.0.0.0:8080".to_string(),
            },
            scheduler: SchedulerConfig {
                enabled: true,
                polling_interval_ms: 1000,
            },
            worker: WorkerConfig {
                enabled: true,
                heartbeat_interval_ms: 30_000,
                heartbeat_timeout_ms: 60_000,
                poll_interval_ms: 1000,
            },
            retry: RetryConfig {
                default_max_retries: 3,
                base_delay_ms: 1000,
                max_delay_ms: 300_000,
            },
            monitoring: MonitoringConfig {
                failure_detection_interval_ms: 30_000,
            },
        }
    }
}

impl AppConfig {
    /// 加载配置
    ///
    /// 指定路径时文件必须存在；未指定时按默认路径搜索，找不到则使用内置默认值。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {path}"));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            let default_paths = [
                "config/taskforge.toml",
                "taskforge.toml",
                "/etc/taskforge/config.toml",
            ];
            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder
            .set_default("database.url", "sqlite:taskforge.db")?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 1)?
            .set_default("database.connect_timeout_seconds", 30)?
            .set_default("api.enabled", true)?
            .set_default("api.bind_address", "0.0.0.0:8080")?
            .set_default("scheduler.enabled", true)?
            .set_default("scheduler.polling_interval_ms", 1000)?
            .set_default("worker.enabled", true)?
            .set_default("worker.heartbeat_interval_ms", 30_000)?
            .set_default("worker.heartbeat_timeout_ms", 60_000)?
            .set_default("worker.poll_interval_ms", 1000)?
            .set_default("retry.default_max_retries", 3)?
            .set_default("retry.base_delay_ms", 1000)?
            .set_default("retry.max_delay_ms", 300_000)?
            .set_default("monitoring.failure_detection_interval_ms", 30_000)?;

        // 环境变量覆盖，如 TASKFORGE__DATABASE__URL
        builder = builder.add_source(
            Environment::with_prefix("TASKFORGE")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// 配置一致性校验
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("database.url 不能为空");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("database.max_connections 必须大于 0");
        }
        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!("database.min_connections 不能大于 max_connections");
        }
        if self.scheduler.polling_interval_ms == 0 {
            anyhow::bail!("scheduler.polling_interval_ms 必须大于 0");
        }
        if self.worker.heartbeat_interval_ms == 0 || self.worker.poll_interval_ms == 0 {
            anyhow::bail!("worker 轮询与心跳周期必须大于 0");
        }
        if self.worker.heartbeat_timeout_ms <= self.worker.heartbeat_interval_ms {
            anyhow::bail!("worker.heartbeat_timeout_ms 必须大于 heartbeat_interval_ms");
        }
        if self.retry.default_max_retries < 0 {
            anyhow::bail!("retry.default_max_retries 不能为负数");
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            anyhow::bail!("retry.max_delay_ms 不能小于 base_delay_ms");
        }
        if self.monitoring.failure_detection_interval_ms == 0 {
            anyhow::bail!("monitoring.failure_detection_interval_ms 必须大于 0");
        }
        if self.api.enabled && self.api.bind_address.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("api.bind_address 不是合法的监听地址: {}", self.api.bind_address);
        }
        Ok(())
    }
}
