//! Taskforge 基础设施层
//!
//! 领域仓库接口的 sqlx 实现（PostgreSQL 与 SQLite 双后端）以及
//! 连接池管理和内嵌式数据库迁移。

pub mod database;

pub use database::manager::{DatabaseManager, DatabasePool, DatabaseType};
pub use database::postgres::{
    PostgresTaskAttemptRepository, PostgresTaskRepository, PostgresWorkerRepository,
};
pub use database::sqlite::{
    SqliteTaskAttemptRepository, SqliteTaskRepository, SqliteWorkerRepository,
};
