use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use taskforge_domain::{
    entities::WorkerHeartbeat,
    errors::{SchedulerError, SchedulerResult},
    repositories::WorkerRepository,
};

const HEARTBEAT_COLUMNS: &str = "worker_id, last_heartbeat, metadata, registered_at, version";

pub struct SqliteWorkerRepository {
    pool: SqlitePool,
}

impl SqliteWorkerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_heartbeat(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<WorkerHeartbeat> {
        Ok(WorkerHeartbeat {
            worker_id: row.try_get("worker_id")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            metadata: row.try_get("metadata")?,
            registered_at: row.try_get("registered_at")?,
            version: row.try_get("version")?,
        })
    }
}

#[async_trait]
impl WorkerRepository for SqliteWorkerRepository {
    async fn upsert(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        metadata: Option<&str>,
    ) -> SchedulerResult<()> {
        sqlx::query(
            "INSERT INTO worker_heartbeats (worker_id, last_heartbeat, metadata, registered_at, version) \
             VALUES ($1, $2, $3, $2, 0) \
             ON CONFLICT(worker_id) DO UPDATE SET \
                 last_heartbeat = excluded.last_heartbeat, \
                 metadata = excluded.metadata, \
                 version = worker_heartbeats.version + 1",
        )
        .bind(worker_id)
        .bind(now)
        .bind(metadata)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        debug!("Worker {} 心跳注册/刷新", worker_id);
        Ok(())
    }

    async fn touch(&self, worker_id: &str, now: DateTime<Utc>) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE worker_heartbeats SET last_heartbeat = $1, version = version + 1 \
             WHERE worker_id = $2",
        )
        .bind(now)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected())
    }

    async fn get(&self, worker_id: &str) -> SchedulerResult<Option<WorkerHeartbeat>> {
        let sql = format!("SELECT {HEARTBEAT_COLUMNS} FROM worker_heartbeats WHERE worker_id = $1");
        let row = sqlx::query(&sql)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        match row {
            Some(row) => Ok(Some(Self::row_to_heartbeat(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_all(&self) -> SchedulerResult<Vec<WorkerHeartbeat>> {
        let sql = format!(
            "SELECT {HEARTBEAT_COLUMNS} FROM worker_heartbeats ORDER BY last_heartbeat DESC"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_heartbeat).collect()
    }

    async fn find_active(&self, cutoff: DateTime<Utc>) -> SchedulerResult<Vec<WorkerHeartbeat>> {
        let sql = format!(
            "SELECT {HEARTBEAT_COLUMNS} FROM worker_heartbeats \
             WHERE last_heartbeat >= $1 ORDER BY worker_id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_heartbeat).collect()
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>) -> SchedulerResult<Vec<WorkerHeartbeat>> {
        let sql = format!(
            "SELECT {HEARTBEAT_COLUMNS} FROM worker_heartbeats \
             WHERE last_heartbeat < $1 ORDER BY last_heartbeat ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_heartbeat).collect()
    }

    async fn count_active(&self, cutoff: DateTime<Utc>) -> SchedulerResult<i64> {
        let row =
            sqlx::query("SELECT COUNT(*) AS cnt FROM worker_heartbeats WHERE last_heartbeat >= $1")
                .bind(cutoff)
                .fetch_one(&self.pool)
                .await
                .map_err(SchedulerError::Database)?;
        Ok(row.try_get("cnt")?)
    }

    async fn cleanup_stale(&self, cutoff: DateTime<Utc>) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM worker_heartbeats WHERE last_heartbeat < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            debug!("清理 {} 条过期心跳记录", deleted);
        }
        Ok(deleted)
    }

    async fn delete_all(&self) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM worker_heartbeats")
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected())
    }

    async fn count_all(&self) -> SchedulerResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM worker_heartbeats")
            .fetch_one(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(row.try_get("cnt")?)
    }
}
