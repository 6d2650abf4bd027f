use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use taskforge_domain::{
    entities::TaskAttempt,
    errors::{SchedulerError, SchedulerResult},
    repositories::TaskAttemptRepository,
};

const ATTEMPT_COLUMNS: &str =
    "id, task_id, worker_id, started_at, completed_at, success, output, error_message, metadata";

pub struct SqliteTaskAttemptRepository {
    pool: SqlitePool,
}

impl SqliteTaskAttemptRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_attempt(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<TaskAttempt> {
        Ok(TaskAttempt {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            worker_id: row.try_get("worker_id")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            success: row.try_get("success")?,
            output: row.try_get("output")?,
            error_message: row.try_get("error_message")?,
            metadata: row.try_get("metadata")?,
        })
    }
}

#[async_trait]
impl TaskAttemptRepository for SqliteTaskAttemptRepository {
    async fn start(&self, task_id: i64, worker_id: &str) -> SchedulerResult<TaskAttempt> {
        let sql = format!(
            "INSERT INTO task_attempts (task_id, worker_id, started_at) \
             VALUES ($1, $2, $3) RETURNING {ATTEMPT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(task_id)
            .bind(worker_id)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        Self::row_to_attempt(&row)
    }

    async fn finish(
        &self,
        attempt_id: i64,
        success: bool,
        output: Option<&str>,
        error_message: Option<&str>,
        metadata: Option<&str>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE task_attempts \
             SET completed_at = $1, success = $2, output = $3, error_message = $4, metadata = $5 \
             WHERE id = $6",
        )
        .bind(now)
        .bind(success)
        .bind(output)
        .bind(error_message)
        .bind(metadata)
        .bind(attempt_id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_by_task(&self, task_id: i64) -> SchedulerResult<Vec<TaskAttempt>> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM task_attempts \
             WHERE task_id = $1 ORDER BY started_at DESC, id DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(task_id)
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_attempt).collect()
    }

    async fn find_running(&self) -> SchedulerResult<Vec<TaskAttempt>> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM task_attempts \
             WHERE completed_at IS NULL ORDER BY started_at ASC"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_attempt).collect()
    }

    async fn find_stuck(&self, cutoff: DateTime<Utc>) -> SchedulerResult<Vec<TaskAttempt>> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM task_attempts \
             WHERE completed_at IS NULL AND started_at < $1 ORDER BY started_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_attempt).collect()
    }

    async fn count_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SchedulerResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM task_attempts WHERE started_at >= $1 AND started_at <= $2",
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;
        Ok(row.try_get("cnt")?)
    }

    async fn count_successful_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SchedulerResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM task_attempts \
             WHERE started_at >= $1 AND started_at <= $2 AND success = $3",
        )
        .bind(start)
        .bind(end)
        .bind(true)
        .fetch_one(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;
        Ok(row.try_get("cnt")?)
    }

    async fn count_failed_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SchedulerResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM task_attempts \
             WHERE started_at >= $1 AND started_at <= $2 AND success = $3",
        )
        .bind(start)
        .bind(end)
        .bind(false)
        .fetch_one(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;
        Ok(row.try_get("cnt")?)
    }

    async fn average_duration_ms_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SchedulerResult<Option<f64>> {
        // SQLite 没有时间差类型，用 julianday 换算为毫秒
        let row = sqlx::query(
            "SELECT AVG((julianday(completed_at) - julianday(started_at)) * 86400000.0) AS avg_ms \
             FROM task_attempts \
             WHERE completed_at IS NOT NULL AND started_at >= $1 AND started_at <= $2",
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;
        Ok(row.try_get("avg_ms")?)
    }

    async fn count_all(&self) -> SchedulerResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM task_attempts")
            .fetch_one(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(row.try_get("cnt")?)
    }
}
