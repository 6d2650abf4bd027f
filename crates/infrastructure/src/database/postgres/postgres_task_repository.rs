use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use taskforge_domain::{
    entities::{Task, TaskFilter, TaskStatus},
    errors::{SchedulerError, SchedulerResult},
    repositories::TaskRepository,
};

const TASK_COLUMNS: &str = "id, task_type, payload, status, schedule_at, created_at, updated_at, \
     retry_count, max_retries, worker_id, assigned_at, completed_at, \
     execution_output, execution_metadata, version";

pub struct PostgresTaskRepository {
    pool: PgPool,
}

impl PostgresTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &sqlx::postgres::PgRow) -> SchedulerResult<Task> {
        Ok(Task {
            id: row.try_get("id")?,
            task_type: row.try_get("task_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            schedule_at: row.try_get("schedule_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            worker_id: row.try_get("worker_id")?,
            assigned_at: row.try_get("assigned_at")?,
            completed_at: row.try_get("completed_at")?,
            execution_output: row.try_get("execution_output")?,
            execution_metadata: row.try_get("execution_metadata")?,
            version: row.try_get("version")?,
        })
    }
}

#[async_trait]
impl TaskRepository for PostgresTaskRepository {
    #[instrument(skip(self, task), fields(task_type = %task.task_type))]
    async fn create(&self, task: &Task) -> SchedulerResult<Task> {
        let sql = format!(
            "INSERT INTO tasks (task_type, payload, status, schedule_at, created_at, updated_at, \
             retry_count, max_retries, version) \
             VALUES ($1, $2, $3, $4, $5, $6, 0, $7, 0) \
             RETURNING {TASK_COLUMNS}"
        );
        let now = Utc::now();
        let row = sqlx::query(&sql)
            .bind(&task.task_type)
            .bind(&task.payload)
            .bind(TaskStatus::Pending)
            .bind(task.schedule_at)
            .bind(now)
            .bind(now)
            .bind(task.max_retries)
            .fetch_one(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        let created = Self::row_to_task(&row)?;
        debug!("创建任务成功: ID {}, 类型 {}", created.id, created.task_type);
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        match row {
            Some(row) => Ok(Some(Self::row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_due(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status = $1 AND schedule_at <= $2 \
             ORDER BY schedule_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(TaskStatus::Pending)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_task).collect()
    }

    #[instrument(skip(self), fields(task_id = %id, worker_id = %worker_id))]
    async fn claim(
        &self,
        id: i64,
        from: TaskStatus,
        to: TaskStatus,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        // 状态 CAS：数据库行锁保证并发调度器中恰好一个成功
        let result = sqlx::query(
            "UPDATE tasks \
             SET status = $1, worker_id = $2, assigned_at = $3, updated_at = $4, \
                 version = version + 1 \
             WHERE id = $5 AND status = $6",
        )
        .bind(to)
        .bind(worker_id)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(from)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(task_id = %id, from = %from, to = %to))]
    async fn update_status(
        &self,
        id: i64,
        from: TaskStatus,
        to: TaskStatus,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = $1, updated_at = $2, version = version + 1 \
             WHERE id = $3 AND status = $4",
        )
        .bind(to)
        .bind(now)
        .bind(id)
        .bind(from)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, output, metadata), fields(task_id = %id, to = %to))]
    async fn complete(
        &self,
        id: i64,
        to: TaskStatus,
        completed_at: DateTime<Utc>,
        output: Option<&str>,
        metadata: Option<&str>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE tasks \
             SET status = $1, completed_at = $2, execution_output = $3, \
                 execution_metadata = $4, updated_at = $5, version = version + 1 \
             WHERE id = $6",
        )
        .bind(to)
        .bind(completed_at)
        .bind(output)
        .bind(metadata)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(task_id = %id))]
    async fn increment_retry_and_reschedule(
        &self,
        id: i64,
        new_schedule_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE tasks \
             SET retry_count = retry_count + 1, status = $1, schedule_at = $2, \
                 worker_id = NULL, assigned_at = NULL, updated_at = $3, \
                 version = version + 1 \
             WHERE id = $4",
        )
        .bind(TaskStatus::Pending)
        .bind(new_schedule_at)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(worker_id = %worker_id))]
    async fn reset_abandoned(
        &self,
        worker_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        now: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE tasks \
             SET status = $1, worker_id = NULL, assigned_at = NULL, updated_at = $2, \
                 version = version + 1 \
             WHERE worker_id = $3 AND status = $4",
        )
        .bind(to)
        .bind(now)
        .bind(worker_id)
        .bind(from)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        let affected = result.rows_affected();
        if affected > 0 {
            debug!("重置失联Worker {} 的 {} 个任务", worker_id, affected);
        }
        Ok(affected)
    }

    async fn count_by_status(&self, status: TaskStatus) -> SchedulerResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM tasks WHERE status = $1")
            .bind(status)
            .fetch_one(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(row.try_get("cnt")?)
    }

    async fn count_all(&self) -> SchedulerResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM tasks")
            .fetch_one(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(row.try_get("cnt")?)
    }

    async fn find_by_status(&self, status: TaskStatus) -> SchedulerResult<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = $1 ORDER BY schedule_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(status)
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn find_by_worker_and_status(
        &self,
        worker_id: &str,
        status: TaskStatus,
    ) -> SchedulerResult<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE worker_id = $1 AND status = $2 \
             ORDER BY assigned_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(worker_id)
            .bind(status)
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn find_exceeding_retry_limit(&self, status: TaskStatus) -> SchedulerResult<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE retry_count >= max_retries AND status = $1"
        );
        let rows = sqlx::query(&sql)
            .bind(status)
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<(Vec<Task>, i64)> {
        let limit = filter.page_size;
        let offset = filter.offset();

        let (rows, total_row) = match (filter.status, filter.task_type.as_deref()) {
            (Some(status), Some(task_type)) => {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = $1 AND task_type = $2 \
                     ORDER BY created_at DESC LIMIT $3 OFFSET $4"
                );
                let rows = sqlx::query(&sql)
                    .bind(status)
                    .bind(task_type)
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(SchedulerError::Database)?;
                let total = sqlx::query(
                    "SELECT COUNT(*) AS cnt FROM tasks WHERE status = $1 AND task_type = $2",
                )
                .bind(status)
                .bind(task_type)
                .fetch_one(&self.pool)
                .await
                .map_err(SchedulerError::Database)?;
                (rows, total)
            }
            (Some(status), None) => {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = $1 \
                     ORDER BY created_at DESC LIMIT $2 OFFSET $3"
                );
                let rows = sqlx::query(&sql)
                    .bind(status)
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(SchedulerError::Database)?;
                let total = sqlx::query("SELECT COUNT(*) AS cnt FROM tasks WHERE status = $1")
                    .bind(status)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(SchedulerError::Database)?;
                (rows, total)
            }
            (None, Some(task_type)) => {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE task_type = $1 \
                     ORDER BY created_at DESC LIMIT $2 OFFSET $3"
                );
                let rows = sqlx::query(&sql)
                    .bind(task_type)
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(SchedulerError::Database)?;
                let total = sqlx::query("SELECT COUNT(*) AS cnt FROM tasks WHERE task_type = $1")
                    .bind(task_type)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(SchedulerError::Database)?;
                (rows, total)
            }
            (None, None) => {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC LIMIT $1 OFFSET $2"
                );
                let rows = sqlx::query(&sql)
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(SchedulerError::Database)?;
                let total = sqlx::query("SELECT COUNT(*) AS cnt FROM tasks")
                    .fetch_one(&self.pool)
                    .await
                    .map_err(SchedulerError::Database)?;
                (rows, total)
            }
        };

        let tasks: SchedulerResult<Vec<Task>> = rows.iter().map(Self::row_to_task).collect();
        let total: i64 = total_row.try_get("cnt")?;
        Ok((tasks?, total))
    }

    #[instrument(skip(self), fields(task_id = %id))]
    async fn delete_if_pending(&self, id: i64) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1 AND status = $2")
            .bind(id)
            .bind(TaskStatus::Pending)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        Ok(result.rows_affected() == 1)
    }
}
