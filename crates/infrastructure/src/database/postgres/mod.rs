mod postgres_attempt_repository;
mod postgres_task_repository;
mod postgres_worker_repository;

pub use postgres_attempt_repository::PostgresTaskAttemptRepository;
pub use postgres_task_repository::PostgresTaskRepository;
pub use postgres_worker_repository::PostgresWorkerRepository;
