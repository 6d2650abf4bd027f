mod sqlite_attempt_repository;
mod sqlite_task_repository;
mod sqlite_worker_repository;

pub use sqlite_attempt_repository::SqliteTaskAttemptRepository;
pub use sqlite_task_repository::SqliteTaskRepository;
pub use sqlite_worker_repository::SqliteWorkerRepository;
