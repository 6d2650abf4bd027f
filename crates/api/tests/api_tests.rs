//! HTTP 层集成测试：路由、校验、错误信封与关联 ID

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use tower::ServiceExt;

use taskforge_api::{create_router, AppState};
use taskforge_dispatcher::{MonitoringService, RecoveryService};
use taskforge_domain::{
    entities::{Task, TaskStatus},
    repositories::{TaskAttemptRepository, TaskRepository, WorkerRepository},
};
use taskforge_infrastructure::DatabaseManager;

async fn setup() -> (DatabaseManager, Router) {
    let db = DatabaseManager::connect("sqlite::memory:", 5, 1, Duration::from_secs(5))
        .await
        .unwrap();

    let monitoring = Arc::new(MonitoringService::new(
        db.task_repository(),
        db.attempt_repository(),
        db.worker_repository(),
        60_000,
    ));
    let recovery = Arc::new(RecoveryService::new(
        db.task_repository(),
        db.attempt_repository(),
        db.worker_repository(),
    ));

    let state = AppState {
        task_repo: db.task_repository(),
        attempt_repo: db.attempt_repository(),
        monitoring,
        recovery,
        supported_types: vec!["dummy".into(), "http".into(), "shell".into()],
        default_max_retries: 3,
    };
    let router = create_router(state);
    (db, router)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn create_task_returns_201_with_task_view() {
    let (_db, router) = setup().await;

    let response = router
        .oneshot(post_json(
            "/tasks",
            r#"{"type":"dummy","payload":"{\"sleepDurationMs\":10}","maxRetries":5}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert!(body["id"].as_i64().unwrap() > 0);
    assert_eq!(body["type"], "dummy");
    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["retryCount"], 0);
    assert_eq!(body["maxRetries"], 5);
    assert_eq!(body["version"], 0);
}

#[tokio::test]
async fn create_task_defaults_max_retries_from_config() {
    let (_db, router) = setup().await;

    let response = router
        .oneshot(post_json(
            "/tasks",
            r#"{"type":"dummy","payload":"{}"}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["maxRetries"], 3);
}

#[tokio::test]
async fn unknown_type_yields_validation_error_envelope() {
    let (_db, router) = setup().await;

    let response = router
        .oneshot(post_json("/tasks", r#"{"type":"ftp","payload":"{}"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    // 统一错误信封
    assert_eq!(body["error"], "VALIDATION_ERROR");
    assert_eq!(body["status"], 400);
    assert_eq!(body["path"], "/tasks");
    assert!(body["timestamp"].is_string());
    assert!(body["details"].is_array());
}

#[tokio::test]
async fn non_json_payload_is_rejected() {
    let (_db, router) = setup().await;

    let response = router
        .oneshot(post_json("/tasks", r#"{"type":"dummy","payload":"not json"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "INVALID_JSON");
}

#[tokio::test]
async fn out_of_range_max_retries_is_constraint_violation() {
    let (_db, router) = setup().await;

    let response = router
        .oneshot(post_json(
            "/tasks",
            r#"{"type":"dummy","payload":"{}","maxRetries":1000}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "CONSTRAINT_VIOLATION");
}

#[tokio::test]
async fn get_unknown_task_is_404() {
    let (_db, router) = setup().await;

    let response = router.oneshot(get("/tasks/9999")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"], "NOT_FOUND");
    assert_eq!(body["path"], "/tasks/9999");
}

#[tokio::test]
async fn get_task_includes_attempt_history() {
    let (db, router) = setup().await;
    let tasks = db.task_repository();
    let attempts = db.attempt_repository();
    let now = chrono::Utc::now();

    let task = tasks
        .create(&Task::new("dummy", "{}", now, 3))
        .await
        .unwrap();
    let attempt = attempts.start(task.id, "w-1").await.unwrap();
    attempts
        .finish(attempt.id, true, Some("done"), None, None, now)
        .await
        .unwrap();

    let response = router
        .oneshot(get(&format!("/tasks/{}", task.id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"].as_i64().unwrap(), task.id);
    assert_eq!(body["attempts"].as_array().unwrap().len(), 1);
    assert_eq!(body["attempts"][0]["success"], true);
}

#[tokio::test]
async fn list_tasks_paginates() {
    let (db, router) = setup().await;
    let tasks = db.task_repository();
    let now = chrono::Utc::now();

    for _ in 0..5 {
        tasks.create(&Task::new("dummy", "{}", now, 3)).await.unwrap();
    }

    let response = router
        .oneshot(get("/tasks?page=1&size=2"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["totalElements"], 5);
    assert_eq!(body["totalPages"], 3);
    assert_eq!(body["tasks"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn bad_status_filter_is_type_mismatch() {
    let (_db, router) = setup().await;

    let response = router.oneshot(get("/tasks?status=BOGUS")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "TYPE_MISMATCH");
}

#[tokio::test]
async fn cancel_only_works_for_pending_tasks() {
    let (db, router) = setup().await;
    let tasks = db.task_repository();
    let now = chrono::Utc::now();

    let pending = tasks
        .create(&Task::new("dummy", "{}", now, 3))
        .await
        .unwrap();
    let running = tasks
        .create(&Task::new("dummy", "{}", now, 3))
        .await
        .unwrap();
    tasks
        .claim(running.id, TaskStatus::Pending, TaskStatus::Running, "w-1", now)
        .await
        .unwrap();

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/tasks/{}", pending.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(tasks.get_by_id(pending.id).await.unwrap().is_none());

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/tasks/{}", running.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["error"], "CONFLICT");

    let response = router
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/tasks/424242")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_endpoint_reports_aggregate() {
    let (db, router) = setup().await;
    db.worker_repository()
        .upsert("host-w1", chrono::Utc::now(), None)
        .await
        .unwrap();

    let response = router.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "UP");
    assert_eq!(body["activeWorkers"], 1);
    assert!(body["uptimeSeconds"].as_i64().unwrap() >= 0);
    assert!(body["taskCounts"]["total"].is_i64());
    assert!(body["hourlyMetrics"]["total_executions"].is_i64());
}

#[tokio::test]
async fn metrics_window_is_bounded() {
    let (_db, router) = setup().await;

    let response = router
        .clone()
        .oneshot(get("/health/metrics?hours=200"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "ILLEGAL_ARGUMENT");

    let response = router.oneshot(get("/health/metrics?hours=24")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn recovery_endpoint_resets_running_tasks() {
    let (db, router) = setup().await;
    let tasks = db.task_repository();
    let now = chrono::Utc::now();

    let task = tasks
        .create(&Task::new("dummy", "{}", now, 3))
        .await
        .unwrap();
    tasks
        .claim(task.id, TaskStatus::Pending, TaskStatus::Running, "dead", now)
        .await
        .unwrap();

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/health/recovery")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["recovered_tasks"], 1);

    let row = tasks.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Pending);
}

#[tokio::test]
async fn consistency_flags_orphaned_running_tasks() {
    let (db, router) = setup().await;
    let tasks = db.task_repository();
    let now = chrono::Utc::now();

    let task = tasks
        .create(&Task::new("dummy", "{}", now, 3))
        .await
        .unwrap();
    tasks
        .claim(task.id, TaskStatus::Pending, TaskStatus::Running, "ghost", now)
        .await
        .unwrap();

    let response = router.oneshot(get("/health/consistency")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["consistent"], false);
    assert_eq!(
        body["orphanedRunningTasks"][0]["taskId"].as_i64().unwrap(),
        task.id
    );
}

#[tokio::test]
async fn probes_respond() {
    let (_db, router) = setup().await;

    let response = router.clone().oneshot(get("/health/live")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router.oneshot(get("/health/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn correlation_id_is_echoed_or_generated() {
    let (_db, router) = setup().await;

    // 带头则回显
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health/live")
                .header("x-correlation-id", "req-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        response.headers().get("x-correlation-id").unwrap(),
        "req-123"
    );

    // 不带头则生成
    let response = router.oneshot(get("/health/live")).await.unwrap();
    assert!(response.headers().contains_key("x-correlation-id"));
}
