//! 任务执行器
//!
//! 执行器声明自己处理的类型标签并消费任务载荷。
//! 载荷形态不合法属于不可恢复错误（`InvalidTaskParams`，跳过重试）；
//! 执行过程中的瞬时故障以 `ExecutionResult::failure` 返回，交给重试策略。

use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::process::Command;
use tracing::{info, warn};

use taskforge_domain::{
    entities::{ExecutionResult, Task},
    errors::{SchedulerError, SchedulerResult},
};

/// 执行器能力契约
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// 类型标签，注册与分发的依据
    fn name(&self) -> &str;

    fn handles(&self, task_type: &str) -> bool {
        self.name().eq_ignore_ascii_case(task_type)
    }

    async fn execute(&self, task: &Task) -> SchedulerResult<ExecutionResult>;
}

// ============================================================================
// Dummy 执行器
// ============================================================================

/// 睡眠并记录一条消息，用于演示和测试
pub struct DummyExecutor;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DummyTaskParams {
    sleep_duration_ms: Option<u64>,
    log_message: Option<String>,
}

#[async_trait]
impl TaskExecutor for DummyExecutor {
    fn name(&self) -> &str {
        "dummy"
    }

    async fn execute(&self, task: &Task) -> SchedulerResult<ExecutionResult> {
        let params: DummyTaskParams = serde_json::from_str(&task.payload).map_err(|e| {
            SchedulerError::InvalidTaskParams(format!("解析dummy任务载荷失败: {e}"))
        })?;

        let sleep_ms = params.sleep_duration_ms.unwrap_or(1000);
        let message = params
            .log_message
            .unwrap_or_else(|| "Dummy task executed".to_string());

        info!("dummy任务开始: {}", message);
        tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        info!("dummy任务完成: {}", message);

        let mut metadata = serde_json::Map::new();
        metadata.insert("sleepDurationMs".to_string(), json!(sleep_ms));
        metadata.insert("logMessage".to_string(), json!(message));

        Ok(ExecutionResult::success_with_metadata(
            Some(format!("dummy task slept {sleep_ms}ms: {message}")),
            metadata,
        ))
    }
}

// ============================================================================
// HTTP 执行器
// ============================================================================

/// 响应体入库的截断上限
const MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024;

pub struct HttpExecutor {
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpTaskParams {
    url: Option<String>,
    method: Option<String>,
    headers: Option<HashMap<String, String>>,
    body: Option<String>,
    timeout_seconds: Option<u64>,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskExecutor for HttpExecutor {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, task: &Task) -> SchedulerResult<ExecutionResult> {
        let params: HttpTaskParams = serde_json::from_str(&task.payload)
            .map_err(|e| SchedulerError::InvalidTaskParams(format!("解析http任务载荷失败: {e}")))?;

        let url = params
            .url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| SchedulerError::InvalidTaskParams("http任务缺少url".to_string()))?;
        let method = params.method.unwrap_or_else(|| "GET".to_string());
        let timeout = Duration::from_secs(params.timeout_seconds.unwrap_or(30));

        let mut request = match method.to_uppercase().as_str() {
            "GET" => self.client.get(&url),
            "POST" => self.client.post(&url),
            "PUT" => self.client.put(&url),
            "DELETE" => self.client.delete(&url),
            "PATCH" => self.client.patch(&url),
            "HEAD" => self.client.head(&url),
            other => {
                return Err(SchedulerError::InvalidTaskParams(format!(
                    "不支持的HTTP方法: {other}"
                )));
            }
        };

        request = request.timeout(timeout);
        for (key, value) in params.headers.unwrap_or_default() {
            request = request.header(&key, &value);
        }
        if let Some(body) = params.body {
            request = request.body(body);
        }

        info!("执行http任务 {}: {} {}", task.id, method, url);
        let started = Instant::now();

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                // 传输层故障按可恢复失败处理
                warn!("http任务 {} 请求失败: {}", task.id, e);
                return Ok(ExecutionResult::failure(format!("http request failed: {e}")));
            }
        };

        let status = response.status();
        let duration_ms = started.elapsed().as_millis() as u64;
        let mut body = response
            .text()
            .await
            .unwrap_or_else(|e| format!("failed to read response body: {e}"));
        if body.len() > MAX_RESPONSE_BODY_BYTES {
            body.truncate(MAX_RESPONSE_BODY_BYTES);
        }

        let mut metadata = serde_json::Map::new();
        metadata.insert("statusCode".to_string(), json!(status.as_u16()));
        metadata.insert("durationMs".to_string(), json!(duration_ms));
        metadata.insert("url".to_string(), json!(url));
        metadata.insert("method".to_string(), json!(method.to_uppercase()));

        if status.is_success() {
            Ok(ExecutionResult::success_with_metadata(Some(body), metadata))
        } else {
            let mut failure =
                ExecutionResult::failure(format!("http status {}", status.as_u16()));
            failure.output = Some(body);
            failure.metadata = metadata;
            Ok(failure)
        }
    }
}

// ============================================================================
// Shell 执行器
// ============================================================================

pub struct ShellExecutor;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShellTaskParams {
    command: Option<String>,
    args: Option<Vec<String>>,
    working_dir: Option<String>,
    timeout_seconds: Option<u64>,
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    fn name(&self) -> &str {
        "shell"
    }

    async fn execute(&self, task: &Task) -> SchedulerResult<ExecutionResult> {
        let params: ShellTaskParams = serde_json::from_str(&task.payload).map_err(|e| {
            SchedulerError::InvalidTaskParams(format!("解析shell任务载荷失败: {e}"))
        })?;

        let command = params
            .command
            .filter(|c| !c.is_empty())
            .ok_or_else(|| SchedulerError::InvalidTaskParams("shell任务缺少command".to_string()))?;
        let args = params.args.unwrap_or_default();
        let timeout = Duration::from_secs(params.timeout_seconds.unwrap_or(60));

        info!("执行shell任务 {}: {} {:?}", task.id, command, args);
        let started = Instant::now();

        let mut cmd = Command::new(&command);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &params.working_dir {
            cmd.current_dir(dir);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("shell任务 {} 启动命令失败: {}", task.id, e);
                return Ok(ExecutionResult::failure(format!(
                    "failed to spawn command: {e}"
                )));
            }
        };

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Ok(ExecutionResult::failure(format!(
                    "failed to wait for command: {e}"
                )));
            }
            Err(_) => {
                // kill_on_drop 负责回收子进程
                warn!("shell任务 {} 超时 ({}s)", task.id, timeout.as_secs());
                return Ok(ExecutionResult::failure(format!(
                    "command timed out after {}s",
                    timeout.as_secs()
                )));
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let exit_code = output.status.code();
        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();

        let mut metadata = serde_json::Map::new();
        metadata.insert("exitCode".to_string(), json!(exit_code));
        metadata.insert("durationMs".to_string(), json!(duration_ms));

        if output.status.success() {
            let out = if stdout.is_empty() { None } else { Some(stdout) };
            Ok(ExecutionResult::success_with_metadata(out, metadata))
        } else {
            let message = if stderr.is_empty() {
                format!("command exited with code {exit_code:?}")
            } else {
                stderr
            };
            let mut failure = ExecutionResult::failure(message);
            if !stdout.is_empty() {
                failure.output = Some(stdout);
            }
            failure.metadata = metadata;
            Ok(failure)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn task_with_payload(task_type: &str, payload: &str) -> Task {
        let mut task = Task::new(task_type, payload, Utc::now(), 3);
        task.id = 42;
        task
    }

    #[tokio::test]
    async fn dummy_executor_sleeps_and_reports_message() {
        let task = task_with_payload("dummy", r#"{"sleepDurationMs":10,"logMessage":"ok"}"#);
        let result = DummyExecutor.execute(&task).await.unwrap();

        assert!(result.success);
        assert!(result.output.as_deref().unwrap().contains("ok"));
        assert_eq!(result.metadata.get("sleepDurationMs"), Some(&json!(10)));
    }

    #[tokio::test]
    async fn dummy_executor_defaults_apply() {
        let task = task_with_payload("dummy", r#"{"sleepDurationMs":1}"#);
        let result = DummyExecutor.execute(&task).await.unwrap();
        assert!(result.success);
        assert!(result
            .output
            .as_deref()
            .unwrap()
            .contains("Dummy task executed"));
    }

    #[tokio::test]
    async fn dummy_executor_rejects_malformed_payload() {
        let task = task_with_payload("dummy", "not json");
        let err = DummyExecutor.execute(&task).await.unwrap_err();
        assert!(err.is_unrecoverable());
    }

    #[tokio::test]
    async fn http_executor_rejects_missing_url_and_bad_method() {
        let task = task_with_payload("http", r#"{"method":"GET"}"#);
        let err = HttpExecutor::new().execute(&task).await.unwrap_err();
        assert!(err.is_unrecoverable());

        let task = task_with_payload("http", r#"{"url":"http://localhost:1","method":"BREW"}"#);
        let err = HttpExecutor::new().execute(&task).await.unwrap_err();
        assert!(err.is_unrecoverable());
    }

    #[tokio::test]
    async fn http_transport_error_is_recoverable_failure() {
        // 无监听端口，连接必然失败
        let task = task_with_payload(
            "http",
            r#"{"url":"http://127.0.0.1:1","method":"GET","timeoutSeconds":1}"#,
        );
        let result = HttpExecutor::new().execute(&task).await.unwrap();
        assert!(!result.success);
        assert!(result.error_message.is_some());
    }

    #[tokio::test]
    async fn shell_executor_captures_stdout() {
        let task = task_with_payload("shell", r#"{"command":"echo","args":["hello"]}"#);
        let result = ShellExecutor.execute(&task).await.unwrap();

        assert!(result.success);
        assert_eq!(result.output.as_deref(), Some("hello"));
        assert_eq!(result.metadata.get("exitCode"), Some(&json!(0)));
    }

    #[tokio::test]
    async fn shell_executor_nonzero_exit_is_failure() {
        let task = task_with_payload("shell", r#"{"command":"sh","args":["-c","exit 3"]}"#);
        let result = ShellExecutor.execute(&task).await.unwrap();

        assert!(!result.success);
        assert!(result.error_message.is_some());
        assert_eq!(result.metadata.get("exitCode"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn shell_executor_times_out() {
        let task = task_with_payload(
            "shell",
            r#"{"command":"sleep","args":["5"],"timeoutSeconds":1}"#,
        );
        let result = ShellExecutor.execute(&task).await.unwrap();

        assert!(!result.success);
        assert!(result.error_message.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn shell_executor_rejects_empty_command() {
        let task = task_with_payload("shell", r#"{"command":""}"#);
        let err = ShellExecutor.execute(&task).await.unwrap_err();
        assert!(err.is_unrecoverable());
    }

    #[test]
    fn handles_is_case_insensitive() {
        assert!(DummyExecutor.handles("dummy"));
        assert!(DummyExecutor.handles("DUMMY"));
        assert!(!DummyExecutor.handles("shell"));
    }
}
