use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};

use crate::{
    error::CropcastResult,
    queue::{
        guard::SecurityGuard,
        task::{Task, TaskQueue, TaskType},
    },
};

// ================================================================================================
// Collaborators
// ================================================================================================

/// External model gateway used by AI_REASONING and CODE_GENERATION tasks.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn complete(&self, prompt: &str) -> CropcastResult<String>;
}

/// Email transport collaborator. The concrete transport lives outside this
/// crate; deployments inject an implementation.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> CropcastResult<()>;
}

/// A function invocable by SCRIPT tasks through its symbolic name. The
/// registry is assembled at init; there is no dynamic loading.
pub type ScriptFn = Arc<dyn Fn(&Value) -> Result<Value, HandlerError> + Send + Sync>;

/// How a handler failure should be treated by the retry machinery.
#[derive(Debug, Clone)]
pub enum HandlerError {
    Retryable(String),
    Fatal(String),
}

impl HandlerError {
    fn message(&self) -> &str {
        match self {
            Self::Retryable(m) | Self::Fatal(m) => m,
        }
    }
}

/// What a dispatch produced.
enum Dispatch {
    Completed(Value),
    /// The task parked itself in WAITING_FOR_HUMAN; nothing further to do.
    Parked,
}

// ================================================================================================
// Execution Records
// ================================================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionLog {
    pub task_id: i64,
    pub started: DateTime<Utc>,
    pub completed: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_seconds: f64,
    pub log_output: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutorStats {
    pub started_at: Option<DateTime<Utc>>,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_rejected: u64,
    pub last_error: Option<String>,
}

impl ExecutorStats {
    pub fn uptime_seconds(&self) -> f64 {
        self.started_at
            .map(|s| (Utc::now() - s).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0)
    }
}

// ================================================================================================
// Executor
// ================================================================================================

/// Single-worker task executor: pulls the next ready task, applies the
/// security guard, and dispatches on task type to a registered handler.
pub struct Executor {
    queue: Arc<TaskQueue>,
    guard: SecurityGuard,
    scripts: BTreeMap<String, ScriptFn>,
    gateway: Option<Arc<dyn ModelGateway>>,
    email: Option<Arc<dyn EmailTransport>>,
    stats: Mutex<ExecutorStats>,
    logs: Mutex<Vec<ExecutionLog>>,
    running: AtomicBool,
}

impl Executor {
    pub fn new(queue: Arc<TaskQueue>, guard: SecurityGuard) -> Self {
        Self {
            queue,
            guard,
            scripts: BTreeMap::new(),
            gateway: None,
            email: None,
            stats: Mutex::new(ExecutorStats::default()),
            logs: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Register a function invocable by SCRIPT tasks.
    pub fn register_script(&mut self, name: &str, f: ScriptFn) {
        self.scripts.insert(name.to_string(), f);
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn ModelGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_email(mut self, email: Arc<dyn EmailTransport>) -> Self {
        self.email = Some(email);
        self
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn execution_logs(&self) -> Vec<ExecutionLog> {
        self.logs.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Pull and execute one ready task. Returns `Ok(None)` when the queue has
    /// nothing ready.
    pub async fn run_once(&self) -> CropcastResult<Option<ExecutionLog>> {
        let Some(task) = self.queue.get_next_pending()? else {
            return Ok(None);
        };

        // Guard first: a rejected task fails non-retryably and never reaches
        // a handler.
        let decision = self
            .guard
            .check_task(&task.task_type.to_string(), &task.payload);
        if !decision.allowed {
            let reason = decision
                .reason
                .unwrap_or_else(|| "blocked by security guard".to_string());
            self.queue.start_task(task.id)?;
            self.queue
                .fail_task(task.id, &format!("security rejection: {reason}"), false)?;
            if let Ok(mut stats) = self.stats.lock() {
                stats.tasks_rejected += 1;
                stats.last_error = Some(reason.clone());
            }
            tracing::error!(task = task.id, "SECURITY ALERT: {reason}");
            return Ok(Some(self.push_log(task.id, Instant::now(), false, Some(reason))));
        }

        let started = Instant::now();
        let task = self.queue.start_task(task.id)?;
        tracing::info!(task = task.id, name = %task.name, "executing task");

        match self.dispatch(&task).await {
            Ok(Dispatch::Completed(result)) => {
                self.queue.complete_task(task.id, Some(result))?;
                if let Ok(mut stats) = self.stats.lock() {
                    stats.tasks_succeeded += 1;
                }
                Ok(Some(self.push_log(task.id, started, true, None)))
            }
            Ok(Dispatch::Parked) => {
                // WAITING_FOR_HUMAN transition already happened inside the
                // handler; the execution itself succeeded.
                if let Ok(mut stats) = self.stats.lock() {
                    stats.tasks_succeeded += 1;
                }
                Ok(Some(self.push_log(task.id, started, true, None)))
            }
            Err(error) => {
                let retry = matches!(error, HandlerError::Retryable(_));
                self.queue.fail_task(task.id, error.message(), retry)?;
                if let Ok(mut stats) = self.stats.lock() {
                    stats.tasks_failed += 1;
                    stats.last_error = Some(error.message().to_string());
                }
                Ok(Some(self.push_log(
                    task.id,
                    started,
                    false,
                    Some(error.message().to_string()),
                )))
            }
        }
    }

    /// The worker loop. Single worker by design; handlers may enqueue
    /// sub-tasks.
    pub async fn run_loop(self: Arc<Self>, poll_interval: Duration) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("executor already running");
            return;
        }
        if let Ok(mut stats) = self.stats.lock() {
            stats.started_at = Some(Utc::now());
        }
        tracing::info!("executor started");

        while self.running.load(Ordering::SeqCst) {
            match self.run_once().await {
                Ok(Some(_)) => {}
                Ok(None) => tokio::time::sleep(poll_interval).await,
                Err(e) => {
                    tracing::error!("executor iteration failed: {e}");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
        tracing::info!("executor stopped");
    }

    async fn dispatch(&self, task: &Task) -> Result<Dispatch, HandlerError> {
        match task.task_type {
            TaskType::Script | TaskType::DataCollection => {
                let name = task
                    .payload
                    .get("function")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        HandlerError::Fatal("script payload missing 'function'".to_string())
                    })?;
                // Allowlist payloads reference the call site textually; the
                // registry key is the bare function name.
                let key = name.split('(').next().unwrap_or(name).trim();
                let script = self.scripts.get(key).ok_or_else(|| {
                    HandlerError::Fatal(format!("no registered function '{key}'"))
                })?;
                let args = task.payload.get("args").cloned().unwrap_or(Value::Null);
                script(&args).map(Dispatch::Completed)
            }
            TaskType::AiReasoning => {
                let gateway = self.gateway.as_ref().ok_or_else(|| {
                    HandlerError::Fatal("no model gateway configured".to_string())
                })?;
                let prompt = task
                    .payload
                    .get("prompt")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        HandlerError::Fatal("reasoning payload missing 'prompt'".to_string())
                    })?;
                let completion = gateway
                    .complete(prompt)
                    .await
                    .map_err(|e| HandlerError::Retryable(e.to_string()))?;
                Ok(Dispatch::Completed(json!({"completion": completion})))
            }
            TaskType::CodeGeneration => {
                let gateway = self.gateway.as_ref().ok_or_else(|| {
                    HandlerError::Fatal("no model gateway configured".to_string())
                })?;
                let prompt = task
                    .payload
                    .get("prompt")
                    .and_then(Value::as_str)
                    .unwrap_or("generate the requested code");
                let code = gateway
                    .complete(prompt)
                    .await
                    .map_err(|e| HandlerError::Retryable(e.to_string()))?;
                // Generated code never runs unreviewed: park the task with
                // the code as the review request.
                self.queue
                    .request_human_input(task.id, &code)
                    .map_err(|e| HandlerError::Fatal(e.to_string()))?;
                Ok(Dispatch::Parked)
            }
            TaskType::Email => {
                let email = self.email.as_ref().ok_or_else(|| {
                    HandlerError::Fatal("no email transport configured".to_string())
                })?;
                let to = task.payload.get("to").and_then(Value::as_str).unwrap_or("");
                let subject = task
                    .payload
                    .get("subject")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let body = task
                    .payload
                    .get("body")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                email
                    .send(to, subject, body)
                    .await
                    .map_err(|e| HandlerError::Retryable(e.to_string()))?;
                Ok(Dispatch::Completed(json!({"sent": true})))
            }
            TaskType::HumanInput => {
                let request = task
                    .payload
                    .get("request")
                    .and_then(Value::as_str)
                    .unwrap_or("input required");
                self.queue
                    .request_human_input(task.id, request)
                    .map_err(|e| HandlerError::Fatal(e.to_string()))?;
                Ok(Dispatch::Parked)
            }
        }
    }

    fn push_log(
        &self,
        task_id: i64,
        started: Instant,
        success: bool,
        error: Option<String>,
    ) -> ExecutionLog {
        let duration = started.elapsed().as_secs_f64();
        let log = ExecutionLog {
            task_id,
            started: Utc::now() - chrono::Duration::milliseconds((duration * 1000.0) as i64),
            completed: Utc::now(),
            success,
            error: error.clone(),
            duration_seconds: duration,
            log_output: error.unwrap_or_default(),
        };
        if let Ok(mut logs) = self.logs.lock() {
            logs.push(log.clone());
        }
        log
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::SecurityPatterns,
        queue::task::{NewTask, TaskStatus},
    };

    use super::*;

    struct EchoGateway;

    #[async_trait]
    impl ModelGateway for EchoGateway {
        async fn complete(&self, prompt: &str) -> CropcastResult<String> {
            Ok(format!("echo: {prompt}"))
        }
    }

    fn executor() -> (Arc<TaskQueue>, Executor) {
        let queue = Arc::new(TaskQueue::in_memory());
        let guard = SecurityGuard::new(&SecurityPatterns::default());
        let mut executor = Executor::new(Arc::clone(&queue), guard);
        executor.register_script(
            "sum",
            Arc::new(|args: &Value| {
                let total: i64 = args
                    .as_array()
                    .map(|a| a.iter().filter_map(Value::as_i64).sum())
                    .unwrap_or(0);
                Ok(json!({"total": total}))
            }),
        );
        (queue, executor.with_gateway(Arc::new(EchoGateway)))
    }

    #[tokio::test]
    async fn script_task_runs_registered_function() {
        let (queue, executor) = executor();
        let task = queue
            .add_task(
                "sum numbers",
                TaskType::Script,
                json!({"function": "sum", "args": [1, 2, 3]}),
                NewTask::default(),
            )
            .unwrap();

        let log = executor.run_once().await.unwrap().unwrap();
        assert!(log.success);

        let done = queue.get(task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result.unwrap()["total"], 6);
        assert_eq!(executor.stats().tasks_succeeded, 1);
    }

    #[tokio::test]
    async fn blocked_payload_fails_without_retry() {
        let (queue, executor) = executor();
        let task = queue
            .add_task(
                "malicious",
                TaskType::Script,
                json!({"function": "sum", "args": ["rm -rf /"]}),
                NewTask::default(),
            )
            .unwrap();

        executor.run_once().await.unwrap().unwrap();
        let done = queue.get(task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.retry_count, 0);
        assert!(done.error.unwrap().contains("security rejection"));
        assert_eq!(executor.stats().tasks_rejected, 1);
    }

    #[tokio::test]
    async fn code_generation_parks_for_review() {
        let (queue, executor) = executor();
        let task = queue
            .add_task(
                "generate parser",
                TaskType::CodeGeneration,
                json!({"prompt": "write a parser"}),
                NewTask::default(),
            )
            .unwrap();

        executor.run_once().await.unwrap().unwrap();
        let parked = queue.get(task.id).unwrap();
        assert_eq!(parked.status, TaskStatus::WaitingForHuman);
        assert!(parked.human_input_request.unwrap().contains("write a parser"));
    }

    #[tokio::test]
    async fn unknown_function_is_fatal() {
        let (queue, executor) = executor();
        let task = queue
            .add_task(
                "missing",
                TaskType::Script,
                json!({"function": "does_not_exist"}),
                NewTask::default(),
            )
            .unwrap();

        executor.run_once().await.unwrap().unwrap();
        let done = queue.get(task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.retry_count, 0);
    }
}
