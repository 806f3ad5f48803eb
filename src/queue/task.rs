use std::{collections::BTreeMap, path::PathBuf, sync::Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString, IntoStaticStr};

use crate::error::{CropcastResult, IoError, QueueError};

// ================================================================================================
// Task Model
// ================================================================================================

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    WaitingForHuman,
    Cancelled,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Script,
    DataCollection,
    AiReasoning,
    CodeGeneration,
    Email,
    HumanInput,
}

/// One persistent unit of work.
///
/// Lifecycle: PENDING → IN_PROGRESS → {COMPLETED | FAILED | WAITING_FOR_HUMAN};
/// WAITING_FOR_HUMAN returns to PENDING on a human response; a retryable
/// failure returns to PENDING until `max_retries`, then FAILED permanently;
/// CANCELLED is terminal from PENDING.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// Lower number runs first.
    pub priority: i32,
    pub payload: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest-start gate.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// A task never starts before its parent completes.
    pub parent_task_id: Option<i64>,
    pub human_input_request: Option<String>,
    pub human_input_response: Option<String>,
}

/// Options accepted by `add_task`.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub priority: Option<i32>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub parent_task_id: Option<i64>,
    pub max_retries: Option<u32>,
}

// ================================================================================================
// Queue
// ================================================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueState {
    next_id: i64,
    tasks: BTreeMap<i64, Task>,
}

/// Persistent task queue. Operations are atomic behind one lock and flushed
/// to disk when a path is configured.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    path: Option<PathBuf>,
}

impl TaskQueue {
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(QueueState {
                next_id: 1,
                tasks: BTreeMap::new(),
            }),
            path: None,
        }
    }

    pub fn persistent(path: PathBuf) -> Self {
        let state = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or(QueueState {
                next_id: 1,
                tasks: BTreeMap::new(),
            });
        Self {
            state: Mutex::new(state),
            path: Some(path),
        }
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut QueueState) -> CropcastResult<T>,
    ) -> CropcastResult<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| IoError::FileSystem(e.to_string()))?;
        let out = f(&mut state)?;
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Ok(text) = serde_json::to_string_pretty(&*state) {
                let _ = std::fs::write(path, text);
            }
        }
        Ok(out)
    }

    pub fn add_task(
        &self,
        name: &str,
        task_type: TaskType,
        payload: Value,
        options: NewTask,
    ) -> CropcastResult<Task> {
        self.with_state(|state| {
            let id = state.next_id;
            state.next_id += 1;
            let task = Task {
                id,
                name: name.to_string(),
                task_type,
                status: TaskStatus::Pending,
                priority: options.priority.unwrap_or(10),
                payload,
                result: None,
                error: None,
                retry_count: 0,
                max_retries: options.max_retries.unwrap_or(3),
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                scheduled_for: options.scheduled_for,
                parent_task_id: options.parent_task_id,
                human_input_request: None,
                human_input_response: None,
            };
            state.tasks.insert(id, task.clone());
            tracing::info!(task = id, "created task: {name}");
            Ok(task)
        })
    }

    pub fn get(&self, id: i64) -> CropcastResult<Task> {
        self.with_state(|state| {
            state
                .tasks
                .get(&id)
                .cloned()
                .ok_or_else(|| QueueError::TaskNotFound(id).into())
        })
    }

    /// The next PENDING task ready to run: `scheduled_for` passed (or unset),
    /// parent COMPLETED (or none), ordered by `(priority, created_at)`.
    pub fn get_next_pending(&self) -> CropcastResult<Option<Task>> {
        self.with_state(|state| {
            let now = Utc::now();
            let mut candidates: Vec<&Task> = state
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Pending)
                .filter(|t| t.scheduled_for.is_none_or(|s| s <= now))
                .collect();
            candidates.sort_by_key(|t| (t.priority, t.created_at, t.id));

            for task in candidates {
                if let Some(parent_id) = task.parent_task_id {
                    let parent_done = state
                        .tasks
                        .get(&parent_id)
                        .is_some_and(|p| p.status == TaskStatus::Completed);
                    if !parent_done {
                        continue;
                    }
                }
                return Ok(Some(task.clone()));
            }
            Ok(None)
        })
    }

    pub fn pending_count(&self) -> usize {
        self.by_status(TaskStatus::Pending).len()
    }

    pub fn by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.state
            .lock()
            .map(|state| {
                state
                    .tasks
                    .values()
                    .filter(|t| t.status == status)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Task> {
        self.state
            .lock()
            .map(|state| state.tasks.values().cloned().collect())
            .unwrap_or_default()
    }

    fn transition<'a>(
        state: &'a mut QueueState,
        id: i64,
        expected: &[TaskStatus],
        next: TaskStatus,
    ) -> CropcastResult<&'a mut Task> {
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or(QueueError::TaskNotFound(id))?;
        if !expected.contains(&task.status) {
            return Err(QueueError::InvalidTransition {
                from: task.status.to_string(),
                to: next.to_string(),
            }
            .into());
        }
        task.status = next;
        Ok(task)
    }

    pub fn start_task(&self, id: i64) -> CropcastResult<Task> {
        self.with_state(|state| {
            // Parent gating is enforced at start time as well as selection
            // time, so out-of-band starts cannot jump the dependency.
            if let Some(parent_id) = state.tasks.get(&id).and_then(|t| t.parent_task_id) {
                let parent_done = state
                    .tasks
                    .get(&parent_id)
                    .is_some_and(|p| p.status == TaskStatus::Completed);
                if !parent_done {
                    return Err(QueueError::InvalidTransition {
                        from: TaskStatus::Pending.to_string(),
                        to: TaskStatus::InProgress.to_string(),
                    }
                    .into());
                }
            }
            let task =
                Self::transition(state, id, &[TaskStatus::Pending], TaskStatus::InProgress)?;
            task.started_at = Some(Utc::now());
            Ok(task.clone())
        })
    }

    pub fn complete_task(&self, id: i64, result: Option<Value>) -> CropcastResult<Task> {
        self.with_state(|state| {
            let task =
                Self::transition(state, id, &[TaskStatus::InProgress], TaskStatus::Completed)?;
            task.completed_at = Some(Utc::now());
            task.result = result;
            task.error = None;
            Ok(task.clone())
        })
    }

    /// Fail a task. With `retry = true` the task returns to PENDING until the
    /// retry budget is exhausted, then fails permanently.
    pub fn fail_task(&self, id: i64, error: &str, retry: bool) -> CropcastResult<Task> {
        self.with_state(|state| {
            let task = state
                .tasks
                .get_mut(&id)
                .ok_or(QueueError::TaskNotFound(id))?;
            if task.status != TaskStatus::InProgress {
                return Err(QueueError::InvalidTransition {
                    from: task.status.to_string(),
                    to: TaskStatus::Failed.to_string(),
                }
                .into());
            }
            task.error = Some(error.to_string());

            if retry && task.retry_count < task.max_retries {
                task.retry_count += 1;
                task.status = TaskStatus::Pending;
                task.started_at = None;
                tracing::warn!(
                    task = id,
                    retry = task.retry_count,
                    max = task.max_retries,
                    "task failed, returning to queue: {error}"
                );
            } else {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(Utc::now());
                tracing::error!(task = id, "task failed permanently: {error}");
            }
            Ok(task.clone())
        })
    }

    /// CANCELLED is terminal and reachable only from PENDING.
    pub fn cancel_task(&self, id: i64) -> CropcastResult<Task> {
        self.with_state(|state| {
            let task =
                Self::transition(state, id, &[TaskStatus::Pending], TaskStatus::Cancelled)?;
            task.completed_at = Some(Utc::now());
            Ok(task.clone())
        })
    }

    pub fn request_human_input(&self, id: i64, request: &str) -> CropcastResult<Task> {
        self.with_state(|state| {
            let task = Self::transition(
                state,
                id,
                &[TaskStatus::InProgress],
                TaskStatus::WaitingForHuman,
            )?;
            task.human_input_request = Some(request.to_string());
            Ok(task.clone())
        })
    }

    /// A human response returns the task to PENDING for re-dispatch.
    pub fn provide_human_input(&self, id: i64, response: &str) -> CropcastResult<Task> {
        self.with_state(|state| {
            let task = state
                .tasks
                .get_mut(&id)
                .ok_or(QueueError::TaskNotFound(id))?;
            if task.status != TaskStatus::WaitingForHuman {
                return Err(QueueError::NotWaiting(id).into());
            }
            task.status = TaskStatus::Pending;
            task.human_input_response = Some(response.to_string());
            task.started_at = None;
            Ok(task.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn queue() -> TaskQueue {
        TaskQueue::in_memory()
    }

    #[test]
    fn priority_then_fifo_ordering() {
        let q = queue();
        let low = q
            .add_task("low", TaskType::Script, json!({}), NewTask {
                priority: Some(20),
                ..NewTask::default()
            })
            .unwrap();
        let first_default = q
            .add_task("first", TaskType::Script, json!({}), NewTask::default())
            .unwrap();
        let second_default = q
            .add_task("second", TaskType::Script, json!({}), NewTask::default())
            .unwrap();

        assert_eq!(q.get_next_pending().unwrap().unwrap().id, first_default.id);
        q.start_task(first_default.id).unwrap();
        q.complete_task(first_default.id, None).unwrap();

        assert_eq!(q.get_next_pending().unwrap().unwrap().id, second_default.id);
        q.start_task(second_default.id).unwrap();
        q.complete_task(second_default.id, None).unwrap();

        assert_eq!(q.get_next_pending().unwrap().unwrap().id, low.id);
    }

    #[test]
    fn scheduled_for_gates_earliest_start() {
        let q = queue();
        q.add_task("later", TaskType::Script, json!({}), NewTask {
            scheduled_for: Some(Utc::now() + chrono::Duration::hours(1)),
            ..NewTask::default()
        })
        .unwrap();
        assert!(q.get_next_pending().unwrap().is_none());
    }

    #[test]
    fn child_waits_for_parent_completion() {
        let q = queue();
        let parent = q
            .add_task("parent", TaskType::Script, json!({}), NewTask::default())
            .unwrap();
        let child = q
            .add_task("child", TaskType::Script, json!({}), NewTask {
                priority: Some(1),
                parent_task_id: Some(parent.id),
                ..NewTask::default()
            })
            .unwrap();

        // The child has higher priority but is blocked on its parent.
        assert_eq!(q.get_next_pending().unwrap().unwrap().id, parent.id);
        assert!(q.start_task(child.id).is_err());

        q.start_task(parent.id).unwrap();
        q.complete_task(parent.id, None).unwrap();
        assert_eq!(q.get_next_pending().unwrap().unwrap().id, child.id);
        assert!(q.start_task(child.id).is_ok());
    }

    #[test]
    fn retry_until_exhausted_then_failed() {
        let q = queue();
        let task = q
            .add_task("flaky", TaskType::Script, json!({}), NewTask {
                max_retries: Some(2),
                ..NewTask::default()
            })
            .unwrap();

        for attempt in 1..=2u32 {
            q.start_task(task.id).unwrap();
            let failed = q.fail_task(task.id, "boom", true).unwrap();
            assert_eq!(failed.status, TaskStatus::Pending);
            assert_eq!(failed.retry_count, attempt);
        }

        q.start_task(task.id).unwrap();
        let failed = q.fail_task(task.id, "boom", true).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 2);
    }

    #[test]
    fn human_input_cycle() {
        let q = queue();
        let task = q
            .add_task("review", TaskType::CodeGeneration, json!({}), NewTask::default())
            .unwrap();
        q.start_task(task.id).unwrap();
        q.request_human_input(task.id, "please review the generated code")
            .unwrap();
        assert_eq!(q.get(task.id).unwrap().status, TaskStatus::WaitingForHuman);
        assert!(q.get_next_pending().unwrap().is_none());

        let resumed = q.provide_human_input(task.id, "approved").unwrap();
        assert_eq!(resumed.status, TaskStatus::Pending);
        assert_eq!(resumed.human_input_response.as_deref(), Some("approved"));
    }

    #[test]
    fn cancel_only_from_pending() {
        let q = queue();
        let task = q
            .add_task("x", TaskType::Script, json!({}), NewTask::default())
            .unwrap();
        q.cancel_task(task.id).unwrap();
        assert_eq!(q.get(task.id).unwrap().status, TaskStatus::Cancelled);

        let running = q
            .add_task("y", TaskType::Script, json!({}), NewTask::default())
            .unwrap();
        q.start_task(running.id).unwrap();
        assert!(q.cancel_task(running.id).is_err());
    }
}
