use std::sync::Arc;

use cropcast::{
    config::SecurityPatterns,
    queue::{
        Executor, SecurityGuard, TaskQueue, TaskStatus, TaskType,
        task::NewTask,
    },
};
use serde_json::{Value, json};

fn executor_with_scripts() -> (Arc<TaskQueue>, Arc<Executor>) {
    let queue = Arc::new(TaskQueue::in_memory());
    let guard = SecurityGuard::new(&SecurityPatterns::default());
    let mut executor = Executor::new(Arc::clone(&queue), guard);
    executor.register_script(
        "collect_period",
        Arc::new(|args: &Value| Ok(json!({"collected": args.clone()}))),
    );
    executor.register_script(
        "always_fails",
        Arc::new(|_args: &Value| {
            Err(cropcast::queue::HandlerError::Retryable("upstream flaked".into()))
        }),
    );
    (queue, Arc::new(executor))
}

/// A child task is dispatched only after its parent completes, even when the
/// child outranks it on priority.
#[tokio::test]
async fn parent_completes_before_child_is_dispatched() {
    let (queue, executor) = executor_with_scripts();

    let parent = queue
        .add_task(
            "collect August",
            TaskType::Script,
            json!({"function": "collect_period", "args": {"period": "2024-08"}}),
            NewTask::default(),
        )
        .unwrap();
    let child = queue
        .add_task(
            "summarize August",
            TaskType::Script,
            json!({"function": "collect_period", "args": {"period": "summary"}}),
            NewTask {
                priority: Some(1),
                parent_task_id: Some(parent.id),
                ..NewTask::default()
            },
        )
        .unwrap();

    // First pull must be the parent despite the child's priority.
    let first = executor.run_once().await.unwrap().unwrap();
    assert_eq!(first.task_id, parent.id);
    assert_eq!(queue.get(parent.id).unwrap().status, TaskStatus::Completed);

    let second = executor.run_once().await.unwrap().unwrap();
    assert_eq!(second.task_id, child.id);
    assert_eq!(queue.get(child.id).unwrap().status, TaskStatus::Completed);
}

/// A retryable failure cycles PENDING -> IN_PROGRESS -> PENDING until
/// `retry_count == max_retries`, then the task is FAILED for good.
#[tokio::test]
async fn retry_budget_governs_permanent_failure() {
    let (queue, executor) = executor_with_scripts();
    let task = queue
        .add_task(
            "flaky fetch",
            TaskType::Script,
            json!({"function": "always_fails"}),
            NewTask {
                max_retries: Some(2),
                ..NewTask::default()
            },
        )
        .unwrap();

    for _ in 0..2 {
        executor.run_once().await.unwrap().unwrap();
        assert_eq!(queue.get(task.id).unwrap().status, TaskStatus::Pending);
    }

    executor.run_once().await.unwrap().unwrap();
    let done = queue.get(task.id).unwrap();
    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.retry_count, done.max_retries);

    // Queue is drained.
    assert!(executor.run_once().await.unwrap().is_none());
    assert_eq!(executor.stats().tasks_failed, 3);
}

/// HUMAN_INPUT tasks park immediately and resume as PENDING once a response
/// arrives.
#[tokio::test]
async fn human_input_round_trip_through_executor() {
    let (queue, executor) = executor_with_scripts();
    let task = queue
        .add_task(
            "approve thresholds",
            TaskType::HumanInput,
            json!({"request": "approve the revised drought thresholds"}),
            NewTask::default(),
        )
        .unwrap();

    executor.run_once().await.unwrap().unwrap();
    let parked = queue.get(task.id).unwrap();
    assert_eq!(parked.status, TaskStatus::WaitingForHuman);
    assert!(
        parked
            .human_input_request
            .unwrap()
            .contains("drought thresholds")
    );

    queue.provide_human_input(task.id, "approved").unwrap();
    assert_eq!(queue.get(task.id).unwrap().status, TaskStatus::Pending);
}
