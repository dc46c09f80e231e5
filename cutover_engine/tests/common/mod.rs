//! Shared helpers for cutover-engine integration tests.

#![allow(dead_code)]

use cutover_engine::{OrchestratorOptions, Task, TaskError, TaskId, TaskOrchestrator};
use std::sync::{Arc, Mutex};

/// Shared log that undo closures append to.
pub type UndoLog = Arc<Mutex<Vec<String>>>;

/// Creates an orchestrator with a fixed execution id and default options.
pub fn test_orchestrator() -> TaskOrchestrator {
    orchestrator_with(|_| {})
}

/// Creates an orchestrator after letting `configure` adjust the options.
pub fn orchestrator_with(configure: impl FnOnce(&mut OrchestratorOptions)) -> TaskOrchestrator {
    let mut options = OrchestratorOptions {
        execution_id: "test-release".to_string(),
        ..OrchestratorOptions::default()
    };
    configure(&mut options);
    TaskOrchestrator::new(options).unwrap()
}

/// Creates a task that forks `<id> = true` into the context.
pub fn step(id: &str) -> Task {
    let key = id.to_string();
    Task::from_fn(id, format!("Step {}", id), move |ctx| {
        let key = key.clone();
        async move { Ok(ctx.fork(key, true)) }
    })
}

/// Creates a task that always fails with `message`.
pub fn failing_step(id: &str, message: &str) -> Task {
    let message = message.to_string();
    Task::from_fn(id, format!("Failing step {}", id), move |_ctx| {
        let message = message.clone();
        async move { Err(TaskError::ExecutionFailed(message)) }
    })
}

/// Adds an undo that appends the task id to `log`.
pub fn with_logged_undo(task: Task, log: &UndoLog) -> Task {
    let log = Arc::clone(log);
    let name = task.id().to_string();
    task.with_undo_fn(move |_ctx| {
        let log = Arc::clone(&log);
        let name = name.clone();
        async move {
            log.lock().unwrap().push(name);
            Ok(())
        }
    })
}

/// Returns a snapshot of the log.
pub fn entries(log: &UndoLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Converts task ids to strings for comparisons.
pub fn ids(ids: &[TaskId]) -> Vec<&str> {
    ids.iter().map(TaskId::as_str).collect()
}
