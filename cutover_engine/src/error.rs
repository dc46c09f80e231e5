//! Error types for the orchestration engine.

use crate::workflow::task::{TaskError, TaskId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Classification of engine errors.
///
/// Every [`WorkflowError`] maps onto exactly one kind so that callers can
/// branch on the category of a failure without matching every variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Malformed registration or options (duplicate id, missing dependency, cycle)
    Validation,
    /// Referenced group or task is absent
    NotFound,
    /// Duplicate group registration
    Conflict,
    /// Cancellation signal or deadline fired
    Timeout,
    /// A task's execute or undo reported failure
    Failed,
    /// Anything not classified above
    Unexpected,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Failed => "FAILED",
            ErrorKind::Unexpected => "UNEXPECTED",
        };
        f.write_str(name)
    }
}

/// Main error type for the engine.
#[derive(thiserror::Error, Debug)]
pub enum WorkflowError {
    /// A task with the same id is already registered
    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    /// A task references a dependency that is not registered
    #[error("Task {task} depends on unregistered task {dependency}")]
    MissingDependency { task: TaskId, dependency: TaskId },

    /// The dependency graph contains a cycle closed at this task
    #[error("Cycle detected in task graph at task {0}")]
    CycleDetected(TaskId),

    /// A task group is malformed
    #[error("Invalid task group {group}: {reason}")]
    InvalidGroup { group: String, reason: String },

    /// Orchestrator options failed schema validation
    #[error("Invalid orchestrator options: {0}")]
    InvalidOptions(String),

    /// A dependency in the run list had not been considered when its dependent came up
    #[error("Dependency {dependency} of task {task} was not reached before it")]
    DependencyNotReached { task: TaskId, dependency: TaskId },

    /// A group names an unregistered group in its `depends_on_groups`
    #[error("Group {group} depends on unregistered group {depends_on}")]
    GroupNotFound { group: String, depends_on: String },

    /// Referenced task is not registered
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// A group with this id was already registered
    #[error("Task group already registered: {0}")]
    DuplicateGroup(String),

    /// The external cancellation signal fired
    #[error("Workflow cancelled before task {next_task}")]
    Cancelled { next_task: TaskId },

    /// The run deadline expired
    #[error("Workflow exceeded timeout limit of {timeout:?} before task {next_task}")]
    TimedOut { timeout: Duration, next_task: TaskId },

    /// A task capability returned an error
    #[error("Task {task} failed: {source}")]
    TaskFailed {
        task: TaskId,
        #[source]
        source: TaskError,
    },

    /// A task capability panicked
    #[error("Task {task} panicked: {message}")]
    TaskPanicked { task: TaskId, message: String },

    /// YAML configuration could not be parsed
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON configuration could not be parsed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkflowError {
    /// Returns the taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::DuplicateTask(_)
            | WorkflowError::MissingDependency { .. }
            | WorkflowError::CycleDetected(_)
            | WorkflowError::InvalidGroup { .. }
            | WorkflowError::InvalidOptions(_)
            | WorkflowError::DependencyNotReached { .. }
            | WorkflowError::Yaml(_)
            | WorkflowError::Json(_) => ErrorKind::Validation,
            WorkflowError::GroupNotFound { .. } | WorkflowError::TaskNotFound(_) => {
                ErrorKind::NotFound
            }
            WorkflowError::DuplicateGroup(_) => ErrorKind::Conflict,
            WorkflowError::Cancelled { .. } | WorkflowError::TimedOut { .. } => ErrorKind::Timeout,
            WorkflowError::TaskFailed { .. } => ErrorKind::Failed,
            WorkflowError::TaskPanicked { .. } | WorkflowError::Io(_) => ErrorKind::Unexpected,
        }
    }

    /// Returns the task this error is attributed to, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            WorkflowError::DuplicateTask(task)
            | WorkflowError::CycleDetected(task)
            | WorkflowError::TaskNotFound(task)
            | WorkflowError::MissingDependency { task, .. }
            | WorkflowError::DependencyNotReached { task, .. }
            | WorkflowError::TaskFailed { task, .. }
            | WorkflowError::TaskPanicked { task, .. } => Some(task),
            _ => None,
        }
    }
}

/// Type alias for Result with WorkflowError.
pub type Result<T> = std::result::Result<T, WorkflowError>;
