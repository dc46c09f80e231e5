//! Task abstraction and capability traits.
//!
//! A [`Task`] is the atomic unit of work. It always carries an
//! [`Executable`] and may carry a [`Skippable`] condition, an [`Undoable`]
//! compensation and [`RollbackHooks`]. Capabilities are trait objects, so any
//! struct implementing the subset it needs can be plugged in; closure
//! adapters cover the common case.

use crate::workflow::context::WorkflowContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Separator between a group id and a member task id.
pub const NAMESPACE_SEPARATOR: char = ':';

/// Unique identifier for a task.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a new TaskId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates the namespaced id `<group>:<task>`.
    pub fn namespaced(group: &str, task: &TaskId) -> Self {
        Self(format!("{}{}{}", group, NAMESPACE_SEPARATOR, task.0))
    }

    /// Returns true if the id already carries a group namespace.
    pub fn is_namespaced(&self) -> bool {
        self.0.contains(NAMESPACE_SEPARATOR)
    }

    /// Returns the underlying string identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the TaskId and returns the underlying string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&TaskId> for TaskId {
    fn from(id: &TaskId) -> Self {
        id.clone()
    }
}

/// Outcome of evaluating a skip condition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SkipDecision {
    /// Whether the task should be skipped
    pub should_skip: bool,
    /// Optional human-readable reason
    pub reason: Option<String>,
    /// Task ids to resume at; every task strictly before the first match is bypassed
    pub skip_to_tasks: Vec<TaskId>,
}

impl SkipDecision {
    /// Decision to run the task.
    pub fn run() -> Self {
        Self::default()
    }

    /// Decision to skip the task.
    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            should_skip: true,
            reason: Some(reason.into()),
            skip_to_tasks: Vec::new(),
        }
    }

    /// Decision to skip the task and resume at the first of `targets`.
    pub fn skip_to<I, T>(reason: impl Into<String>, targets: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        Self {
            should_skip: true,
            reason: Some(reason.into()),
            skip_to_tasks: targets.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the reason, or a generic one when none was given.
    pub fn reason_or_default(&self) -> &str {
        self.reason.as_deref().unwrap_or("skip condition met")
    }
}

/// Error types reported by task capabilities.
#[derive(thiserror::Error, Debug)]
pub enum TaskError {
    /// Task execution failed with a message
    #[error("Task execution failed: {0}")]
    ExecutionFailed(String),

    /// Undo or compensation failed
    #[error("Undo failed: {0}")]
    UndoFailed(String),

    /// Skip condition could not be evaluated
    #[error("Skip evaluation failed: {0}")]
    SkipEvaluationFailed(String),

    /// A required collaborator is not in the service bundle
    #[error("Service not available: {0}")]
    MissingService(&'static str),

    /// Stored context data could not be decoded
    #[error("Context data error: {0}")]
    Data(#[from] serde_json::Error),

    /// I/O error during task execution
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error wrapper
    #[error("Task error: {0}")]
    Other(#[from] anyhow::Error),
}

/// The required capability: performs the task's work.
#[async_trait]
pub trait Executable: Send + Sync {
    /// Runs the task against `context` and returns the context for the next task.
    async fn execute(&self, context: WorkflowContext) -> Result<WorkflowContext, TaskError>;
}

/// Optional capability: decides right before execution whether to skip.
#[async_trait]
pub trait Skippable: Send + Sync {
    /// Evaluates the skip condition against the current context.
    async fn should_skip(&self, context: &WorkflowContext) -> Result<SkipDecision, TaskError>;
}

/// Optional capability: reverts the side effects of a successful execution.
#[async_trait]
pub trait Undoable: Send + Sync {
    /// Undoes the task. Called at most once per attempt during rollback.
    async fn undo(&self, context: &WorkflowContext) -> Result<(), TaskError>;
}

/// Per-task hooks invoked around undo under the custom rollback strategy.
#[async_trait]
pub trait RollbackHooks: Send + Sync {
    /// Returns false to suppress the undo of this task.
    async fn before_rollback(&self, _task: &TaskId, _context: &WorkflowContext) -> bool {
        true
    }

    /// Called after a successful undo.
    async fn after_rollback(&self, _task: &TaskId, _context: &WorkflowContext) {}

    /// Returns true when the error is handled and the task counts as rolled back.
    async fn on_rollback_error(
        &self,
        _task: &TaskId,
        _error: &TaskError,
        _context: &WorkflowContext,
    ) -> bool {
        false
    }
}

struct FnExecutable<F>(F);

#[async_trait]
impl<F, Fut> Executable for FnExecutable<F>
where
    F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<WorkflowContext, TaskError>> + Send + 'static,
{
    async fn execute(&self, context: WorkflowContext) -> Result<WorkflowContext, TaskError> {
        (self.0)(context).await
    }
}

pub(crate) struct FnSkippable<F>(pub(crate) F);

#[async_trait]
impl<F> Skippable for FnSkippable<F>
where
    F: Fn(&WorkflowContext) -> SkipDecision + Send + Sync + 'static,
{
    async fn should_skip(&self, context: &WorkflowContext) -> Result<SkipDecision, TaskError> {
        Ok((self.0)(context))
    }
}

struct FnUndoable<F>(F);

#[async_trait]
impl<F, Fut> Undoable for FnUndoable<F>
where
    F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    async fn undo(&self, context: &WorkflowContext) -> Result<(), TaskError> {
        (self.0)(context.clone()).await
    }
}

/// Extracts the message of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

/// Where an expanded group task came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupProvenance {
    /// Id of the group the task was declared in
    pub group_id: String,
    /// Task id as declared inside the group, before namespacing
    pub original_task_id: TaskId,
}

/// The atomic unit of work.
///
/// Tasks are cheap to clone: every capability is shared behind an `Arc`.
///
/// # Example
///
/// ```ignore
/// let bump = Task::from_fn("bump", "Bump version", |ctx| async move {
///     Ok(ctx.fork("version", "1.2.0"))
/// })
/// .depends_on("init")
/// .with_undo_fn(|_ctx| async { Ok(()) });
/// ```
#[derive(Clone)]
pub struct Task {
    id: TaskId,
    description: String,
    dependencies: Vec<TaskId>,
    executor: Arc<dyn Executable>,
    skip: Option<Arc<dyn Skippable>>,
    undo: Option<Arc<dyn Undoable>>,
    hooks: Option<Arc<dyn RollbackHooks>>,
    non_undoable: bool,
    required_features: Vec<String>,
    provenance: Option<GroupProvenance>,
}

impl Task {
    /// Creates a task from any [`Executable`].
    pub fn new(
        id: impl Into<TaskId>,
        description: impl Into<String>,
        executor: impl Executable + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            dependencies: Vec::new(),
            executor: Arc::new(executor),
            skip: None,
            undo: None,
            hooks: None,
            non_undoable: false,
            required_features: Vec::new(),
            provenance: None,
        }
    }

    /// Creates a task from an async closure.
    pub fn from_fn<F, Fut>(id: impl Into<TaskId>, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<WorkflowContext, TaskError>> + Send + 'static,
    {
        Self::new(id, description, FnExecutable(f))
    }

    /// Adds a dependency. Duplicates are ignored, declaration order is kept.
    pub fn depends_on(mut self, dependency: impl Into<TaskId>) -> Self {
        let dependency = dependency.into();
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    /// Adds several dependencies.
    pub fn with_dependencies<I, T>(self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        dependencies
            .into_iter()
            .fold(self, |task, dep| task.depends_on(dep))
    }

    /// Sets the skip condition.
    pub fn with_skip(mut self, condition: impl Skippable + 'static) -> Self {
        self.skip = Some(Arc::new(condition));
        self
    }

    /// Sets a synchronous skip condition from a closure.
    pub fn skip_when<F>(self, condition: F) -> Self
    where
        F: Fn(&WorkflowContext) -> SkipDecision + Send + Sync + 'static,
    {
        self.with_skip(FnSkippable(condition))
    }

    /// Sets the undo capability.
    pub fn with_undo(mut self, undo: impl Undoable + 'static) -> Self {
        self.undo = Some(Arc::new(undo));
        self
    }

    /// Sets the undo capability from an async closure.
    pub fn with_undo_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.with_undo(FnUndoable(f))
    }

    /// Sets the hooks used by the custom rollback strategy.
    pub fn with_rollback_hooks(mut self, hooks: impl RollbackHooks + 'static) -> Self {
        self.hooks = Some(Arc::new(hooks));
        self
    }

    /// Marks the task as never to be rolled back, even if it has an undo.
    pub fn non_undoable(mut self) -> Self {
        self.non_undoable = true;
        self
    }

    /// Requires `feature` to be enabled for the task to take part in a run.
    pub fn requires_feature(mut self, feature: impl Into<String>) -> Self {
        let feature = feature.into();
        if !self.required_features.contains(&feature) {
            self.required_features.push(feature);
        }
        self
    }

    /// Returns the task id.
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Returns the human-readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the declared dependencies in declaration order.
    pub fn dependencies(&self) -> &[TaskId] {
        &self.dependencies
    }

    /// Returns the features this task requires.
    pub fn required_features(&self) -> &[String] {
        &self.required_features
    }

    /// Returns the group provenance of an expanded task.
    pub fn provenance(&self) -> Option<&GroupProvenance> {
        self.provenance.as_ref()
    }

    /// Returns true if a skip condition is set.
    pub fn has_skip_condition(&self) -> bool {
        self.skip.is_some()
    }

    /// Returns true if an undo capability is set.
    pub fn has_undo(&self) -> bool {
        self.undo.is_some()
    }

    /// Returns true if the task was marked non-undoable.
    pub fn is_non_undoable(&self) -> bool {
        self.non_undoable
    }

    pub(crate) fn skip_condition(&self) -> Option<&Arc<dyn Skippable>> {
        self.skip.as_ref()
    }

    pub(crate) fn rollback_hooks(&self) -> Option<&Arc<dyn RollbackHooks>> {
        self.hooks.as_ref()
    }

    pub(crate) async fn execute(&self, context: WorkflowContext) -> Result<WorkflowContext, TaskError> {
        self.executor.execute(context).await
    }

    /// Returns `None` when the task has no skip condition.
    pub(crate) async fn should_skip(
        &self,
        context: &WorkflowContext,
    ) -> Option<Result<SkipDecision, TaskError>> {
        match &self.skip {
            Some(condition) => Some(condition.should_skip(context).await),
            None => None,
        }
    }

    /// Returns `None` when the task has no undo capability.
    pub(crate) async fn undo(&self, context: &WorkflowContext) -> Option<Result<(), TaskError>> {
        match &self.undo {
            Some(undo) => Some(undo.undo(context).await),
            None => None,
        }
    }

    /// Rebinds the task into a group namespace.
    pub(crate) fn into_expanded(
        mut self,
        id: TaskId,
        dependencies: Vec<TaskId>,
        skip: Option<Arc<dyn Skippable>>,
        provenance: GroupProvenance,
    ) -> Self {
        self.id = id;
        self.dependencies = dependencies;
        self.skip = skip;
        self.provenance = Some(provenance);
        self
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("dependencies", &self.dependencies)
            .field("has_skip_condition", &self.skip.is_some())
            .field("has_undo", &self.undo.is_some())
            .field("non_undoable", &self.non_undoable)
            .field("required_features", &self.required_features)
            .field("provenance", &self.provenance)
            .finish()
    }
}
