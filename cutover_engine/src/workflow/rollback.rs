//! Rollback manager for workflow failure recovery.
//!
//! The executor pushes a [`RollbackEntry`] for every task that finished
//! successfully and can be undone. When the run fails, the stack is walked
//! back-to-front under one of four strategies:
//!
//! - `Reverse`: invoke each task's own undo
//! - `Compensation`: prefer the compensation task bound to the entry, fall
//!   back to undo
//! - `Custom`: like `Reverse`, with the task's [`RollbackHooks`] around each undo
//! - `None`: do nothing
//!
//! Undo failures are collected rather than propagated. Each undo is retried
//! up to `max_retries` times; `continue_on_error` decides whether the walk
//! goes on after a task could not be undone.
//!
//! [`RollbackHooks`]: crate::workflow::task::RollbackHooks

use crate::audit::{AuditEvent, AuditLog};
use crate::workflow::context::WorkflowContext;
use crate::workflow::task::{panic_message, Task, TaskError, TaskId};
use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Strategy used to undo completed tasks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackStrategy {
    /// Undo tasks in reverse execution order
    #[default]
    Reverse,
    /// Prefer registered compensation tasks over undo
    Compensation,
    /// Reverse order with per-task rollback hooks
    Custom,
    /// Never roll back
    None,
}

impl fmt::Display for RollbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RollbackStrategy::Reverse => "reverse",
            RollbackStrategy::Compensation => "compensation",
            RollbackStrategy::Custom => "custom",
            RollbackStrategy::None => "none",
        };
        f.write_str(name)
    }
}

/// Rollback section of the orchestrator options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RollbackConfig {
    /// Strategy applied when a run fails
    pub strategy: RollbackStrategy,
    /// Extra attempts per undo after the first one fails
    pub max_retries: u32,
    /// Pause between undo attempts, in milliseconds
    pub retry_delay_ms: u64,
    /// Keep undoing the rest of the stack after a task could not be undone
    pub continue_on_error: bool,
}

impl RollbackConfig {
    /// Returns the pause between undo attempts.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            strategy: RollbackStrategy::Reverse,
            max_retries: 0,
            retry_delay_ms: 0,
            continue_on_error: true,
        }
    }
}

/// Compensation tasks bound to registered tasks.
///
/// A compensation is a separate task whose `execute` replaces the bound
/// task's own undo under [`RollbackStrategy::Compensation`].
#[derive(Clone, Default)]
pub struct CompensationRegistry {
    /// Bound task id to its compensation
    bindings: HashMap<TaskId, Arc<Task>>,
}

impl CompensationRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `compensation` to `task_id`, replacing any previous binding.
    ///
    /// Compensations are keyed by the task they undo, so two bindings may
    /// use compensation tasks with the same id.
    pub fn register(&mut self, task_id: TaskId, compensation: Task) {
        self.bindings.insert(task_id, Arc::new(compensation));
    }

    /// Returns the id of the compensation bound to `task_id`.
    pub fn compensation_id(&self, task_id: &TaskId) -> Option<&TaskId> {
        self.bindings.get(task_id).map(|compensation| compensation.id())
    }

    /// Returns the compensation bound to `task_id`.
    pub fn get(&self, task_id: &TaskId) -> Option<&Arc<Task>> {
        self.bindings.get(task_id)
    }

    /// Returns true if `task_id` has a compensation bound.
    pub fn has_compensation(&self, task_id: &TaskId) -> bool {
        self.bindings.contains_key(task_id)
    }

    /// Returns the number of bindings.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Returns true if nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Returns the ids of tasks with a bound compensation.
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.bindings.keys().cloned().collect()
    }
}

impl fmt::Debug for CompensationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bindings: HashMap<&TaskId, &TaskId> = self
            .bindings
            .iter()
            .map(|(task_id, compensation)| (task_id, compensation.id()))
            .collect();
        f.debug_struct("CompensationRegistry")
            .field("bindings", &bindings)
            .finish()
    }
}

/// A completed task waiting on the rollback stack.
#[derive(Clone, Debug)]
pub struct RollbackEntry {
    /// Id of the completed task
    pub task_id: TaskId,
    /// The completed task
    pub task: Arc<Task>,
    /// How long its execution took
    pub execution_time: Duration,
    /// Compensation bound when the entry was pushed
    pub compensation_id: Option<TaskId>,
}

/// A task that could not be undone.
#[derive(Debug)]
pub struct RollbackFailure {
    /// Task whose undo failed
    pub task_id: TaskId,
    /// Error of the last attempt
    pub error: TaskError,
    /// Number of attempts made
    pub attempts: u32,
}

/// Report from rollback execution.
#[derive(Debug)]
pub struct RollbackReport {
    /// True when no task was left in a failed state
    pub success: bool,
    /// Strategy that was applied
    pub strategy: RollbackStrategy,
    /// Tasks undone, in rollback order
    pub rolled_back_tasks: Vec<TaskId>,
    /// Tasks intentionally left alone (no undo, suppressed by a hook)
    pub skipped_tasks: Vec<TaskId>,
    /// Tasks whose undo failed
    pub failed_tasks: Vec<TaskId>,
    /// Tasks never attempted because the walk halted on an error
    pub pending_tasks: Vec<TaskId>,
    /// Error details for each failed task
    pub errors: Vec<RollbackFailure>,
    /// Total rollback time
    pub duration: Duration,
}

impl RollbackReport {
    fn new(strategy: RollbackStrategy) -> Self {
        Self {
            success: true,
            strategy,
            rolled_back_tasks: Vec::new(),
            skipped_tasks: Vec::new(),
            failed_tasks: Vec::new(),
            pending_tasks: Vec::new(),
            errors: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// Returns the total number of tasks processed.
    pub fn total_processed(&self) -> usize {
        self.rolled_back_tasks.len() + self.skipped_tasks.len() + self.failed_tasks.len()
    }
}

/// How one entry will be undone.
enum UndoAction {
    Undo(Arc<Task>),
    Compensate(Arc<Task>),
}

enum EntryOutcome {
    RolledBack { attempts: u32, compensation_id: Option<TaskId> },
    Skipped(String),
    Failed { error: TaskError, attempts: u32 },
}

/// Owner of the rollback stack of a single run.
pub struct RollbackManager {
    stack: Vec<RollbackEntry>,
    compensations: Arc<CompensationRegistry>,
    config: RollbackConfig,
}

impl RollbackManager {
    /// Creates a manager with an empty stack.
    pub fn new(config: RollbackConfig, compensations: Arc<CompensationRegistry>) -> Self {
        Self {
            stack: Vec::new(),
            compensations,
            config,
        }
    }

    /// Pushes a completed task if it can be undone.
    ///
    /// A task is undoable when it is not marked non-undoable and has either
    /// its own undo or a bound compensation. Returns whether it was pushed.
    pub fn push(&mut self, task: &Task, execution_time: Duration) -> bool {
        let compensation_id = self.compensations.compensation_id(task.id()).cloned();
        if task.is_non_undoable() || (!task.has_undo() && compensation_id.is_none()) {
            return false;
        }

        self.stack.push(RollbackEntry {
            task_id: task.id().clone(),
            task: Arc::new(task.clone()),
            execution_time,
            compensation_id,
        });
        true
    }

    /// Returns the stack, oldest entry first.
    pub fn entries(&self) -> &[RollbackEntry] {
        &self.stack
    }

    /// Returns the number of entries on the stack.
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    /// Returns true if nothing can be rolled back.
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Returns the retry and error policy.
    pub fn config(&self) -> &RollbackConfig {
        &self.config
    }

    /// Walks the stack back-to-front under `strategy`, draining it.
    ///
    /// `RollbackStrategy::None` leaves the stack untouched and returns an
    /// empty successful report.
    pub async fn execute_rollback(
        &mut self,
        strategy: RollbackStrategy,
        context: &WorkflowContext,
        audit_log: &mut AuditLog,
    ) -> RollbackReport {
        let started = Instant::now();
        let mut report = RollbackReport::new(strategy);

        if strategy == RollbackStrategy::None {
            info!(strategy = %strategy, "Rollback disabled by strategy");
            return report;
        }

        info!(
            strategy = %strategy,
            entries = self.stack.len(),
            "Starting rollback"
        );

        let mut entries = std::mem::take(&mut self.stack).into_iter().rev();
        for entry in entries.by_ref() {
            match self.rollback_entry(strategy, &entry, context).await {
                EntryOutcome::RolledBack {
                    attempts,
                    compensation_id,
                } => {
                    debug!(task_id = %entry.task_id, attempts, "Task rolled back");
                    audit_log
                        .record_or_warn(AuditEvent::TaskRolledBack {
                            timestamp: Utc::now(),
                            task_id: entry.task_id.to_string(),
                            compensation_id: compensation_id.map(TaskId::into_inner),
                            attempts,
                        })
                        .await;
                    report.rolled_back_tasks.push(entry.task_id);
                }
                EntryOutcome::Skipped(reason) => {
                    debug!(task_id = %entry.task_id, reason = %reason, "Rollback skipped task");
                    audit_log
                        .record_or_warn(AuditEvent::RollbackTaskSkipped {
                            timestamp: Utc::now(),
                            task_id: entry.task_id.to_string(),
                            reason,
                        })
                        .await;
                    report.skipped_tasks.push(entry.task_id);
                }
                EntryOutcome::Failed { error, attempts } => {
                    warn!(
                        task_id = %entry.task_id,
                        attempts,
                        error = %error,
                        "Rollback failed for task"
                    );
                    audit_log
                        .record_or_warn(AuditEvent::RollbackTaskFailed {
                            timestamp: Utc::now(),
                            task_id: entry.task_id.to_string(),
                            error: error.to_string(),
                            attempts,
                        })
                        .await;
                    report.failed_tasks.push(entry.task_id.clone());
                    report.errors.push(RollbackFailure {
                        task_id: entry.task_id,
                        error,
                        attempts,
                    });
                    if !self.config.continue_on_error {
                        break;
                    }
                }
            }
        }
        report.pending_tasks = entries.map(|entry| entry.task_id).collect();

        report.success = report.failed_tasks.is_empty() && report.pending_tasks.is_empty();
        report.duration = started.elapsed();

        audit_log
            .record_or_warn(AuditEvent::RollbackCompleted {
                timestamp: Utc::now(),
                strategy,
                success: report.success,
                rolled_back: report.rolled_back_tasks.len(),
                failed: report.failed_tasks.len(),
            })
            .await;

        info!(
            strategy = %strategy,
            success = report.success,
            rolled_back = report.rolled_back_tasks.len(),
            skipped = report.skipped_tasks.len(),
            failed = report.failed_tasks.len(),
            "Rollback finished"
        );
        report
    }

    async fn rollback_entry(
        &self,
        strategy: RollbackStrategy,
        entry: &RollbackEntry,
        context: &WorkflowContext,
    ) -> EntryOutcome {
        if entry.task.is_non_undoable() {
            return EntryOutcome::Skipped("task is non-undoable".to_string());
        }

        let action = match self.resolve_action(strategy, entry) {
            Some(action) => action,
            None => return EntryOutcome::Skipped("task has no undo".to_string()),
        };
        let compensation_id = match &action {
            UndoAction::Compensate(task) => Some(task.id().clone()),
            UndoAction::Undo(_) => None,
        };

        let hooks = match strategy {
            RollbackStrategy::Custom => entry.task.rollback_hooks().cloned(),
            _ => None,
        };

        if let Some(hooks) = &hooks {
            let before = hooks.before_rollback(&entry.task_id, context);
            match guard_hook("before_rollback", before).await {
                Ok(true) => {}
                Ok(false) => {
                    return EntryOutcome::Skipped("suppressed by before_rollback hook".to_string());
                }
                Err(error) => return EntryOutcome::Failed { error, attempts: 0 },
            }
        }

        match self.attempt_with_retries(&entry.task_id, &action, context).await {
            Ok(attempts) => {
                if let Some(hooks) = &hooks {
                    let after = hooks.after_rollback(&entry.task_id, context);
                    if let Err(error) = guard_hook("after_rollback", after).await {
                        return EntryOutcome::Failed { error, attempts };
                    }
                }
                EntryOutcome::RolledBack {
                    attempts,
                    compensation_id,
                }
            }
            Err((error, attempts)) => {
                if let Some(hooks) = &hooks {
                    let handler = hooks.on_rollback_error(&entry.task_id, &error, context);
                    match guard_hook("on_rollback_error", handler).await {
                        Ok(true) => {
                            debug!(task_id = %entry.task_id, error = %error, "Rollback error handled by hook");
                            return EntryOutcome::RolledBack {
                                attempts,
                                compensation_id,
                            };
                        }
                        Ok(false) => {}
                        Err(hook_error) => {
                            warn!(task_id = %entry.task_id, error = %hook_error, "Rollback error hook failed");
                        }
                    }
                }
                EntryOutcome::Failed { error, attempts }
            }
        }
    }

    fn resolve_action(&self, strategy: RollbackStrategy, entry: &RollbackEntry) -> Option<UndoAction> {
        if strategy == RollbackStrategy::Compensation {
            let compensation = entry
                .compensation_id
                .as_ref()
                .and_then(|_| self.compensations.get(&entry.task_id));
            if let Some(compensation) = compensation {
                return Some(UndoAction::Compensate(Arc::clone(compensation)));
            }
        }

        entry
            .task
            .has_undo()
            .then(|| UndoAction::Undo(Arc::clone(&entry.task)))
    }

    async fn attempt_with_retries(
        &self,
        task_id: &TaskId,
        action: &UndoAction,
        context: &WorkflowContext,
    ) -> Result<u32, (TaskError, u32)> {
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match invoke(action, context).await {
                Ok(()) => return Ok(attempt),
                Err(error) if attempt < max_attempts => {
                    warn!(
                        task_id = %task_id,
                        attempt,
                        max_attempts,
                        error = %error,
                        "Undo attempt failed, retrying"
                    );
                    let delay = self.config.retry_delay();
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(error) => return Err((error, attempt)),
            }
        }
    }
}

impl fmt::Debug for RollbackManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollbackManager")
            .field("stack", &self.stack)
            .field("config", &self.config)
            .finish()
    }
}

async fn invoke(action: &UndoAction, context: &WorkflowContext) -> Result<(), TaskError> {
    let attempt = async {
        match action {
            UndoAction::Undo(task) => task.undo(context).await.unwrap_or(Ok(())),
            UndoAction::Compensate(task) => task.execute(context.clone()).await.map(|_| ()),
        }
    };

    match AssertUnwindSafe(attempt).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(TaskError::UndoFailed(format!(
            "undo panicked: {}",
            panic_message(&*payload)
        ))),
    }
}

/// Awaits a rollback hook, turning a panic into an undo failure.
async fn guard_hook<F, T>(hook: &str, future: F) -> Result<T, TaskError>
where
    F: Future<Output = T>,
{
    AssertUnwindSafe(future).catch_unwind().await.map_err(|payload| {
        TaskError::UndoFailed(format!("{} hook panicked: {}", hook, panic_message(&*payload)))
    })
}
