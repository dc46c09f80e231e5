//! Sequential execution strategy with audit logging and rollback.
//!
//! Tasks run one at a time, in the order given. Before each task the
//! executor checks the cancellation token and the run deadline; a task that
//! is already executing is never interrupted. Skip conditions are evaluated
//! right before execution and may jump forward to a named task. The first
//! failure halts the run and, when rollback is enabled, unwinds the rollback
//! stack. Every run produces exactly one [`WorkflowExecutionResult`].

use crate::audit::{AuditEvent, AuditLog};
use crate::config::{DependencyPolicy, OrchestratorOptions};
use crate::error::WorkflowError;
use crate::workflow::cancellation::CancellationToken;
use crate::workflow::context::WorkflowContext;
use crate::workflow::rollback::{
    CompensationRegistry, RollbackConfig, RollbackManager, RollbackReport, RollbackStrategy,
};
use crate::workflow::task::{panic_message, SkipDecision, Task, TaskId};
use crate::workflow::timeout::{Deadline, WorkflowTimeout};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-run options.
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Stamped on the context; when unset the context's own id is kept,
    /// or a fresh one is generated
    pub execution_id: Option<String>,
    /// Stamped on the context; tasks decide how to honour it
    pub dry_run: bool,
    /// Unwind completed tasks when the run fails
    pub enable_rollback: bool,
    /// External cancellation signal
    pub cancellation: Option<CancellationToken>,
    /// Run deadline
    pub timeout: Option<WorkflowTimeout>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            execution_id: None,
            dry_run: false,
            enable_rollback: true,
            cancellation: None,
            timeout: None,
        }
    }
}

impl RunOptions {
    /// Sets the execution id stamped on the context.
    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    /// Sets the dry-run flag.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Enables or disables rollback.
    pub fn with_rollback(mut self, enable_rollback: bool) -> Self {
        self.enable_rollback = enable_rollback;
        self
    }

    /// Sets the cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Sets the run deadline.
    pub fn with_timeout(mut self, timeout: impl Into<WorkflowTimeout>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }
}

impl From<&OrchestratorOptions> for RunOptions {
    fn from(options: &OrchestratorOptions) -> Self {
        Self {
            execution_id: Some(options.execution_id.clone()),
            dry_run: options.dry_run,
            enable_rollback: options.enable_rollback,
            cancellation: None,
            timeout: options.timeout_ms.map(WorkflowTimeout::from_millis),
        }
    }
}

/// Outcome of a single run.
#[derive(Debug)]
pub struct WorkflowExecutionResult {
    success: bool,
    execution_id: String,
    run_id: Uuid,
    executed_tasks: Vec<TaskId>,
    skipped_tasks: Vec<TaskId>,
    failed_task: Option<TaskId>,
    error: Option<WorkflowError>,
    rollback_executed: bool,
    rollback_report: Option<RollbackReport>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    execution_time_ms: u64,
    context: WorkflowContext,
    audit_events: Vec<AuditEvent>,
}

impl WorkflowExecutionResult {
    /// Returns true if every task executed or was skipped.
    pub fn success(&self) -> bool {
        self.success
    }

    /// Returns the execution id of the run.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Returns the audit run id.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the tasks that executed successfully, in execution order.
    pub fn executed_tasks(&self) -> &[TaskId] {
        &self.executed_tasks
    }

    /// Returns the tasks skipped by a condition or the dependency policy.
    pub fn skipped_tasks(&self) -> &[TaskId] {
        &self.skipped_tasks
    }

    /// Returns the task that failed.
    ///
    /// `None` on success and when the run stopped at a task boundary.
    pub fn failed_task(&self) -> Option<&TaskId> {
        self.failed_task.as_ref()
    }

    /// Returns the error that stopped the run.
    pub fn error(&self) -> Option<&WorkflowError> {
        self.error.as_ref()
    }

    /// Returns true if a rollback strategy other than `None` ran.
    pub fn rollback_executed(&self) -> bool {
        self.rollback_executed
    }

    /// Returns the rollback report when rollback was attempted.
    pub fn rollback_report(&self) -> Option<&RollbackReport> {
        self.rollback_report.as_ref()
    }

    /// Returns when the run started.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Returns when the run ended, rollback included.
    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    /// Returns the wall time of the run in milliseconds.
    pub fn execution_time_ms(&self) -> u64 {
        self.execution_time_ms
    }

    /// Returns the context produced by the last successful task.
    pub fn context(&self) -> &WorkflowContext {
        &self.context
    }

    /// Consumes the result and returns the final context.
    pub fn into_context(self) -> WorkflowContext {
        self.context
    }

    /// Returns the audit trail of the run.
    pub fn audit_events(&self) -> &[AuditEvent] {
        &self.audit_events
    }
}

/// Mutable bookkeeping of one run.
struct RunState {
    executed: Vec<TaskId>,
    skipped: Vec<TaskId>,
    /// Executed, skipped or bypassed
    reached: HashSet<TaskId>,
    succeeded: HashSet<TaskId>,
    audit_log: AuditLog,
}

impl RunState {
    async fn skip(&mut self, task_id: &TaskId, reason: &str) {
        info!(task_id = %task_id, reason = %reason, "Skipping task");
        self.audit_log
            .record_or_warn(AuditEvent::TaskSkipped {
                timestamp: Utc::now(),
                task_id: task_id.to_string(),
                reason: reason.to_string(),
            })
            .await;
        self.skipped.push(task_id.clone());
        self.reached.insert(task_id.clone());
    }

    async fn fail(&mut self, task_id: &TaskId, error: &WorkflowError) {
        warn!(task_id = %task_id, error = %error, "Task failed");
        self.audit_log
            .record_or_warn(AuditEvent::TaskFailed {
                timestamp: Utc::now(),
                task_id: task_id.to_string(),
                error: error.to_string(),
            })
            .await;
    }
}

/// What stopped a run.
struct Failure {
    task: Option<TaskId>,
    error: WorkflowError,
}

/// Runs an ordered task list one task at a time.
pub struct SequentialExecutor {
    options: RunOptions,
    rollback: RollbackConfig,
    dependency_policy: DependencyPolicy,
    compensations: Arc<CompensationRegistry>,
    audit_dir: Option<PathBuf>,
}

impl SequentialExecutor {
    /// Creates an executor with default rollback settings.
    pub fn new(options: RunOptions) -> Self {
        Self {
            options,
            rollback: RollbackConfig::default(),
            dependency_policy: DependencyPolicy::default(),
            compensations: Arc::new(CompensationRegistry::new()),
            audit_dir: None,
        }
    }

    /// Sets the rollback strategy and retry policy.
    pub fn with_rollback_config(mut self, config: RollbackConfig) -> Self {
        self.rollback = config;
        self
    }

    /// Sets the treatment of skipped dependencies.
    pub fn with_dependency_policy(mut self, policy: DependencyPolicy) -> Self {
        self.dependency_policy = policy;
        self
    }

    /// Sets the compensation tasks used by the compensation strategy.
    pub fn with_compensations(mut self, compensations: Arc<CompensationRegistry>) -> Self {
        self.compensations = compensations;
        self
    }

    /// Persists the audit trail under `dir`.
    pub fn with_audit_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.audit_dir = Some(dir.into());
        self
    }

    /// Returns the per-run options.
    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Runs `tasks` in the given order.
    ///
    /// Dependencies are expected to precede their dependents; ids that do
    /// not appear in `tasks` are ignored.
    pub async fn execute(&self, tasks: Vec<Task>, context: WorkflowContext) -> WorkflowExecutionResult {
        let start_time = Utc::now();
        let started = Instant::now();
        let deadline = self.options.timeout.map(WorkflowTimeout::start);
        let execution_id = match &self.options.execution_id {
            Some(execution_id) => execution_id.clone(),
            None if !context.execution_id().is_empty() => context.execution_id().to_string(),
            None => Uuid::new_v4().to_string(),
        };
        let context = context.for_run(&execution_id, self.options.dry_run);

        let mut state = RunState {
            executed: Vec::new(),
            skipped: Vec::new(),
            reached: HashSet::new(),
            succeeded: HashSet::new(),
            audit_log: match &self.audit_dir {
                Some(dir) => AuditLog::with_dir(dir),
                None => AuditLog::new(),
            },
        };
        let mut rollback = RollbackManager::new(self.rollback.clone(), Arc::clone(&self.compensations));

        info!(
            execution_id = %execution_id,
            run_id = %state.audit_log.run_id(),
            tasks = tasks.len(),
            dry_run = context.is_dry_run(),
            "Starting workflow run"
        );
        state
            .audit_log
            .record_or_warn(AuditEvent::RunStarted {
                timestamp: start_time,
                execution_id: execution_id.clone(),
                task_count: tasks.len(),
                dry_run: context.is_dry_run(),
            })
            .await;

        let (context, failure) = self
            .run_tasks(&tasks, context, deadline, &mut state, &mut rollback)
            .await;

        let mut result = WorkflowExecutionResult {
            success: failure.is_none(),
            execution_id,
            run_id: state.audit_log.run_id(),
            executed_tasks: Vec::new(),
            skipped_tasks: Vec::new(),
            failed_task: None,
            error: None,
            rollback_executed: false,
            rollback_report: None,
            start_time,
            end_time: start_time,
            execution_time_ms: 0,
            context,
            audit_events: Vec::new(),
        };

        if let Some(Failure { task, error }) = failure {
            if self.options.enable_rollback {
                let strategy = self.rollback.strategy;
                let report = rollback
                    .execute_rollback(strategy, &result.context, &mut state.audit_log)
                    .await;
                result.rollback_executed = strategy != RollbackStrategy::None;
                result.rollback_report = Some(report);
            } else {
                info!(entries = rollback.len(), "Rollback disabled, leaving completed tasks in place");
            }
            result.failed_task = task;
            result.error = Some(error);
        }

        result.executed_tasks = state.executed;
        result.skipped_tasks = state.skipped;
        result.end_time = Utc::now();
        result.execution_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        info!(
            execution_id = %result.execution_id,
            success = result.success,
            executed = result.executed_tasks.len(),
            skipped = result.skipped_tasks.len(),
            rollback_executed = result.rollback_executed,
            execution_time_ms = result.execution_time_ms,
            "Workflow run finished"
        );
        state
            .audit_log
            .record_or_warn(AuditEvent::RunCompleted {
                timestamp: result.end_time,
                execution_id: result.execution_id.clone(),
                success: result.success,
                executed: result.executed_tasks.len(),
                skipped: result.skipped_tasks.len(),
            })
            .await;
        result.audit_events = state.audit_log.into_events();
        result
    }

    /// Walks the task list; returns the last good context and what stopped the run.
    async fn run_tasks(
        &self,
        tasks: &[Task],
        mut context: WorkflowContext,
        deadline: Option<Deadline>,
        state: &mut RunState,
        rollback: &mut RollbackManager,
    ) -> (WorkflowContext, Option<Failure>) {
        let run_ids: HashSet<&TaskId> = tasks.iter().map(Task::id).collect();
        let mut cursor = 0;

        while let Some(task) = tasks.get(cursor) {
            let task_id = task.id();

            if let Some(error) = self.interruption(deadline.as_ref(), task_id) {
                warn!(next_task = %task_id, error = %error, "Workflow run interrupted");
                state
                    .audit_log
                    .record_or_warn(AuditEvent::RunCancelled {
                        timestamp: Utc::now(),
                        next_task: task_id.to_string(),
                        reason: error.to_string(),
                    })
                    .await;
                return (context, Some(Failure { task: None, error }));
            }

            match self.blocking_dependency(task, &run_ids, &state.reached, &state.succeeded) {
                Ok(None) => {}
                Ok(Some(dependency)) => {
                    let reason = format!("dependency {} did not execute", dependency);
                    state.skip(task_id, &reason).await;
                    cursor += 1;
                    continue;
                }
                Err(error) => {
                    state.fail(task_id, &error).await;
                    return (context, Some(Failure { task: None, error }));
                }
            }

            let decision = match guarded(task_id, task.should_skip(&context)).await {
                Ok(Some(Ok(decision))) => decision,
                Ok(None) => SkipDecision::run(),
                Ok(Some(Err(source))) => {
                    let error = WorkflowError::TaskFailed {
                        task: task_id.clone(),
                        source,
                    };
                    state.fail(task_id, &error).await;
                    return (context, Some(Failure { task: Some(task_id.clone()), error }));
                }
                Err(error) => {
                    state.fail(task_id, &error).await;
                    return (context, Some(Failure { task: Some(task_id.clone()), error }));
                }
            };

            if decision.should_skip {
                state.skip(task_id, decision.reason_or_default()).await;
                cursor = self.jump_target(tasks, cursor, &decision, state).await;
                continue;
            }

            debug!(task_id = %task_id, description = %task.description(), "Executing task");
            state
                .audit_log
                .record_or_warn(AuditEvent::TaskStarted {
                    timestamp: Utc::now(),
                    task_id: task_id.to_string(),
                })
                .await;

            let task_started = Instant::now();
            let outcome = guarded(task_id, task.execute(context.clone())).await;
            let elapsed = task_started.elapsed();

            match outcome {
                Ok(Ok(next)) => {
                    context = next;
                    let undoable = rollback.push(task, elapsed);
                    let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                    debug!(
                        task_id = %task_id,
                        duration_ms,
                        undoable,
                        "Task completed"
                    );
                    state
                        .audit_log
                        .record_or_warn(AuditEvent::TaskCompleted {
                            timestamp: Utc::now(),
                            task_id: task_id.to_string(),
                            duration_ms,
                        })
                        .await;
                    state.executed.push(task_id.clone());
                    state.reached.insert(task_id.clone());
                    state.succeeded.insert(task_id.clone());
                    cursor += 1;
                }
                Ok(Err(source)) => {
                    let error = WorkflowError::TaskFailed {
                        task: task_id.clone(),
                        source,
                    };
                    state.fail(task_id, &error).await;
                    return (context, Some(Failure { task: Some(task_id.clone()), error }));
                }
                Err(error) => {
                    state.fail(task_id, &error).await;
                    return (context, Some(Failure { task: Some(task_id.clone()), error }));
                }
            }
        }

        (context, None)
    }

    fn interruption(&self, deadline: Option<&Deadline>, next_task: &TaskId) -> Option<WorkflowError> {
        if self
            .options
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return Some(WorkflowError::Cancelled {
                next_task: next_task.clone(),
            });
        }

        deadline
            .filter(|deadline| deadline.is_expired())
            .map(|deadline| WorkflowError::TimedOut {
                timeout: deadline.timeout(),
                next_task: next_task.clone(),
            })
    }

    /// Returns the first dependency that keeps `task` from running.
    fn blocking_dependency<'a>(
        &self,
        task: &'a Task,
        run_ids: &HashSet<&TaskId>,
        reached: &HashSet<TaskId>,
        succeeded: &HashSet<TaskId>,
    ) -> Result<Option<&'a TaskId>, WorkflowError> {
        for dependency in task.dependencies() {
            if !run_ids.contains(dependency) {
                continue;
            }
            if !reached.contains(dependency) {
                return Err(WorkflowError::DependencyNotReached {
                    task: task.id().clone(),
                    dependency: dependency.clone(),
                });
            }
            // Reached but not executed means skipped or bypassed
            if self.dependency_policy == DependencyPolicy::SkippedBlocks && !succeeded.contains(dependency) {
                return Ok(Some(dependency));
            }
        }
        Ok(None)
    }

    /// Returns the cursor after a skip, following a skip-to jump if one matches.
    async fn jump_target(
        &self,
        tasks: &[Task],
        cursor: usize,
        decision: &SkipDecision,
        state: &mut RunState,
    ) -> usize {
        let next = cursor + 1;
        if decision.skip_to_tasks.is_empty() {
            return next;
        }

        let Some(offset) = tasks[next..]
            .iter()
            .position(|task| decision.skip_to_tasks.contains(task.id()))
        else {
            debug!(
                task_id = %tasks[cursor].id(),
                targets = ?decision.skip_to_tasks,
                "No skip target ahead, continuing with next task"
            );
            return next;
        };

        let target = next + offset;
        let bypassed: Vec<TaskId> = tasks[next..target]
            .iter()
            .map(|task| task.id().clone())
            .collect();

        info!(
            from_task = %tasks[cursor].id(),
            resume_at = %tasks[target].id(),
            bypassed = bypassed.len(),
            "Jumping to skip target"
        );
        if !bypassed.is_empty() {
            state
                .audit_log
                .record_or_warn(AuditEvent::TasksBypassed {
                    timestamp: Utc::now(),
                    from_task: tasks[cursor].id().to_string(),
                    resume_at: tasks[target].id().to_string(),
                    bypassed: bypassed.iter().map(TaskId::to_string).collect(),
                })
                .await;
        }
        state.reached.extend(bypassed);
        target
    }
}

/// Awaits a task capability, turning a panic into `TaskPanicked`.
async fn guarded<F, T>(task_id: &TaskId, future: F) -> Result<T, WorkflowError>
where
    F: Future<Output = T>,
{
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|payload| WorkflowError::TaskPanicked {
            task: task_id.clone(),
            message: panic_message(&*payload),
        })
}
