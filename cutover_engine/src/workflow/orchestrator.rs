//! Orchestrator facade.
//!
//! The [`TaskOrchestrator`] owns the task registry and the compensation
//! bindings of one workflow. It checks its options when it is built, checks
//! the static task graph again before every run, drops tasks whose features
//! are disabled and hands the rest to the [`SequentialExecutor`].

use crate::config::OrchestratorOptions;
use crate::error::WorkflowError;
use crate::workflow::context::WorkflowContext;
use crate::workflow::executor::{RunOptions, SequentialExecutor, WorkflowExecutionResult};
use crate::workflow::graph;
use crate::workflow::group::{GroupExpansion, TaskGroup};
use crate::workflow::registry::TaskRegistry;
use crate::workflow::rollback::CompensationRegistry;
use crate::workflow::task::{Task, TaskId};
use crate::workflow::validate::WorkflowValidator;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Entry point for registering and running a workflow.
///
/// # Example
///
/// ```ignore
/// let mut orchestrator = TaskOrchestrator::new(OrchestratorOptions::default())?;
/// orchestrator.register(init)?;
/// orchestrator.register(bump.depends_on("init"))?;
/// let result = orchestrator.run(WorkflowContext::default()).await?;
/// ```
#[derive(Debug)]
pub struct TaskOrchestrator {
    options: OrchestratorOptions,
    registry: TaskRegistry,
    compensations: CompensationRegistry,
}

impl TaskOrchestrator {
    /// Creates an orchestrator after validating `options`.
    pub fn new(options: OrchestratorOptions) -> Result<Self, WorkflowError> {
        options.validate()?;
        Ok(Self {
            options,
            registry: TaskRegistry::new(),
            compensations: CompensationRegistry::new(),
        })
    }

    /// Registers a task. Its dependencies must already be registered.
    pub fn register(&mut self, task: Task) -> Result<(), WorkflowError> {
        self.registry.register(task)
    }

    /// Expands and registers a task group.
    pub fn register_group(&mut self, group: TaskGroup) -> Result<GroupExpansion, WorkflowError> {
        self.registry.register_group(group)
    }

    /// Registers several groups in order.
    pub fn register_groups(
        &mut self,
        groups: impl IntoIterator<Item = TaskGroup>,
    ) -> Result<Vec<GroupExpansion>, WorkflowError> {
        self.registry.register_groups(groups)
    }

    /// Binds `compensation` to the registered task `task_id`.
    ///
    /// # Errors
    ///
    /// `WorkflowError::TaskNotFound` if `task_id` is not registered.
    pub fn register_compensation(
        &mut self,
        task_id: impl Into<TaskId>,
        compensation: Task,
    ) -> Result<(), WorkflowError> {
        let task_id = task_id.into();
        if !self.registry.contains(&task_id) {
            return Err(WorkflowError::TaskNotFound(task_id));
        }
        debug!(task_id = %task_id, compensation_id = %compensation.id(), "Registered compensation");
        self.compensations.register(task_id, compensation);
        Ok(())
    }

    /// Returns the task registry.
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Returns the compensation bindings.
    pub fn compensations(&self) -> &CompensationRegistry {
        &self.compensations
    }

    /// Returns the orchestrator options.
    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Runs every registered task with run options taken from the orchestrator options.
    pub async fn run(&self, context: WorkflowContext) -> Result<WorkflowExecutionResult, WorkflowError> {
        self.run_with(context, RunOptions::from(&self.options)).await
    }

    /// Runs every registered task with explicit run options.
    ///
    /// Without an explicit execution id the orchestrator's own is used.
    pub async fn run_with(
        &self,
        context: WorkflowContext,
        run_options: RunOptions,
    ) -> Result<WorkflowExecutionResult, WorkflowError> {
        let tasks = self.registry.build_execution_order()?;
        self.run_tasks(tasks, context, run_options).await
    }

    /// Runs an ad-hoc task list.
    ///
    /// The list is validated as a whole and put in dependency order first;
    /// registered tasks are not involved, compensations are.
    ///
    /// # Errors
    ///
    /// A `VALIDATION` error for duplicate ids, dangling dependencies or
    /// cycles. Failures during the run are reported in the result instead.
    pub async fn run_tasks(
        &self,
        tasks: Vec<Task>,
        context: WorkflowContext,
        run_options: RunOptions,
    ) -> Result<WorkflowExecutionResult, WorkflowError> {
        WorkflowValidator::new().validate(&tasks).into_result()?;
        let ordered = order_tasks(tasks)?;
        let runnable = self.filter_features(ordered);

        let mut run_options = run_options;
        if run_options.execution_id.is_none() {
            run_options.execution_id = Some(self.options.execution_id.clone());
        }
        let executor = self.executor(run_options);
        Ok(executor.execute(runnable, context).await)
    }

    fn executor(&self, run_options: RunOptions) -> SequentialExecutor {
        let executor = SequentialExecutor::new(run_options)
            .with_rollback_config(self.options.rollback.clone())
            .with_dependency_policy(self.options.dependency_policy)
            .with_compensations(Arc::new(self.compensations.clone()));
        match &self.options.audit_dir {
            Some(dir) => executor.with_audit_dir(dir),
            None => executor,
        }
    }

    fn filter_features(&self, tasks: Vec<Task>) -> Vec<Task> {
        tasks
            .into_iter()
            .filter(|task| {
                let enabled = self.options.features_enabled(task.required_features());
                if !enabled {
                    info!(
                        task_id = %task.id(),
                        features = ?task.required_features(),
                        "Dropping task with disabled features"
                    );
                }
                enabled
            })
            .collect()
    }
}

/// Sorts a validated task list into dependency order.
fn order_tasks(tasks: Vec<Task>) -> Result<Vec<Task>, WorkflowError> {
    let order = graph::execution_order(tasks.iter().map(|task| (task.id(), task.dependencies())))?;
    let mut by_id: HashMap<TaskId, Task> = tasks
        .into_iter()
        .map(|task| (task.id().clone(), task))
        .collect();

    order
        .into_iter()
        .map(|id| by_id.remove(&id).ok_or(WorkflowError::TaskNotFound(id)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::workflow::rollback::{RollbackConfig, RollbackStrategy};
    use crate::workflow::task::{SkipDecision, TaskError};
    use std::sync::Mutex;

    fn step(id: &str) -> Task {
        let key = id.to_string();
        Task::from_fn(id, id, move |ctx| {
            let key = key.clone();
            async move { Ok(ctx.fork(key, true)) }
        })
    }

    fn ids(ids: &[TaskId]) -> Vec<&str> {
        ids.iter().map(TaskId::as_str).collect()
    }

    fn options(execution_id: &str) -> OrchestratorOptions {
        OrchestratorOptions {
            execution_id: execution_id.into(),
            ..OrchestratorOptions::default()
        }
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let err = TaskOrchestrator::new(options("not valid")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_compensation_requires_registered_task() {
        let mut orchestrator = TaskOrchestrator::new(options("r1")).unwrap();
        let err = orchestrator
            .register_compensation("publish", step("unpublish"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        orchestrator.register(step("publish")).unwrap();
        orchestrator
            .register_compensation("publish", step("unpublish"))
            .unwrap();
        assert!(orchestrator.compensations().has_compensation(&TaskId::new("publish")));
    }

    #[tokio::test]
    async fn test_run_uses_registration_graph() {
        let mut orchestrator = TaskOrchestrator::new(options("release-1")).unwrap();
        orchestrator.register(step("init")).unwrap();
        orchestrator.register(step("bump").depends_on("init")).unwrap();
        orchestrator.register(step("tag").depends_on("bump")).unwrap();

        let result = orchestrator.run(WorkflowContext::default()).await.unwrap();

        assert!(result.success());
        assert_eq!(ids(result.executed_tasks()), vec!["init", "bump", "tag"]);
        assert_eq!(result.execution_id(), "release-1");
        assert_eq!(result.context().execution_id(), "release-1");
    }

    #[tokio::test]
    async fn test_run_tasks_orders_ad_hoc_list() {
        let orchestrator = TaskOrchestrator::new(options("r1")).unwrap();
        let tasks = vec![step("tag").depends_on("bump"), step("bump").depends_on("init"), step("init")];

        let result = orchestrator
            .run_tasks(tasks, WorkflowContext::default(), RunOptions::default())
            .await
            .unwrap();

        assert_eq!(ids(result.executed_tasks()), vec!["init", "bump", "tag"]);
    }

    #[tokio::test]
    async fn test_run_tasks_rejects_invalid_lists() {
        let orchestrator = TaskOrchestrator::new(options("r1")).unwrap();

        let cyclic = vec![step("a").depends_on("b"), step("b").depends_on("a")];
        let err = orchestrator
            .run_tasks(cyclic, WorkflowContext::default(), RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::CycleDetected(_)));

        let dangling = vec![step("a").depends_on("ghost")];
        let err = orchestrator
            .run_tasks(dangling, WorkflowContext::default(), RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::MissingDependency { .. }));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_disabled_features_are_dropped() {
        let mut opts = options("r1");
        opts.enabled_features = Some(vec!["git".into()]);
        let mut orchestrator = TaskOrchestrator::new(opts).unwrap();
        orchestrator.register(step("commit").requires_feature("git")).unwrap();
        orchestrator
            .register(step("release").requires_feature("github").depends_on("commit"))
            .unwrap();
        orchestrator.register(step("notify").depends_on("release")).unwrap();

        let result = orchestrator.run(WorkflowContext::default()).await.unwrap();

        assert!(result.success());
        assert_eq!(ids(result.executed_tasks()), vec!["commit", "notify"]);
        assert!(result.skipped_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_reaches_tasks() {
        let mut opts = options("r1");
        opts.dry_run = true;
        let mut orchestrator = TaskOrchestrator::new(opts).unwrap();
        orchestrator
            .register(Task::from_fn("push", "Push", |ctx| async move {
                let dry_run = ctx.is_dry_run();
                Ok(ctx.fork("pushed", !dry_run))
            }))
            .unwrap();

        let result = orchestrator.run(WorkflowContext::default()).await.unwrap();
        assert_eq!(result.context().get("pushed"), Some(&serde_json::json!(false)));
    }

    #[tokio::test]
    async fn test_compensation_strategy_uses_bound_tasks() {
        let log: Arc<Mutex<Vec<String>>> = Arc::default();
        let mut opts = options("r1");
        opts.rollback = RollbackConfig {
            strategy: RollbackStrategy::Compensation,
            ..RollbackConfig::default()
        };
        let mut orchestrator = TaskOrchestrator::new(opts).unwrap();
        orchestrator.register(step("publish")).unwrap();
        orchestrator
            .register(
                Task::from_fn("verify", "Verify", |_ctx| async {
                    Err(TaskError::ExecutionFailed("checksum mismatch".into()))
                })
                .depends_on("publish"),
            )
            .unwrap();

        let sink = Arc::clone(&log);
        orchestrator
            .register_compensation(
                "publish",
                Task::from_fn("unpublish", "Unpublish", move |ctx| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.lock().unwrap().push("unpublish".to_string());
                        Ok(ctx)
                    }
                }),
            )
            .unwrap();

        let result = orchestrator.run(WorkflowContext::default()).await.unwrap();

        assert!(!result.success());
        assert_eq!(result.failed_task(), Some(&TaskId::new("verify")));
        assert!(result.rollback_executed());
        assert_eq!(*log.lock().unwrap(), vec!["unpublish"]);
    }

    #[tokio::test]
    async fn test_group_members_run_in_namespace() {
        let mut orchestrator = TaskOrchestrator::new(options("r1")).unwrap();
        orchestrator.register(step("init")).unwrap();
        orchestrator
            .register_group(
                TaskGroup::new("git", "Git operations")
                    .task(step("commit").depends_on("init"))
                    .task(step("push").depends_on("commit")),
            )
            .unwrap();
        orchestrator
            .register_group(
                TaskGroup::new("docs", "Docs")
                    .skip_when(|_ctx| SkipDecision::skip("docs disabled"))
                    .task(step("build")),
            )
            .unwrap();

        let result = orchestrator.run(WorkflowContext::default()).await.unwrap();

        assert_eq!(ids(result.executed_tasks()), vec!["init", "git:commit", "git:push"]);
        assert_eq!(ids(result.skipped_tasks()), vec!["docs:build"]);
    }
}
