//! Task registry owned by an orchestrator.
//!
//! Registration is the only mutating operation. Single tasks must be
//! registered after their dependencies; group batches may reference each
//! other freely and are cycle-checked as a whole before they are accepted.

use crate::error::WorkflowError;
use crate::workflow::graph::{self, OrderIter};
use crate::workflow::group::{self, GroupExpansion, GroupRecord, GroupRegistry, TaskGroup};
use crate::workflow::task::{Task, TaskId};
use indexmap::IndexMap;
use std::collections::HashSet;
use tracing::debug;

/// Ordered collection of registered tasks and groups.
#[derive(Clone, Debug, Default)]
pub struct TaskRegistry {
    tasks: IndexMap<TaskId, Task>,
    groups: GroupRegistry,
}

impl TaskRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a single task.
    ///
    /// # Errors
    ///
    /// - `WorkflowError::DuplicateTask` if the id is taken
    /// - `WorkflowError::MissingDependency` if a dependency is not registered yet
    pub fn register(&mut self, task: Task) -> Result<(), WorkflowError> {
        if self.tasks.contains_key(task.id()) {
            return Err(WorkflowError::DuplicateTask(task.id().clone()));
        }
        if let Some(dependency) = task
            .dependencies()
            .iter()
            .find(|dependency| !self.tasks.contains_key(*dependency))
        {
            return Err(WorkflowError::MissingDependency {
                task: task.id().clone(),
                dependency: dependency.clone(),
            });
        }

        debug!(task_id = %task.id(), "Registered task");
        self.tasks.insert(task.id().clone(), task);
        Ok(())
    }

    /// Expands and registers a group.
    ///
    /// Returns the expansion so callers can build further cross-references
    /// from its id map. Nothing is registered if any check fails.
    pub fn register_group(&mut self, group: TaskGroup) -> Result<GroupExpansion, WorkflowError> {
        if self.groups.contains(group.id()) {
            return Err(WorkflowError::DuplicateGroup(group.id().to_string()));
        }

        let expansion = group::expand(group, &self.groups)?;
        self.register_batch(expansion.tasks.iter().cloned())?;
        self.groups.record(&expansion);

        debug!(
            group_id = %expansion.group_id,
            tasks = expansion.tasks.len(),
            "Registered task group"
        );
        Ok(expansion)
    }

    /// Registers groups in order, stopping at the first error.
    ///
    /// Groups registered before the failing one stay registered.
    pub fn register_groups(
        &mut self,
        groups: impl IntoIterator<Item = TaskGroup>,
    ) -> Result<Vec<GroupExpansion>, WorkflowError> {
        groups
            .into_iter()
            .map(|group| self.register_group(group))
            .collect()
    }

    /// Registers tasks whose dependencies may point anywhere in the batch.
    fn register_batch(&mut self, batch: impl IntoIterator<Item = Task>) -> Result<(), WorkflowError> {
        let batch: Vec<Task> = batch.into_iter().collect();

        let mut batch_ids = HashSet::new();
        for task in &batch {
            if self.tasks.contains_key(task.id()) || !batch_ids.insert(task.id().clone()) {
                return Err(WorkflowError::DuplicateTask(task.id().clone()));
            }
        }
        for task in &batch {
            for dependency in task.dependencies() {
                if !self.tasks.contains_key(dependency) && !batch_ids.contains(dependency) {
                    return Err(WorkflowError::MissingDependency {
                        task: task.id().clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let previous_len = self.tasks.len();
        self.tasks
            .extend(batch.into_iter().map(|task| (task.id().clone(), task)));

        // Group edges can close cycles that per-task ordering never could
        if let Err(err) = self.execution_ids() {
            self.tasks.truncate(previous_len);
            return Err(err);
        }
        Ok(())
    }

    /// Returns all tasks in dependency order.
    ///
    /// # Errors
    ///
    /// `WorkflowError::CycleDetected` if the registered graph has a cycle.
    pub fn build_execution_order(&self) -> Result<Vec<Task>, WorkflowError> {
        self.iter_ordered().collect()
    }

    /// Lazily iterates tasks in dependency order.
    pub fn iter_ordered(&self) -> impl Iterator<Item = Result<Task, WorkflowError>> + '_ {
        self.order_iter().map(move |id| {
            let id = id?;
            self.tasks
                .get(&id)
                .cloned()
                .ok_or(WorkflowError::TaskNotFound(id))
        })
    }

    fn order_iter(&self) -> OrderIter<'_> {
        OrderIter::new(
            self.tasks
                .iter()
                .map(|(id, task)| (id, task.dependencies())),
        )
    }

    fn execution_ids(&self) -> Result<Vec<TaskId>, WorkflowError> {
        graph::execution_order(
            self.tasks
                .iter()
                .map(|(id, task)| (id, task.dependencies())),
        )
    }

    /// Returns a registered task.
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Returns true if the task is registered.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    /// Returns the number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Returns task ids in registration order.
    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.tasks.keys()
    }

    /// Returns the bookkeeping of a registered group.
    pub fn group_record(&self, group: &str) -> Option<&GroupRecord> {
        self.groups.get(group)
    }

    /// Returns the group registry.
    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::task::SkipDecision;

    fn noop(id: &str) -> Task {
        Task::from_fn(id, id, |ctx| async move { Ok(ctx) })
    }

    fn order_ids(registry: &TaskRegistry) -> Vec<String> {
        registry
            .build_execution_order()
            .unwrap()
            .iter()
            .map(|task| task.id().to_string())
            .collect()
    }

    #[test]
    fn test_register_and_order() {
        let mut registry = TaskRegistry::new();
        registry.register(noop("init")).unwrap();
        registry.register(noop("bump").depends_on("init")).unwrap();
        registry.register(noop("changelog").depends_on("bump")).unwrap();
        registry
            .register(noop("tag").depends_on("changelog").depends_on("bump"))
            .unwrap();

        assert_eq!(registry.len(), 4);
        assert_eq!(order_ids(&registry), vec!["init", "bump", "changelog", "tag"]);
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let mut registry = TaskRegistry::new();
        registry.register(noop("init")).unwrap();

        let err = registry.register(noop("init")).unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateTask(id) if id.as_str() == "init"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_dependency_must_be_registered_first() {
        let mut registry = TaskRegistry::new();

        let err = registry.register(noop("tag").depends_on("bump")).unwrap_err();
        assert!(matches!(err, WorkflowError::MissingDependency { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_group_with_cross_group_dependency() {
        let mut registry = TaskRegistry::new();
        registry.register(noop("init")).unwrap();
        registry
            .register_groups(vec![
                TaskGroup::new("version", "Version")
                    .task(noop("bump").depends_on("init"))
                    .task(noop("changelog").depends_on("bump")),
                TaskGroup::new("git", "Git")
                    .depends_on_group("version")
                    .task(noop("commit"))
                    .task(noop("tag").depends_on("commit")),
            ])
            .unwrap();

        assert_eq!(
            order_ids(&registry),
            vec![
                "init",
                "version:bump",
                "version:changelog",
                "git:commit",
                "git:tag"
            ]
        );
        assert_eq!(
            registry.group_record("git").unwrap().last_task_id,
            TaskId::new("git:tag")
        );
        assert_eq!(registry.groups().len(), 2);
    }

    #[test]
    fn test_duplicate_group_is_conflict() {
        let mut registry = TaskRegistry::new();
        registry
            .register_group(TaskGroup::new("git", "Git").task(noop("commit")))
            .unwrap();

        let err = registry
            .register_group(TaskGroup::new("git", "Git").task(noop("push")))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateGroup(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[test]
    fn test_group_cycle_is_rejected_and_rolled_back() {
        let mut registry = TaskRegistry::new();
        let group = TaskGroup::new("loop", "Loop")
            .task(noop("a").depends_on("b"))
            .task(noop("b").depends_on("a"));

        let err = registry.register_group(group).unwrap_err();
        assert!(matches!(err, WorkflowError::CycleDetected(_)));
        assert!(registry.is_empty());
        assert!(registry.group_record("loop").is_none());
    }

    #[test]
    fn test_group_with_unknown_external_dependency() {
        let mut registry = TaskRegistry::new();
        let err = registry
            .register_group(TaskGroup::new("git", "Git").task(noop("commit").depends_on("ghost")))
            .unwrap_err();

        assert!(matches!(
            err,
            WorkflowError::MissingDependency { dependency, .. } if dependency.as_str() == "ghost"
        ));
    }

    #[test]
    fn test_iter_ordered_matches_materialized_order() {
        let mut registry = TaskRegistry::new();
        registry.register(noop("a")).unwrap();
        registry.register(noop("b").depends_on("a")).unwrap();
        registry
            .register_group(
                TaskGroup::new("g", "G")
                    .skip_when(|_ctx| SkipDecision::run())
                    .task(noop("c").depends_on("b")),
            )
            .unwrap();

        let lazy: Vec<String> = registry
            .iter_ordered()
            .map(|task| task.unwrap().id().to_string())
            .collect();
        assert_eq!(lazy, order_ids(&registry));
        assert!(registry.contains(&TaskId::new("g:c")));
        assert!(registry.get(&TaskId::new("g:c")).unwrap().has_skip_condition());
        assert_eq!(registry.task_ids().count(), 3);
    }
}
