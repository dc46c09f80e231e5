//! Task groups and their expansion into namespaced tasks.
//!
//! A [`TaskGroup`] is an ordered bundle of tasks sharing a namespace, a
//! group-level skip condition and group-level dependencies. Registration
//! expands it exactly once:
//!
//! 1. every member id becomes `<group>:<task>`
//! 2. references to siblings are namespaced, namespaced references pass
//!    through as cross-group references, and any other reference is left
//!    as-is (it names an ungrouped task)
//! 3. the first member depends on the last member of every group named in
//!    `depends_on_groups`
//! 4. each member's skip condition is replaced by a merged condition in
//!    which the group condition short-circuits the member's own

use crate::error::WorkflowError;
use crate::workflow::context::WorkflowContext;
use crate::workflow::task::{
    FnSkippable, GroupProvenance, SkipDecision, Skippable, Task, TaskError, TaskId,
    NAMESPACE_SEPARATOR,
};
use async_trait::async_trait;
use indexmap::{IndexMap, IndexSet};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Named, ordered bundle of tasks.
///
/// # Example
///
/// ```ignore
/// let git = TaskGroup::new("git", "Commit, tag and push")
///     .depends_on_group("version")
///     .skip_when(|ctx| match ctx.config_value("/git/enabled") {
///         Some(serde_json::Value::Bool(false)) => SkipDecision::skip("git disabled"),
///         _ => SkipDecision::run(),
///     })
///     .task(commit)
///     .task(tag.depends_on("commit"));
/// ```
#[derive(Clone)]
pub struct TaskGroup {
    id: String,
    description: String,
    depends_on_groups: Vec<String>,
    skip: Option<Arc<dyn Skippable>>,
    tasks: Vec<Task>,
}

impl TaskGroup {
    /// Creates an empty group.
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            depends_on_groups: Vec::new(),
            skip: None,
            tasks: Vec::new(),
        }
    }

    /// Makes the first member depend on the last member of `group`.
    pub fn depends_on_group(mut self, group: impl Into<String>) -> Self {
        let group = group.into();
        if !self.depends_on_groups.contains(&group) {
            self.depends_on_groups.push(group);
        }
        self
    }

    /// Sets the group-level skip condition.
    pub fn with_skip(mut self, condition: impl Skippable + 'static) -> Self {
        self.skip = Some(Arc::new(condition));
        self
    }

    /// Sets a synchronous group-level skip condition.
    pub fn skip_when<F>(self, condition: F) -> Self
    where
        F: Fn(&WorkflowContext) -> SkipDecision + Send + Sync + 'static,
    {
        self.with_skip(FnSkippable(condition))
    }

    /// Appends a member task.
    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Appends several member tasks.
    pub fn with_tasks(mut self, tasks: impl IntoIterator<Item = Task>) -> Self {
        self.tasks.extend(tasks);
        self
    }

    /// Returns the group id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the groups this group depends on.
    pub fn depends_on_groups(&self) -> &[String] {
        &self.depends_on_groups
    }

    /// Returns the member tasks.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }
}

impl fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroup")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("depends_on_groups", &self.depends_on_groups)
            .field("has_skip_condition", &self.skip.is_some())
            .field("tasks", &self.tasks)
            .finish()
    }
}

/// Bookkeeping kept for a registered group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupRecord {
    /// Namespaced id of the last member
    pub last_task_id: TaskId,
    /// Namespaced ids of all members, in group order
    pub member_task_ids: Vec<TaskId>,
}

/// Registry of expanded groups, consulted for `depends_on_groups` lookups.
#[derive(Clone, Debug, Default)]
pub struct GroupRegistry {
    groups: IndexMap<String, GroupRecord>,
}

impl GroupRegistry {
    /// Creates an empty group registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record of a group.
    pub fn get(&self, group: &str) -> Option<&GroupRecord> {
        self.groups.get(group)
    }

    /// Returns true if the group was registered.
    pub fn contains(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    /// Returns registered group ids in registration order.
    pub fn group_ids(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Returns the number of registered groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Returns true if no group was registered.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub(crate) fn record(&mut self, expansion: &GroupExpansion) {
        let member_task_ids: Vec<TaskId> =
            expansion.tasks.iter().map(|task| task.id().clone()).collect();
        if let Some(last_task_id) = member_task_ids.last().cloned() {
            self.groups.insert(
                expansion.group_id.clone(),
                GroupRecord {
                    last_task_id,
                    member_task_ids,
                },
            );
        }
    }
}

/// Result of expanding a group.
#[derive(Clone, Debug)]
pub struct GroupExpansion {
    /// Id of the expanded group
    pub group_id: String,
    /// Namespaced tasks, in group order
    pub tasks: Vec<Task>,
    /// Original member id to namespaced id
    pub id_map: IndexMap<TaskId, TaskId>,
}

impl GroupExpansion {
    /// Returns the namespaced id of a member.
    pub fn namespaced_id(&self, original: &TaskId) -> Option<&TaskId> {
        self.id_map.get(original)
    }
}

/// Skip condition where the group condition short-circuits the member's own.
struct MergedSkip {
    group: Arc<dyn Skippable>,
    task: Option<Arc<dyn Skippable>>,
}

#[async_trait]
impl Skippable for MergedSkip {
    async fn should_skip(&self, context: &WorkflowContext) -> Result<SkipDecision, TaskError> {
        let group_decision = self.group.should_skip(context).await?;
        if group_decision.should_skip {
            return Ok(group_decision);
        }

        match &self.task {
            Some(task) => task.should_skip(context).await,
            None => Ok(SkipDecision::run()),
        }
    }
}

/// Expands `group` against the previously registered `groups`.
///
/// # Errors
///
/// - `WorkflowError::InvalidGroup` for an empty group, a malformed id, a
///   self-dependency or duplicate member ids
/// - `WorkflowError::GroupNotFound` when `depends_on_groups` names an
///   unregistered group
pub fn expand(group: TaskGroup, groups: &GroupRegistry) -> Result<GroupExpansion, WorkflowError> {
    let TaskGroup {
        id: group_id,
        depends_on_groups,
        skip: group_skip,
        tasks,
        ..
    } = group;

    let invalid = |reason: String| WorkflowError::InvalidGroup {
        group: group_id.clone(),
        reason,
    };

    if group_id.is_empty() || group_id.contains(NAMESPACE_SEPARATOR) {
        return Err(invalid(format!(
            "group id must be non-empty and must not contain '{}'",
            NAMESPACE_SEPARATOR
        )));
    }
    if tasks.is_empty() {
        return Err(invalid("group has no tasks".to_string()));
    }

    let mut siblings = HashSet::new();
    for task in &tasks {
        if task.id().is_namespaced() {
            return Err(invalid(format!(
                "member task id {} must not contain '{}'",
                task.id(),
                NAMESPACE_SEPARATOR
            )));
        }
        if !siblings.insert(task.id().clone()) {
            return Err(WorkflowError::DuplicateTask(TaskId::namespaced(
                &group_id,
                task.id(),
            )));
        }
    }

    let mut upstream = Vec::new();
    for depends_on in &depends_on_groups {
        if depends_on == &group_id {
            return Err(invalid("group cannot depend on itself".to_string()));
        }
        let record = groups
            .get(depends_on)
            .ok_or_else(|| WorkflowError::GroupNotFound {
                group: group_id.clone(),
                depends_on: depends_on.clone(),
            })?;
        upstream.push(record.last_task_id.clone());
    }

    let mut id_map = IndexMap::new();
    let mut expanded = Vec::with_capacity(tasks.len());

    for (index, task) in tasks.into_iter().enumerate() {
        let original_id = task.id().clone();
        let namespaced_id = TaskId::namespaced(&group_id, &original_id);

        let mut dependencies: IndexSet<TaskId> = IndexSet::new();
        if index == 0 {
            dependencies.extend(upstream.iter().cloned());
        }
        for dependency in task.dependencies() {
            let rewritten = if let Some(known) = id_map.get(dependency) {
                // Sibling already expanded
                TaskId::clone(known)
            } else if dependency.is_namespaced() {
                dependency.clone()
            } else if siblings.contains(dependency) {
                // Forward reference to a later sibling
                TaskId::namespaced(&group_id, dependency)
            } else {
                dependency.clone()
            };
            dependencies.insert(rewritten);
        }

        let skip = match &group_skip {
            Some(group_condition) => Some(Arc::new(MergedSkip {
                group: Arc::clone(group_condition),
                task: task.skip_condition().cloned(),
            }) as Arc<dyn Skippable>),
            None => task.skip_condition().cloned(),
        };

        let provenance = GroupProvenance {
            group_id: group_id.clone(),
            original_task_id: original_id.clone(),
        };

        id_map.insert(original_id, namespaced_id.clone());
        expanded.push(task.into_expanded(
            namespaced_id,
            dependencies.into_iter().collect(),
            skip,
            provenance,
        ));
    }

    Ok(GroupExpansion {
        group_id,
        tasks: expanded,
        id_map,
    })
}
