//! Static validation of a task list before execution.
//!
//! Independent of the ordering traversal in [`graph`](super::graph): the
//! task list is loaded into a petgraph `DiGraph` and checked for duplicate
//! ids, dangling dependency edges and strongly connected components. Every
//! problem found is reported, not only the first.

use crate::error::WorkflowError;
use crate::workflow::task::{Task, TaskId};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// Validation report for a task list.
#[derive(Clone, Debug, Default)]
pub struct ValidationReport {
    duplicate_ids: Vec<TaskId>,
    missing_dependencies: Vec<(TaskId, TaskId)>,
    cycles: Vec<Vec<TaskId>>,
}

impl ValidationReport {
    /// Returns whether no problem was found.
    pub fn is_valid(&self) -> bool {
        self.duplicate_ids.is_empty() && self.missing_dependencies.is_empty() && self.cycles.is_empty()
    }

    /// Returns ids declared more than once.
    pub fn duplicate_ids(&self) -> &[TaskId] {
        &self.duplicate_ids
    }

    /// Returns `(task, dependency)` pairs whose dependency is not in the list.
    pub fn missing_dependencies(&self) -> &[(TaskId, TaskId)] {
        &self.missing_dependencies
    }

    /// Returns the cycles found, each in input order.
    pub fn cycles(&self) -> &[Vec<TaskId>] {
        &self.cycles
    }

    /// Converts the first problem into an error.
    pub fn into_result(self) -> Result<(), WorkflowError> {
        if let Some(id) = self.duplicate_ids.into_iter().next() {
            return Err(WorkflowError::DuplicateTask(id));
        }
        if let Some((task, dependency)) = self.missing_dependencies.into_iter().next() {
            return Err(WorkflowError::MissingDependency { task, dependency });
        }
        if let Some(id) = self.cycles.into_iter().next().and_then(|cycle| cycle.into_iter().next()) {
            return Err(WorkflowError::CycleDetected(id));
        }
        Ok(())
    }
}

/// Validator for task lists.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkflowValidator;

impl WorkflowValidator {
    /// Creates a validator.
    pub fn new() -> Self {
        Self
    }

    /// Checks `tasks` and reports every problem found.
    pub fn validate(&self, tasks: &[Task]) -> ValidationReport {
        let mut report = ValidationReport::default();
        let mut graph: DiGraph<TaskId, ()> = DiGraph::new();
        let mut nodes: HashMap<&TaskId, NodeIndex> = HashMap::new();

        for task in tasks {
            if nodes.contains_key(task.id()) {
                report.duplicate_ids.push(task.id().clone());
                continue;
            }
            nodes.insert(task.id(), graph.add_node(task.id().clone()));
        }

        for task in tasks {
            let Some(&to) = nodes.get(task.id()) else {
                continue;
            };
            for dependency in task.dependencies() {
                match nodes.get(dependency) {
                    Some(&from) => {
                        graph.update_edge(from, to, ());
                    }
                    None => report
                        .missing_dependencies
                        .push((task.id().clone(), dependency.clone())),
                }
            }
        }

        let mut cycles: Vec<Vec<NodeIndex>> = tarjan_scc(&graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .first()
                        .is_some_and(|&node| graph.contains_edge(node, node))
            })
            .map(|mut component| {
                component.sort();
                component
            })
            .collect();
        cycles.sort();

        report.cycles = cycles
            .into_iter()
            .map(|component| component.into_iter().map(|node| graph[node].clone()).collect())
            .collect();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(id: &str) -> Task {
        Task::from_fn(id, id, |ctx| async move { Ok(ctx) })
    }

    #[test]
    fn test_valid_list() {
        let tasks = vec![noop("init"), noop("bump").depends_on("init")];
        let report = WorkflowValidator::new().validate(&tasks);

        assert!(report.is_valid());
        report.into_result().unwrap();
    }

    #[test]
    fn test_reports_every_problem() {
        let tasks = vec![
            noop("a").depends_on("c"),
            noop("b").depends_on("a"),
            noop("c").depends_on("b"),
            noop("d").depends_on("ghost"),
            noop("d"),
            noop("e").depends_on("e"),
        ];
        let report = WorkflowValidator::new().validate(&tasks);

        assert!(!report.is_valid());
        assert_eq!(report.duplicate_ids(), &[TaskId::new("d")]);
        assert_eq!(
            report.missing_dependencies(),
            &[(TaskId::new("d"), TaskId::new("ghost"))]
        );
        assert_eq!(
            report.cycles(),
            &[
                vec![TaskId::new("a"), TaskId::new("b"), TaskId::new("c")],
                vec![TaskId::new("e")],
            ]
        );
        assert!(matches!(report.into_result(), Err(WorkflowError::DuplicateTask(_))));
    }

    #[test]
    fn test_cycle_converts_to_validation_error() {
        let tasks = vec![noop("a").depends_on("b"), noop("b").depends_on("a")];
        let err = WorkflowValidator::new().validate(&tasks).into_result().unwrap_err();

        assert!(matches!(&err, WorkflowError::CycleDetected(id) if id.as_str() == "a"));
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let tasks = vec![
            noop("a"),
            noop("b").depends_on("a"),
            noop("c").depends_on("a"),
            noop("d").depends_on("b").depends_on("c"),
        ];
        assert!(WorkflowValidator::new().validate(&tasks).is_valid());
    }
}
