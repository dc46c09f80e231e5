//! Dependency ordering over task ids.
//!
//! Produces a linear order in which every task follows all of its
//! dependencies. Traversal is a depth-first search driven by an explicit
//! stack with two marker sets:
//! - `visited`: fully ordered, re-entering is a no-op (diamonds are legal)
//! - `on_stack`: currently being expanded, re-entering closes a cycle
//!
//! Every node is used as a traversal root in input order and dependencies
//! are followed in declaration order, so the output is deterministic.

use crate::error::WorkflowError;
use crate::workflow::task::TaskId;
use indexmap::IndexMap;
use std::collections::HashSet;

/// Lazy iterator yielding task ids in dependency order.
///
/// Each call to `next` advances the traversal just far enough to emit one
/// id. A cycle or dangling reference is yielded once as an error, after
/// which the iterator is exhausted.
pub struct OrderIter<'a> {
    nodes: IndexMap<&'a TaskId, &'a [TaskId]>,
    next_root: usize,
    stack: Vec<(&'a TaskId, usize)>,
    visited: HashSet<&'a TaskId>,
    on_stack: HashSet<&'a TaskId>,
    failed: bool,
}

impl<'a> OrderIter<'a> {
    /// Creates an iterator over `(id, dependencies)` pairs.
    pub fn new<I>(nodes: I) -> Self
    where
        I: IntoIterator<Item = (&'a TaskId, &'a [TaskId])>,
    {
        Self {
            nodes: nodes.into_iter().collect(),
            next_root: 0,
            stack: Vec::new(),
            visited: HashSet::new(),
            on_stack: HashSet::new(),
            failed: false,
        }
    }

    fn push(&mut self, id: &'a TaskId) {
        self.on_stack.insert(id);
        self.stack.push((id, 0));
    }

    fn fail(&mut self, error: WorkflowError) -> Option<Result<TaskId, WorkflowError>> {
        self.failed = true;
        self.stack.clear();
        Some(Err(error))
    }
}

impl<'a> Iterator for OrderIter<'a> {
    type Item = Result<TaskId, WorkflowError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        loop {
            let Some(&(current, cursor)) = self.stack.last() else {
                // Start a new traversal from the next unvisited root
                let (&root, _) = loop {
                    let entry = self.nodes.get_index(self.next_root)?;
                    self.next_root += 1;
                    if !self.visited.contains(entry.0) {
                        break entry;
                    }
                };
                self.push(root);
                continue;
            };

            let dependencies = self.nodes.get(current).copied().unwrap_or(&[]);

            if cursor < dependencies.len() {
                if let Some(top) = self.stack.last_mut() {
                    top.1 += 1;
                }

                let dependency = &dependencies[cursor];
                if self.visited.contains(dependency) {
                    continue;
                }
                if self.on_stack.contains(dependency) {
                    return self.fail(WorkflowError::CycleDetected(dependency.clone()));
                }
                match self.nodes.get_key_value(dependency) {
                    Some((&key, _)) => self.push(key),
                    None => {
                        return self.fail(WorkflowError::MissingDependency {
                            task: current.clone(),
                            dependency: dependency.clone(),
                        })
                    }
                }
            } else {
                self.stack.pop();
                self.on_stack.remove(current);
                self.visited.insert(current);
                return Some(Ok(current.clone()));
            }
        }
    }
}

/// Returns all ids in dependency order.
///
/// # Errors
///
/// - `WorkflowError::CycleDetected` naming the task where the cycle closed
/// - `WorkflowError::MissingDependency` for a reference outside `nodes`
pub fn execution_order<'a, I>(nodes: I) -> Result<Vec<TaskId>, WorkflowError>
where
    I: IntoIterator<Item = (&'a TaskId, &'a [TaskId])>,
{
    OrderIter::new(nodes).collect()
}
