//! Task orchestration and rollback.
//!
//! The workflow module turns registered tasks into a single sequential run:
//! - Tasks and task groups are registered into a [`TaskRegistry`], which
//!   rejects duplicate ids, dangling dependencies and cycles eagerly
//! - Groups are expanded into namespaced tasks (`group:task`) that share a
//!   group-level skip condition
//! - The [`TaskOrchestrator`] validates the static graph again, filters
//!   tasks by enabled feature and hands the ordered list to the
//!   [`SequentialExecutor`]
//! - On failure, the [`RollbackManager`] unwinds completed tasks under the
//!   configured [`RollbackStrategy`]
//!
//! # Example
//!
//! ```ignore
//! use cutover_engine::{OrchestratorOptions, Task, TaskOrchestrator, WorkflowContext};
//!
//! let mut orchestrator = TaskOrchestrator::new(OrchestratorOptions::default())?;
//! orchestrator.register(Task::from_fn("init", "Initialize", |ctx| async move { Ok(ctx) }))?;
//! orchestrator.register(
//!     Task::from_fn("bump", "Bump version", |ctx| async move { Ok(ctx.fork("version", "1.2.0")) })
//!         .depends_on("init"),
//! )?;
//!
//! let result = orchestrator.run(WorkflowContext::default()).await?;
//! assert!(result.success());
//! ```
//!
//! # Execution Model
//!
//! Tasks never run concurrently. Cancellation and the run deadline are
//! checked between tasks only; a running task is never interrupted.

pub mod cancellation;
pub mod context;
pub mod executor;
pub mod graph;
pub mod group;
pub mod orchestrator;
pub mod registry;
pub mod rollback;
pub mod task;
pub mod timeout;
pub mod validate;

pub use cancellation::{CancellationToken, CancellationTokenSource, ChildToken};
pub use context::{Services, WorkflowContext};
pub use executor::{RunOptions, SequentialExecutor, WorkflowExecutionResult};
pub use graph::{execution_order, OrderIter};
pub use group::{GroupExpansion, GroupRecord, GroupRegistry, TaskGroup};
pub use orchestrator::TaskOrchestrator;
pub use registry::TaskRegistry;
pub use rollback::{
    CompensationRegistry, RollbackConfig, RollbackEntry, RollbackFailure, RollbackManager,
    RollbackReport, RollbackStrategy,
};
pub use task::{
    Executable, GroupProvenance, RollbackHooks, SkipDecision, Skippable, Task, TaskError, TaskId,
    Undoable, NAMESPACE_SEPARATOR,
};
pub use timeout::{Deadline, WorkflowTimeout};
pub use validate::{ValidationReport, WorkflowValidator};
