//! Cutover engine - release automation task orchestration.
//!
//! This crate runs the steps of a release (bump a version, write a
//! changelog, tag, push, publish) as a dependency-ordered list of tasks:
//!
//! - Registration: tasks and namespaced task groups, checked eagerly
//! - Execution: one task at a time, with skip conditions and skip-to jumps
//! - Interruption: cooperative cancellation and a run deadline
//! - Recovery: reverse, compensation or hook-driven rollback
//! - Audit: a per-run event trail, optionally persisted as JSON
//!
//! Every run returns a [`WorkflowExecutionResult`]; only registration and
//! validation problems are reported as `Err`.

pub mod audit;
pub mod config;
pub mod error;
pub mod workflow;

pub use audit::{AuditError, AuditEvent, AuditLog};
pub use config::{DependencyPolicy, OrchestratorOptions};
pub use error::{ErrorKind, Result, WorkflowError};
pub use workflow::{
    CancellationToken, CancellationTokenSource, CompensationRegistry, Executable, RollbackConfig,
    RollbackHooks, RollbackReport, RollbackStrategy, RunOptions, SequentialExecutor, Services,
    SkipDecision, Skippable, Task, TaskError, TaskGroup, TaskId, TaskOrchestrator, TaskRegistry,
    Undoable, WorkflowContext, WorkflowExecutionResult, WorkflowTimeout, WorkflowValidator,
};
