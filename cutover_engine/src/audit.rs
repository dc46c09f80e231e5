//! Audit trail of workflow runs.
//!
//! Every run records serde-serializable [`AuditEvent`]s into an [`AuditLog`]
//! keyed by a fresh run id. The log lives in memory; when an audit directory
//! is configured, the full event list is rewritten to `<dir>/<run-id>.json`
//! after each event so a crashed run still leaves its trail behind.

use crate::workflow::rollback::RollbackStrategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Error types for audit persistence.
#[derive(Error, Debug)]
pub enum AuditError {
    /// Failed to serialize the event list
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Failed to write the audit file
    #[error("Write failed: {0}")]
    WriteFailed(#[from] std::io::Error),

    /// Failed to create the audit directory
    #[error("Directory creation failed: {0}")]
    DirectoryFailed(String),
}

/// Event recorded during a workflow run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum AuditEvent {
    /// Run accepted by the executor
    RunStarted {
        timestamp: DateTime<Utc>,
        execution_id: String,
        task_count: usize,
        dry_run: bool,
    },
    /// Task about to execute
    TaskStarted {
        timestamp: DateTime<Utc>,
        task_id: String,
    },
    /// Task skipped by its condition or the dependency policy
    TaskSkipped {
        timestamp: DateTime<Utc>,
        task_id: String,
        reason: String,
    },
    /// Tasks jumped over by a skip-to decision
    TasksBypassed {
        timestamp: DateTime<Utc>,
        from_task: String,
        resume_at: String,
        bypassed: Vec<String>,
    },
    /// Task executed successfully
    TaskCompleted {
        timestamp: DateTime<Utc>,
        task_id: String,
        duration_ms: u64,
    },
    /// Task failed, halting the run
    TaskFailed {
        timestamp: DateTime<Utc>,
        task_id: String,
        error: String,
    },
    /// Cancellation or deadline stopped the run at a task boundary
    RunCancelled {
        timestamp: DateTime<Utc>,
        next_task: String,
        reason: String,
    },
    /// Task undone during rollback
    TaskRolledBack {
        timestamp: DateTime<Utc>,
        task_id: String,
        compensation_id: Option<String>,
        attempts: u32,
    },
    /// Task left alone during rollback
    RollbackTaskSkipped {
        timestamp: DateTime<Utc>,
        task_id: String,
        reason: String,
    },
    /// Task could not be undone
    RollbackTaskFailed {
        timestamp: DateTime<Utc>,
        task_id: String,
        error: String,
        attempts: u32,
    },
    /// Rollback finished
    RollbackCompleted {
        timestamp: DateTime<Utc>,
        strategy: RollbackStrategy,
        success: bool,
        rolled_back: usize,
        failed: usize,
    },
    /// Run finished
    RunCompleted {
        timestamp: DateTime<Utc>,
        execution_id: String,
        success: bool,
        executed: usize,
        skipped: usize,
    },
}

impl AuditEvent {
    /// Returns the event timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            AuditEvent::RunStarted { timestamp, .. }
            | AuditEvent::TaskStarted { timestamp, .. }
            | AuditEvent::TaskSkipped { timestamp, .. }
            | AuditEvent::TasksBypassed { timestamp, .. }
            | AuditEvent::TaskCompleted { timestamp, .. }
            | AuditEvent::TaskFailed { timestamp, .. }
            | AuditEvent::RunCancelled { timestamp, .. }
            | AuditEvent::TaskRolledBack { timestamp, .. }
            | AuditEvent::RollbackTaskSkipped { timestamp, .. }
            | AuditEvent::RollbackTaskFailed { timestamp, .. }
            | AuditEvent::RollbackCompleted { timestamp, .. }
            | AuditEvent::RunCompleted { timestamp, .. } => *timestamp,
        }
    }
}

/// Per-run audit log.
#[derive(Clone, Debug)]
pub struct AuditLog {
    run_id: Uuid,
    events: Vec<AuditEvent>,
    audit_dir: Option<PathBuf>,
}

impl AuditLog {
    /// Creates an in-memory audit log with a fresh run id.
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            events: Vec::new(),
            audit_dir: None,
        }
    }

    /// Creates an audit log persisted under `audit_dir`.
    pub fn with_dir(audit_dir: impl Into<PathBuf>) -> Self {
        Self {
            audit_dir: Some(audit_dir.into()),
            ..Self::new()
        }
    }

    /// Records an event and, if a directory is configured, persists the log.
    ///
    /// The event is kept in memory even when persistence fails.
    pub async fn record(&mut self, event: AuditEvent) -> Result<(), AuditError> {
        self.events.push(event);
        self.persist().await
    }

    /// Records an event; persistence failures are logged, never returned.
    pub(crate) async fn record_or_warn(&mut self, event: AuditEvent) {
        if let Err(err) = self.record(event).await {
            warn!(run_id = %self.run_id, error = %err, "Failed to persist audit log");
        }
    }

    async fn persist(&self) -> Result<(), AuditError> {
        let Some(dir) = &self.audit_dir else {
            return Ok(());
        };

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| AuditError::DirectoryFailed(e.to_string()))?;

        let json = serde_json::to_string_pretty(&self.events)?;
        tokio::fs::write(self.file_path(dir), json).await?;
        Ok(())
    }

    fn file_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.json", self.run_id))
    }

    /// Returns the path of the persisted log, if persistence is enabled.
    pub fn path(&self) -> Option<PathBuf> {
        self.audit_dir.as_deref().map(|dir| self.file_path(dir))
    }

    /// Returns the run id.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the recorded events.
    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    /// Consumes the log and returns its events.
    pub fn into_events(self) -> Vec<AuditEvent> {
        self.events
    }

    /// Returns the number of recorded events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}
