//! Run-level timeout.
//!
//! A [`WorkflowTimeout`] is started into a [`Deadline`] when a run begins.
//! The deadline is only consulted at task boundaries, so a slow task
//! finishes before the run stops.

use std::time::Duration;
use tokio::time::Instant;

/// Timeout limit for an entire workflow run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkflowTimeout(Duration);

impl WorkflowTimeout {
    /// Creates a timeout with the specified duration.
    pub fn new(duration: Duration) -> Self {
        Self(duration)
    }

    /// Creates a timeout from seconds.
    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    /// Creates a timeout from milliseconds.
    pub fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    /// Returns the timeout duration.
    pub fn duration(&self) -> Duration {
        self.0
    }

    /// Starts the clock.
    pub fn start(self) -> Deadline {
        Deadline {
            started: Instant::now(),
            timeout: self.0,
        }
    }
}

impl From<Duration> for WorkflowTimeout {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

/// A started [`WorkflowTimeout`].
///
/// Uses `tokio::time::Instant` so paused-clock tests can advance it.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    started: Instant,
    timeout: Duration,
}

impl Deadline {
    /// Returns true once the timeout has elapsed.
    pub fn is_expired(&self) -> bool {
        self.started.elapsed() >= self.timeout
    }

    /// Returns the time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.started.elapsed())
    }

    /// Returns the configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
