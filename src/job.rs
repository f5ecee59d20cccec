use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-assigned identifier of a job row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// A persisted unit of deferred work and its scheduling metadata.
///
/// Instances are caller-local copies of a row; changes only reach the store
/// through explicit [`Storage`](crate::Storage) calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Larger values run first.
    pub priority: i32,
    /// Failed executions so far.
    pub attempts: u32,
    /// Serialized payload envelope.
    pub handler: String,
    pub last_error: Option<String>,
    /// Earliest time the job may run.
    pub run_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    /// Set once the retry budget is exhausted and the row is retained.
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    pub fn is_locked_by(&self, worker: &str) -> bool {
        self.locked_by.as_deref() == Some(worker)
    }

    /// Clears the lock fields on this copy only.
    pub fn unlock(&mut self) {
        self.locked_at = None;
        self.locked_by = None;
    }
}

/// What an enqueue supplies; everything else is filled in by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub handler: String,
    pub priority: i32,
    pub run_at: DateTime<Utc>,
}

impl NewJob {
    pub fn new<S: Into<String>>(handler: S) -> Self {
        Self {
            handler: handler.into(),
            priority: 0,
            run_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = run_at;
        self
    }
}

/// Row counts for a quick look at the queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: u64,
    pub locked: u64,
    pub failed: u64,
}
