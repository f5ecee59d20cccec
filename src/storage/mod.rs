pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::job::{Job, JobId, NewJob, QueueStats};

pub use sqlite::SqliteStorage;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid timestamp in column {column}: {value}")]
    Timestamp { column: &'static str, value: i64 },

    #[error("Value out of range in column {column}: {value}")]
    OutOfRange { column: &'static str, value: i64 },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Query parameters for runnable jobs.
///
/// A row matches when it is due, not failed, inside the priority bounds and
/// either unlocked, locked before `stale_before`, or locked by `worker`.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateFilter {
    pub now: DateTime<Utc>,
    pub stale_before: DateTime<Utc>,
    pub worker: String,
    pub min_priority: Option<i32>,
    pub max_priority: Option<i32>,
    pub limit: u32,
}

/// Durable storage for job rows.
///
/// Mutual exclusion between workers relies on `lock_if_available` being a
/// single atomic conditional write.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn insert(&self, job: NewJob) -> Result<Job>;
    async fn get(&self, id: JobId) -> Result<Option<Job>>;
    /// Ordered by priority descending, then `run_at` ascending.
    async fn find_available(&self, filter: &CandidateFilter) -> Result<Vec<Job>>;
    /// Claims the row for `worker` if it is unlocked or its lock predates
    /// `stale_before`. Returns whether the row was updated.
    async fn lock_if_available(
        &self,
        id: JobId,
        worker: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool>;
    /// Bumps `locked_at` on a row `worker` already holds.
    async fn refresh_lock(&self, id: JobId, worker: &str, now: DateTime<Utc>) -> Result<bool>;
    /// Writes the retry bookkeeping of `job` and releases the lock, provided
    /// `holder` still owns it.
    async fn save_attempt(&self, job: &Job, holder: &str) -> Result<bool>;
    async fn delete(&self, id: JobId) -> Result<bool>;
    /// Deletes the row only while `holder` still owns its lock.
    async fn delete_if_held(&self, id: JobId, holder: &str) -> Result<bool>;
    /// Releases every lock held by `worker`.
    async fn clear_locks(&self, worker: &str) -> Result<u64>;
    async fn failed_jobs(&self, limit: u32) -> Result<Vec<Job>>;
    async fn stats(&self) -> Result<QueueStats>;
}
