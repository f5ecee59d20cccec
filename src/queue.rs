use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::config::WorkerConfig;
use crate::job::{Job, JobId, NewJob, QueueStats};
use crate::payload::{Envelope, Payload};
use crate::registry::HandlerRegistry;
use crate::storage::{SqliteStorage, Storage, StorageError};
use crate::worker::{Worker, WorkerError};

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("Failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Entry point for producers and workers sharing one store.
///
/// # Example
/// ```ignore
/// let queue = JobQueue::connect("sqlite://jobs.db?mode=rwc").await?;
/// queue.register::<SendNewsletter>();
///
/// queue.enqueue(&SendNewsletter { issue: 42 }).await?;
///
/// let worker = queue.worker(WorkerConfig::default())?;
/// worker.start().await?;
/// ```
pub struct JobQueue {
    storage: Arc<dyn Storage>,
    handlers: Arc<HandlerRegistry>,
}

impl JobQueue {
    /// Open (and migrate) a SQLite store.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let storage = SqliteStorage::connect(database_url).await?;
        Ok(Self::new(Arc::new(storage)))
    }

    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            handlers: Arc::new(HandlerRegistry::new()),
        }
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    pub fn handlers(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.handlers)
    }

    /// Make workers built from this queue able to run `P`.
    pub fn register<P: Payload>(&self) -> &Self {
        self.handlers.register::<P>();
        self
    }

    /// Enqueue `payload` with priority 0, due now.
    pub async fn enqueue<P: Payload>(&self, payload: &P) -> Result<Job, EnqueueError> {
        self.enqueue_with(payload, 0, None).await
    }

    /// Enqueue `payload`; larger priorities run first and `run_at` (default
    /// now) delays the first attempt.
    #[instrument(name = "jobs.enqueue", skip(self, payload), fields(job.type = P::JOB_TYPE))]
    pub async fn enqueue_with<P: Payload>(
        &self,
        payload: &P,
        priority: i32,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<Job, EnqueueError> {
        let handler = Envelope::wrap(payload)?.encode()?;
        let new_job = NewJob::new(handler)
            .with_priority(priority)
            .run_at(run_at.unwrap_or_else(Utc::now));

        let job = self.storage.insert(new_job).await?;
        info!(job.id = %job.id, job.name = %payload.display_name(), "Enqueued job");
        Ok(job)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, StorageError> {
        self.storage.get(id).await
    }

    /// Jobs kept after exhausting their attempts, newest failure first.
    pub async fn failed_jobs(&self, limit: u32) -> Result<Vec<Job>, StorageError> {
        self.storage.failed_jobs(limit).await
    }

    pub async fn delete(&self, id: JobId) -> Result<bool, StorageError> {
        self.storage.delete(id).await
    }

    pub async fn stats(&self) -> Result<QueueStats, StorageError> {
        self.storage.stats().await
    }

    /// Build a worker over this queue's store and registered payloads.
    pub fn worker(&self, config: WorkerConfig) -> Result<Worker, WorkerError> {
        Worker::new(self.storage(), self.handlers(), config)
    }
}
