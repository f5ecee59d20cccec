//! A database-backed job queue.
//!
//! Producers enqueue [`Payload`]s into a shared [`Storage`]; any number of
//! [`Worker`]s, in any number of processes, poll it. A worker claims a job by a
//! conditional update on the row, so at most one worker holds a job at a time.
//! Failed jobs are retried with a quickly widening backoff until they run out
//! of attempts.

mod config;
mod job;
pub mod lock;
mod payload;
mod queue;
mod registry;
pub mod retry;
pub mod selector;
pub mod storage;
mod worker;

pub use config::{
    default_worker_name, ConfigError, FailedJobPolicy, WorkerConfig, MAX_ATTEMPTS_LIMIT,
};
pub use job::{Job, JobId, NewJob, QueueStats};
pub use payload::Payload;
pub use queue::{EnqueueError, JobQueue};
pub use registry::{HandlerRegistry, JobError, JobResult};
pub use storage::{CandidateFilter, SqliteStorage, Storage, StorageError};
pub use worker::{WorkOffStats, Worker, WorkerError};
