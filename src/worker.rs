use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{ConfigError, WorkerConfig};
use crate::job::Job;
use crate::lock::lock_exclusively;
use crate::registry::{HandlerRegistry, JobError};
use crate::retry::{self, Disposition};
use crate::selector;
use crate::storage::{Storage, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Tally of one [`Worker::work_off`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkOffStats {
    pub success: u32,
    pub failure: u32,
}

impl WorkOffStats {
    pub fn total(&self) -> u32 {
        self.success + self.failure
    }
}

fn say(quiet: bool, text: &str) {
    if !quiet {
        println!("{text}");
    }
    info!("{text}");
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            warn!(error = %e, "Failed to listen for SIGINT");
                            terminate.recv().await;
                        }
                    }
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

/// Polls the store, runs jobs one at a time and reschedules failures.
///
/// Any number of workers, in any number of processes, may share a store;
/// they coordinate only through the store's conditional lock update.
pub struct Worker {
    storage: Arc<dyn Storage>,
    handlers: Arc<HandlerRegistry>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        storage: Arc<dyn Storage>,
        handlers: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Result<Self, WorkerError> {
        config.validate()?;
        Ok(Self {
            storage,
            handlers,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.worker_name
    }

    /// Cancelling this token stops the worker at the next job boundary, the
    /// same way SIGINT/SIGTERM do under [`Worker::start`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn start(&self) -> Result<(), WorkerError> {
        let listener = self.listen_for_signals();
        let result = self.run().await;
        listener.abort();
        result
    }

    fn listen_for_signals(&self) -> JoinHandle<()> {
        let shutdown = self.shutdown.clone();
        let quiet = self.config.quiet;

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = wait_for_signal() => {
                    say(quiet, "Exiting...");
                    shutdown.cancel();
                }
            }
        })
    }

    /// Run until the shutdown token is cancelled.
    ///
    /// However the loop ends, including a store error or a panic, this
    /// worker's locks are released and its PID file removed before returning.
    pub async fn run(&self) -> Result<(), WorkerError> {
        self.say(&format!("*** Starting job worker {}", self.name()));
        let pid_file = self.write_pid_file();

        let outcome = AssertUnwindSafe(self.run_loop()).catch_unwind().await;

        let cleared = self.clear_locks().await;
        if let Some(path) = pid_file {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove PID file");
            }
        }

        match outcome {
            Err(panic) => {
                if let Err(e) = &cleared {
                    error!(error = %e, "Failed to release locks after worker panic");
                }
                std::panic::resume_unwind(panic)
            }
            Ok(Err(e)) => {
                if let Err(clear_error) = &cleared {
                    error!(error = %clear_error, "Failed to release locks after worker error");
                }
                Err(e)
            }
            Ok(Ok(())) => {
                cleared?;
                Ok(())
            }
        }
    }

    async fn run_loop(&self) -> Result<(), WorkerError> {
        loop {
            let started = Instant::now();
            let stats = self.work_off(self.config.batch_size).await?;
            let elapsed = started.elapsed();

            if self.shutdown.is_cancelled() {
                break;
            }

            if stats.total() == 0 {
                debug!(sleep = ?self.config.sleep_interval, "No jobs available");
                tokio::select! {
                    _ = self.shutdown.cancelled() => {}
                    _ = tokio::time::sleep(self.config.sleep_interval) => {}
                }
            } else {
                let rate = f64::from(stats.total()) / elapsed.as_secs_f64().max(f64::EPSILON);
                self.say(&format!(
                    "{} jobs processed at {rate:.4} j/s, {} failed ...",
                    stats.total(),
                    stats.failure
                ));
            }

            if self.shutdown.is_cancelled() {
                break;
            }
        }

        Ok(())
    }

    /// Run up to `num` jobs, stopping early when nothing could be locked or
    /// shutdown was requested.
    pub async fn work_off(&self, num: u32) -> Result<WorkOffStats, StorageError> {
        let mut stats = WorkOffStats::default();

        for _ in 0..num {
            match self.reserve_and_run_one_job().await? {
                Some(true) => stats.success += 1,
                Some(false) => stats.failure += 1,
                None => break,
            }

            if self.shutdown.is_cancelled() {
                break;
            }
        }

        Ok(stats)
    }

    /// Run the first candidate that can be locked.
    ///
    /// Returns `Some(true)` when it completed, `Some(false)` when it failed and
    /// `None` when no candidate could be locked.
    pub async fn reserve_and_run_one_job(&self) -> Result<Option<bool>, StorageError> {
        let candidates = selector::find_available(
            self.storage.as_ref(),
            &self.config,
            self.config.candidate_limit,
            self.config.max_run_time,
        )
        .await?;

        for mut job in candidates {
            if let Some(outcome) = self.run_with_lock(&mut job).await? {
                return Ok(Some(outcome));
            }
        }

        Ok(None)
    }

    /// Lock and run a single job.
    ///
    /// A completed job is deleted. A failed one goes through
    /// [`retry::reschedule`]; the failure never escapes this call.
    pub async fn run_with_lock(&self, job: &mut Job) -> Result<Option<bool>, StorageError> {
        let name = self.handlers.display_name(job);
        debug!(job.id = %job.id, job.name = %name, "Acquiring lock");

        let locked = lock_exclusively(
            self.storage.as_ref(),
            job,
            self.config.max_run_time,
            self.name(),
        )
        .await?;

        if !locked {
            warn!(job.id = %job.id, job.name = %name, "Failed to acquire exclusive lock");
            return Ok(None);
        }

        let span = info_span!("job", job.id = %job.id, job.name = %name);
        self.execute_locked(job, &name).instrument(span).await
    }

    async fn execute_locked(&self, job: &mut Job, name: &str) -> Result<Option<bool>, StorageError> {
        let started = Instant::now();

        match self.handlers.execute(job).await {
            Ok(()) => {
                self.storage.delete(job.id).await?;
                info!(
                    "{name} completed after {:.4}s",
                    started.elapsed().as_secs_f64()
                );
                Ok(Some(true))
            }
            Err(failure) => {
                let disposition = retry::reschedule(
                    self.storage.as_ref(),
                    job,
                    &failure.message(),
                    failure.trace(),
                    Utc::now(),
                    &self.config,
                )
                .await?;
                self.log_failure(name, &failure, job.attempts, &disposition);
                Ok(Some(false))
            }
        }
    }

    fn log_failure(&self, name: &str, failure: &JobError, attempts: u32, disposition: &Disposition) {
        error!(
            error = %failure,
            trace = ?failure.trace(),
            attempts,
            ?disposition,
            "{name} failed"
        );
    }

    /// Release every lock held under this worker's name.
    pub async fn clear_locks(&self) -> Result<u64, StorageError> {
        let released = self.storage.clear_locks(self.name()).await?;
        if released > 0 {
            info!(worker = self.name(), released, "Released held locks");
        }
        Ok(released)
    }

    /// Path of this process's PID file, if one is configured.
    pub fn pid_file(&self) -> Option<PathBuf> {
        self.config
            .pid_dir
            .as_ref()
            .map(|dir| dir.join(format!("deferred_jobs.{}.pid", std::process::id())))
    }

    fn write_pid_file(&self) -> Option<PathBuf> {
        let path = self.pid_file()?;
        match std::fs::write(&path, std::process::id().to_string()) {
            Ok(()) => Some(path),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to write PID file");
                None
            }
        }
    }

    fn say(&self, text: &str) {
        say(self.config.quiet, text);
    }
}
