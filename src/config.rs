use std::path::PathBuf;
use std::time::Duration;

/// Idle pause after a cycle that found nothing to do.
pub const DEFAULT_SLEEP_INTERVAL: Duration = Duration::from_secs(60);
/// After this long another worker may take over a lock.
pub const DEFAULT_MAX_RUN_TIME: Duration = Duration::from_secs(4 * 60 * 60);
pub const DEFAULT_BATCH_SIZE: u32 = 100;
pub const DEFAULT_CANDIDATE_LIMIT: u32 = 5;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 25;
/// Largest accepted `max_attempts`. The last backoff below it is about
/// 31,600 years, well inside the representable time range.
pub const MAX_ATTEMPTS_LIMIT: u32 = 1_000;

/// What happens to a job once it has used up its attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailedJobPolicy {
    /// Delete the row.
    #[default]
    Destroy,
    /// Keep the row with `failed_at` set so it can be inspected.
    Retain,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("min_priority {min} is greater than max_priority {max}")]
    PriorityBounds { min: i32, max: i32 },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("worker name must not be empty")]
    EmptyWorkerName,

    #[error("max_attempts {max} exceeds the limit of {limit}")]
    TooManyAttempts { max: u32, limit: u32 },
}

/// Default worker identity: `host:<hostname> pid:<pid>`, or `pid:<pid>` when
/// the host name cannot be read.
pub fn default_worker_name() -> String {
    let pid = std::process::id();
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.trim().is_empty())
        .map(|host| format!("host:{host} pid:{pid}"))
        .unwrap_or_else(|| format!("pid:{pid}"))
}

/// Settings read once when a worker is built.
///
/// ```ignore
/// let config = WorkerConfig::default()
///     .with_worker_name("mailer-1")
///     .with_min_priority(10)
///     .with_failed_jobs(FailedJobPolicy::Retain);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// A stable name lets a restarted worker resume jobs it had locked.
    pub worker_name: String,
    /// Suppress console output; tracing still receives every message.
    pub quiet: bool,
    pub min_priority: Option<i32>,
    pub max_priority: Option<i32>,
    pub sleep_interval: Duration,
    pub max_run_time: Duration,
    /// Jobs attempted per cycle before the throughput report.
    pub batch_size: u32,
    /// Candidates fetched for each reservation.
    pub candidate_limit: u32,
    pub max_attempts: u32,
    pub failed_jobs: FailedJobPolicy,
    /// Directory for the PID file; `None` disables it.
    pub pid_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_name: default_worker_name(),
            quiet: false,
            min_priority: None,
            max_priority: None,
            sleep_interval: DEFAULT_SLEEP_INTERVAL,
            max_run_time: DEFAULT_MAX_RUN_TIME,
            batch_size: DEFAULT_BATCH_SIZE,
            candidate_limit: DEFAULT_CANDIDATE_LIMIT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            failed_jobs: FailedJobPolicy::default(),
            pid_dir: Some(PathBuf::from(".")),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_name<S: Into<String>>(mut self, name: S) -> Self {
        self.worker_name = name.into();
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn with_min_priority(mut self, priority: i32) -> Self {
        self.min_priority = Some(priority);
        self
    }

    pub fn with_max_priority(mut self, priority: i32) -> Self {
        self.max_priority = Some(priority);
        self
    }

    pub fn with_sleep_interval(mut self, interval: Duration) -> Self {
        self.sleep_interval = interval;
        self
    }

    pub fn with_max_run_time(mut self, max_run_time: Duration) -> Self {
        self.max_run_time = max_run_time;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_candidate_limit(mut self, limit: u32) -> Self {
        self.candidate_limit = limit;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_failed_jobs(mut self, policy: FailedJobPolicy) -> Self {
        self.failed_jobs = policy;
        self
    }

    pub fn with_pid_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.pid_dir = Some(dir.into());
        self
    }

    pub fn without_pid_file(mut self) -> Self {
        self.pid_dir = None;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_name.trim().is_empty() {
            return Err(ConfigError::EmptyWorkerName);
        }
        if let (Some(min), Some(max)) = (self.min_priority, self.max_priority) {
            if min > max {
                return Err(ConfigError::PriorityBounds { min, max });
            }
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Zero("batch_size"));
        }
        if self.candidate_limit == 0 {
            return Err(ConfigError::Zero("candidate_limit"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero("max_attempts"));
        }
        if self.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(ConfigError::TooManyAttempts {
                max: self.max_attempts,
                limit: MAX_ATTEMPTS_LIMIT,
            });
        }
        Ok(())
    }
}
