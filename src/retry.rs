use chrono::{DateTime, TimeDelta, Utc};
use tracing::{info, warn};

use crate::config::{FailedJobPolicy, WorkerConfig};
use crate::job::Job;
use crate::storage::{Result, Storage};

/// Delay before the next try of a job that has failed `attempts` times
/// before this failure: `attempts^4 + 5` seconds, saturating at
/// `TimeDelta::MAX`.
pub fn backoff(attempts: u32) -> TimeDelta {
    i64::from(attempts)
        .checked_pow(4)
        .and_then(|secs| secs.checked_add(5))
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

/// Text stored in `last_error`: the message, then one trace line per line.
pub fn format_error(message: &str, trace: &[String]) -> String {
    let mut text = message.to_string();
    for line in trace {
        text.push('\n');
        text.push_str(line);
    }
    text
}

/// Outcome of handling one failed execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Rescheduled { attempts: u32, run_at: DateTime<Utc> },
    Destroyed,
    MarkedFailed,
    /// Another worker took the lock over while the job ran; its holder now
    /// owns the bookkeeping.
    LockLost,
}

/// Record a failed execution of a job this worker holds.
///
/// `attempts` is incremented. Below `config.max_attempts` the job is pushed
/// back by [`backoff`] of its previous attempt count and unlocked; on reaching
/// the ceiling it is deleted or marked failed, per `config.failed_jobs`.
pub async fn reschedule(
    storage: &dyn Storage,
    job: &mut Job,
    message: &str,
    trace: &[String],
    now: DateTime<Utc>,
    config: &WorkerConfig,
) -> Result<Disposition> {
    let holder = job
        .locked_by
        .clone()
        .unwrap_or_else(|| config.worker_name.clone());
    let previous_attempts = job.attempts;

    job.attempts = previous_attempts.saturating_add(1);
    job.last_error = Some(format_error(message, trace));
    job.unlock();

    if job.attempts < config.max_attempts {
        job.run_at = now
            .checked_add_signed(backoff(previous_attempts))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        if !storage.save_attempt(job, &holder).await? {
            warn!(job.id = %job.id, "Lock lost before the failure could be recorded");
            return Ok(Disposition::LockLost);
        }

        return Ok(Disposition::Rescheduled {
            attempts: job.attempts,
            run_at: job.run_at,
        });
    }

    info!(
        job.id = %job.id,
        attempts = job.attempts,
        "Permanently removing job from rotation after consecutive failures"
    );

    match config.failed_jobs {
        FailedJobPolicy::Destroy => {
            if storage.delete_if_held(job.id, &holder).await? {
                Ok(Disposition::Destroyed)
            } else {
                warn!(job.id = %job.id, "Lock lost before the job could be destroyed");
                Ok(Disposition::LockLost)
            }
        }
        FailedJobPolicy::Retain => {
            job.failed_at = Some(now);
            if storage.save_attempt(job, &holder).await? {
                Ok(Disposition::MarkedFailed)
            } else {
                warn!(job.id = %job.id, "Lock lost before the job could be marked failed");
                Ok(Disposition::LockLost)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_widens_quickly() {
        let offsets: Vec<i64> = (0..4).map(|a| backoff(a).num_seconds()).collect();
        assert_eq!(offsets, vec![5, 6, 21, 86]);
    }

    #[test]
    fn backoff_is_strictly_increasing() {
        for attempts in 0..25 {
            assert!(backoff(attempts) < backoff(attempts + 1));
        }
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        assert_eq!(backoff(u32::MAX), TimeDelta::MAX);
        assert_eq!(backoff(60_000), TimeDelta::MAX);
        assert!(backoff(2_000) > TimeDelta::days(365 * 100_000));
    }

    #[test]
    fn error_text_joins_trace_lines() {
        let trace = vec!["caused by io".to_string(), "at line 3".to_string()];
        assert_eq!(format_error("boom", &trace), "boom\ncaused by io\nat line 3");
        assert_eq!(format_error("boom", &[]), "boom");
    }
}
