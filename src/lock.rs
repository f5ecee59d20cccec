use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, warn};

use crate::job::Job;
use crate::storage::{Result, Storage};

/// Locks taken before the returned instant are stale at `now`.
pub(crate) fn stale_before(now: DateTime<Utc>, max_run_time: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(max_run_time)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Claim `job` for `worker`.
///
/// A job held by another worker is only taken when it is unlocked or its lock
/// is older than `max_run_time`; the check and the write are one conditional
/// update in the store. A job `worker` already holds is resumed by refreshing
/// `locked_at`, however old the lock is.
///
/// On success the lock fields of `job` are updated; on failure `job` is left
/// untouched.
pub async fn lock_exclusively(
    storage: &dyn Storage,
    job: &mut Job,
    max_run_time: Duration,
    worker: &str,
) -> Result<bool> {
    let now = Utc::now();

    let acquired = if job.is_locked_by(worker) {
        debug!(job.id = %job.id, worker, "Resuming own lock");
        storage.refresh_lock(job.id, worker, now).await?
    } else {
        storage
            .lock_if_available(job.id, worker, now, stale_before(now, max_run_time))
            .await?
    };

    if acquired {
        job.locked_at = Some(now);
        job.locked_by = Some(worker.to_string());
    } else {
        warn!(job.id = %job.id, worker, "Lock is held by another worker");
    }

    Ok(acquired)
}
