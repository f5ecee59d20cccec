use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;

use crate::config::WorkerConfig;
use crate::job::Job;
use crate::lock::stale_before;
use crate::storage::{CandidateFilter, Result, Storage};

/// Find a few jobs this worker could run right now.
///
/// The store picks the top `limit` rows by priority and `run_at`; the batch is
/// then shuffled so that workers polling at the same moment do not all race
/// for the same head job.
pub async fn find_available(
    storage: &dyn Storage,
    config: &WorkerConfig,
    limit: u32,
    max_run_time: Duration,
) -> Result<Vec<Job>> {
    let now = Utc::now();
    let filter = CandidateFilter {
        now,
        stale_before: stale_before(now, max_run_time),
        worker: config.worker_name.clone(),
        min_priority: config.min_priority,
        max_priority: config.max_priority,
        limit,
    };

    let mut candidates = storage.find_available(&filter).await?;
    candidates.shuffle(&mut rand::rng());
    Ok(candidates)
}
