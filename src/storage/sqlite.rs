use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::job::{Job, JobId, NewJob, QueueStats};

use super::{CandidateFilter, Result, Storage, StorageError};

/// Microseconds since the Unix epoch. Every `DateTime<Utc>` fits in an `i64`
/// this way, and integer order is time order.
pub(crate) fn to_db(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_db(column: &'static str, value: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(value).ok_or(StorageError::Timestamp { column, value })
}

fn optional_from_db(column: &'static str, value: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| from_db(column, v)).transpose()
}

pub struct SqliteStorage {
    pub pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn connect(database_url: &str) -> std::result::Result<Self, sqlx::Error> {
        let pool = SqlitePool::connect(database_url).await?;
        Self::from_pool(pool).await
    }

    /// Private in-memory database.
    ///
    /// Every SQLite connection to `:memory:` is its own database, so the pool
    /// is pinned to one connection that never expires.
    pub async fn in_memory() -> std::result::Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    pub async fn from_pool(pool: SqlitePool) -> std::result::Result<Self, sqlx::Error> {
        let storage = Self { pool };
        storage.configure().await?;
        storage.migrate().await?;
        Ok(storage)
    }

    async fn configure(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await?;

        sqlx::query("PRAGMA busy_timeout=5000;")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn migrate(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                priority INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                handler TEXT NOT NULL,
                last_error TEXT,
                run_at INTEGER NOT NULL,
                locked_at INTEGER,
                locked_by TEXT,
                failed_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_priority_run_at ON jobs(priority DESC, run_at ASC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_locked_by ON jobs(locked_by)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_job(&self, row: SqliteRow) -> Result<Job> {
        let id: i64 = row.try_get("id")?;
        let priority: i32 = row.try_get("priority")?;
        let attempts: i64 = row.try_get("attempts")?;
        let handler: String = row.try_get("handler")?;
        let last_error: Option<String> = row.try_get("last_error")?;
        let locked_by: Option<String> = row.try_get("locked_by")?;

        Ok(Job {
            id: JobId(id),
            priority,
            attempts: u32::try_from(attempts).map_err(|_| StorageError::OutOfRange {
                column: "attempts",
                value: attempts,
            })?,
            handler,
            last_error,
            run_at: from_db("run_at", row.try_get("run_at")?)?,
            locked_at: optional_from_db("locked_at", row.try_get("locked_at")?)?,
            locked_by,
            failed_at: optional_from_db("failed_at", row.try_get("failed_at")?)?,
            created_at: from_db("created_at", row.try_get("created_at")?)?,
            updated_at: from_db("updated_at", row.try_get("updated_at")?)?,
        })
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn insert(&self, job: NewJob) -> Result<Job> {
        let now = to_db(Utc::now());

        let row = sqlx::query(
            r#"
            INSERT INTO jobs (priority, attempts, handler, run_at, created_at, updated_at)
            VALUES (?, 0, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(job.priority)
        .bind(&job.handler)
        .bind(to_db(job.run_at))
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        self.row_to_job(row)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| self.row_to_job(row)).transpose()
    }

    async fn find_available(&self, filter: &CandidateFilter) -> Result<Vec<Job>> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM jobs WHERE run_at <= ");
        builder.push_bind(to_db(filter.now));
        builder.push(" AND (locked_at IS NULL OR locked_at < ");
        builder.push_bind(to_db(filter.stale_before));
        builder.push(" OR locked_by = ");
        builder.push_bind(filter.worker.as_str());
        builder.push(") AND failed_at IS NULL");

        if let Some(min) = filter.min_priority {
            builder.push(" AND priority >= ").push_bind(min);
        }
        if let Some(max) = filter.max_priority {
            builder.push(" AND priority <= ").push_bind(max);
        }

        builder.push(" ORDER BY priority DESC, run_at ASC LIMIT ");
        builder.push_bind(i64::from(filter.limit));

        let rows = builder.build().fetch_all(&self.pool).await?;

        rows.into_iter().map(|row| self.row_to_job(row)).collect()
    }

    async fn lock_if_available(
        &self,
        id: JobId,
        worker: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET locked_at = ?, locked_by = ?, updated_at = ?
            WHERE id = ? AND (locked_at IS NULL OR locked_at < ?)
            "#,
        )
        .bind(to_db(now))
        .bind(worker)
        .bind(to_db(now))
        .bind(id.0)
        .bind(to_db(stale_before))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn refresh_lock(&self, id: JobId, worker: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET locked_at = ?, updated_at = ?
            WHERE id = ? AND locked_by = ?
            "#,
        )
        .bind(to_db(now))
        .bind(to_db(now))
        .bind(id.0)
        .bind(worker)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn save_attempt(&self, job: &Job, holder: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET attempts = ?, run_at = ?, last_error = ?, failed_at = ?,
                locked_at = NULL, locked_by = NULL, updated_at = ?
            WHERE id = ? AND locked_by = ?
            "#,
        )
        .bind(i64::from(job.attempts))
        .bind(to_db(job.run_at))
        .bind(job.last_error.as_deref())
        .bind(job.failed_at.map(to_db))
        .bind(to_db(Utc::now()))
        .bind(job.id.0)
        .bind(holder)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, id: JobId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_if_held(&self, id: JobId, holder: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ? AND locked_by = ?")
            .bind(id.0)
            .bind(holder)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn clear_locks(&self, worker: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET locked_at = NULL, locked_by = NULL, updated_at = ?
            WHERE locked_by = ?
            "#,
        )
        .bind(to_db(Utc::now()))
        .bind(worker)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn failed_jobs(&self, limit: u32) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE failed_at IS NOT NULL
            ORDER BY failed_at DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| self.row_to_job(row)).collect()
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(locked_by) AS locked,
                COUNT(failed_at) AS failed
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.try_get("total")?;
        let locked: i64 = row.try_get("locked")?;
        let failed: i64 = row.try_get("failed")?;

        Ok(QueueStats {
            total: total.max(0) as u64,
            locked: locked.max(0) as u64,
            failed: failed.max(0) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{SubsecRound, TimeZone};

    #[test]
    fn stored_timestamps_keep_microseconds_and_order() {
        let whole = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let fractional = whole + chrono::Duration::microseconds(1);

        assert_eq!(to_db(whole), 1_704_067_200_000_000);
        assert!(to_db(whole) < to_db(fractional));
        assert_eq!(from_db("run_at", to_db(fractional)).unwrap(), fractional);
    }

    #[test]
    fn five_digit_years_order_and_read_back() {
        let last_four_digit = Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap();
        let five_digit = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();

        assert!(to_db(last_four_digit) < to_db(five_digit));
        assert_eq!(from_db("run_at", to_db(five_digit)).unwrap(), five_digit);
    }

    #[test]
    fn whole_chrono_range_round_trips() {
        for ts in [DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC.trunc_subsecs(6)] {
            assert_eq!(from_db("run_at", to_db(ts)).unwrap(), ts);
        }
        assert!(to_db(DateTime::<Utc>::MIN_UTC) < to_db(Utc::now()));
    }

    #[test]
    fn unrepresentable_timestamp_is_reported_with_column() {
        let err = from_db("run_at", i64::MAX).unwrap_err();
        assert!(matches!(err, StorageError::Timestamp { column: "run_at", .. }));
    }
}
