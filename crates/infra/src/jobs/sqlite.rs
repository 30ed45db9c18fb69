//! SQLite-backed job store.
//!
//! ## Schema
//!
//! One `jobs` table. The job state is encoded in two nullable timestamps:
//!
//! | `available_at` | `reserved_at` | state     |
//! |----------------|---------------|-----------|
//! | set            | null          | available |
//! | set            | set           | reserved  |
//! | null           | null          | killed    |
//!
//! Timestamps are fixed-width RFC 3339 UTC strings with microsecond precision,
//! so text comparison in SQL orders them chronologically.
//!
//! ## Concurrency
//!
//! Every write is one autocommit statement. Transitions are optimistic: the
//! row is read, the transition runs in Rust, and the write only lands if the
//! row still holds the values that were read. A consumer that loses the race
//! re-reads and tries again. This keeps reservation exclusive across
//! connections and processes sharing the database file.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{FromRow, Row, SqlitePool};
use tracing::{debug, instrument};

use kew_core::{is_storable, Job, JobError, JobId, JobState, RetryStrategy};

use super::error::StoreError;
use super::store::{JobStore, QueueStats};
use crate::config::QueueConfig;

/// Upper bound on optimistic retries for one operation.
const MAX_CAS_ATTEMPTS: usize = 64;

/// SQLite job store.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (creating if needed) the database named by `config` and make
    /// sure the schema exists.
    ///
    /// File databases use WAL journaling so readers never block the writer.
    #[instrument(skip(config), fields(database_url = %config.database_url), err)]
    pub async fn connect(config: &QueueConfig) -> Result<Self, StoreError> {
        let mut options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(|e| map_sqlx_error("parse_database_url", e))?
            .create_if_missing(true)
            .busy_timeout(config.busy_timeout);

        let pool_options = if config.is_in_memory() {
            // The database lives only as long as its connection.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            options = options.journal_mode(SqliteJournalMode::Wal);
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, bootstrapping the schema.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Create the table and index if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id              TEXT PRIMARY KEY,
                created_at      TEXT NOT NULL,
                available_at    TEXT NULL,
                reserved_at     TEXT NULL,
                attempts        INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
                retry_intervals TEXT NOT NULL,
                payload         TEXT NOT NULL,
                CHECK (reserved_at IS NULL OR available_at IS NOT NULL)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_jobs_table", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS jobs_eligible ON jobs (reserved_at, available_at, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_jobs_index", e))?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, created_at, available_at, reserved_at, attempts, retry_intervals, payload
            FROM jobs
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|row| decode_row(&row)).transpose()
    }

    async fn next_candidate(&self, now: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, created_at, available_at, reserved_at, attempts, retry_intervals, payload
            FROM jobs
            WHERE reserved_at IS NULL
              AND available_at IS NOT NULL
              AND available_at <= ?
            ORDER BY available_at ASC, created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_next_job", e))?;

        row.map(|row| decode_row(&row)).transpose()
    }

    /// Write `next`'s state if the row still matches `current`.
    ///
    /// Returns `false` when another writer got there first.
    async fn compare_and_swap(&self, current: &Job, next: &Job) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET available_at = ?, reserved_at = ?, attempts = ?
            WHERE id = ?
              AND available_at IS ?
              AND reserved_at IS ?
              AND attempts = ?
            "#,
        )
        .bind(next.state.available_at().map(encode_timestamp))
        .bind(next.state.reserved_at().map(encode_timestamp))
        .bind(i64::from(next.attempts))
        .bind(current.id.to_string())
        .bind(current.state.available_at().map(encode_timestamp))
        .bind(current.state.reserved_at().map(encode_timestamp))
        .bind(i64::from(current.attempts))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job_state", e))?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let instants = [Some(job.created_at), job.state.available_at(), job.state.reserved_at()];
        if let Some(at) = instants.into_iter().flatten().find(|at| !is_storable(*at)) {
            return Err(StoreError::Rejected(JobError::invalid_argument(format!(
                "timestamp {at} of job {} cannot be stored",
                job.id
            ))));
        }

        let payload = serde_json::json!({
            "type": job.job_type,
            "arguments": job.arguments,
        });
        let retry_intervals = serde_json::to_string(&job.retry_strategy)
            .map_err(|e| StoreError::corrupt(job.id.to_string(), e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, created_at, available_at, reserved_at, attempts, retry_intervals, payload)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.to_string())
        .bind(encode_timestamp(job.created_at))
        .bind(job.state.available_at().map(encode_timestamp))
        .bind(job.state.reserved_at().map(encode_timestamp))
        .bind(i64::from(job.attempts))
        .bind(retry_intervals)
        .bind(payload.to_string())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StoreError::AlreadyExists(job.id))
            }
            Err(e) => Err(map_sqlx_error("insert_job", e)),
        }
    }

    async fn reserve_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let now_column = encode_timestamp(now);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(current) = self.next_candidate(&now_column).await? else {
                return Ok(None);
            };

            let mut reserved = current.clone();
            reserved.reserve(now)?;

            if self.compare_and_swap(&current, &reserved).await? {
                return Ok(Some(reserved));
            }
            debug!(job_id = %current.id, "lost reservation race, selecting again");
        }

        Err(StoreError::Contention("next eligible job".to_string()))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.fetch(id).await
    }

    async fn remove(&self, id: JobId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn update<T, F>(&self, id: JobId, mut apply: F) -> Result<(Job, T), StoreError>
    where
        F: FnMut(&mut Job) -> Result<T, JobError> + Send,
        T: Send,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.fetch(id).await?.ok_or(StoreError::NotFound(id))?;

            let mut next = current.clone();
            let output = apply(&mut next)?;

            if self.compare_and_swap(&current, &next).await? {
                return Ok((next, output));
            }
            debug!(job_id = %id, "concurrent update detected, retrying");
        }

        Err(StoreError::Contention(id.to_string()))
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, StoreError> {
        let now = encode_timestamp(now);
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN available_at IS NULL THEN 1 ELSE 0 END), 0) AS killed,
                COALESCE(SUM(CASE WHEN reserved_at IS NOT NULL THEN 1 ELSE 0 END), 0) AS reserved,
                COALESCE(SUM(CASE WHEN reserved_at IS NULL AND available_at <= ? THEN 1 ELSE 0 END), 0) AS available,
                COALESCE(SUM(CASE WHEN reserved_at IS NULL AND available_at > ? THEN 1 ELSE 0 END), 0) AS scheduled
            FROM jobs
            "#,
        )
        .bind(now.as_str())
        .bind(now.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("job_stats", e))?;

        Ok(QueueStats {
            available: count(&row, "available")?,
            scheduled: count(&row, "scheduled")?,
            reserved: count(&row, "reserved")?,
            killed: count(&row, "killed")?,
        })
    }
}

/// JSON stored in the `payload` column.
#[derive(Deserialize)]
struct Payload {
    #[serde(rename = "type")]
    job_type: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

struct JobRow {
    id: String,
    created_at: String,
    available_at: Option<String>,
    reserved_at: Option<String>,
    attempts: i64,
    retry_intervals: String,
    payload: String,
}

impl<'r> FromRow<'r, SqliteRow> for JobRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            created_at: row.try_get("created_at")?,
            available_at: row.try_get("available_at")?,
            reserved_at: row.try_get("reserved_at")?,
            attempts: row.try_get("attempts")?,
            retry_intervals: row.try_get("retry_intervals")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::corrupt(row.id.clone(), reason);

        let id = JobId::from_str(&row.id).map_err(|e| corrupt(e.to_string()))?;
        let created_at = decode_timestamp(&row.created_at).map_err(&corrupt)?;
        let available_at = row
            .available_at
            .as_deref()
            .map(decode_timestamp)
            .transpose()
            .map_err(&corrupt)?;
        let reserved_at = row
            .reserved_at
            .as_deref()
            .map(decode_timestamp)
            .transpose()
            .map_err(&corrupt)?;
        let state = JobState::from_columns(available_at, reserved_at)
            .ok_or_else(|| corrupt("reserved job has no availability time".to_string()))?;
        let attempts = u32::try_from(row.attempts)
            .map_err(|_| corrupt(format!("attempts out of range: {}", row.attempts)))?;
        let retry_strategy: RetryStrategy = serde_json::from_str(&row.retry_intervals)
            .map_err(|e| corrupt(format!("retry_intervals: {e}")))?;
        let payload: Payload = serde_json::from_str(&row.payload)
            .map_err(|e| corrupt(format!("payload: {e}")))?;

        Ok(Job {
            id,
            job_type: payload.job_type,
            arguments: payload.arguments,
            created_at,
            state,
            attempts,
            retry_strategy,
        })
    }
}

fn decode_row(row: &SqliteRow) -> Result<Job, StoreError> {
    let row = JobRow::from_row(row).map_err(|e| map_sqlx_error("decode_job_row", e))?;
    Job::try_from(row)
}

fn count(row: &SqliteRow, column: &str) -> Result<usize, StoreError> {
    let value: i64 = row
        .try_get(column)
        .map_err(|e| map_sqlx_error("job_stats", e))?;
    usize::try_from(value).map_err(|_| StoreError::Storage(format!("negative {column} count")))
}

fn encode_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp {raw:?}: {e}"))
}

/// Map sqlx errors to store errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Storage(format!("timed out waiting for a connection in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        other => StoreError::Storage(format!("{} failed: {}", operation, other)),
    }
}
