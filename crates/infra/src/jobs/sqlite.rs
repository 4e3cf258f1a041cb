//! SQLite-backed job store.
//!
//! A single database file is shared by every worker process. Claims are
//! arbitrated by SQLite's write lock plus a conditional `UPDATE`; nothing else
//! is coordinated between workers.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use queuectl_core::{ClaimedJob, Job, JobId, JobState, NewJob};

use super::settings::SettingKey;
use super::store::{JobCounts, JobStore, JobStoreError, STALE_CLAIM_ERROR, earlier_by, later_by};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, created_at, updated_at, \
                           next_attempt_at, last_error, output";

/// SQLite job store.
///
/// Cheap to clone; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (creating if needed) the database at `path` and ensure the schema.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, JobStoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id              TEXT PRIMARY KEY,
                command         TEXT NOT NULL,
                state           TEXT NOT NULL,
                attempts        INTEGER NOT NULL DEFAULT 0,
                max_retries     INTEGER NOT NULL,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL,
                next_attempt_at TEXT NULL,
                last_error      TEXT NULL,
                output          TEXT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_jobs_table", e))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state_created ON jobs (state, created_at)")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_jobs_index", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_config_table", e))?;

        Ok(())
    }

    async fn default_max_retries(&self) -> Result<u32, JobStoreError> {
        match self.get_setting(SettingKey::MaxRetries).await? {
            Some(raw) => Ok(SettingKey::MaxRetries.parse_value(&raw)?),
            None => Ok(SettingKey::MaxRetries.default_value()),
        }
    }

    /// Single-row outcome write for the current holder of `processing`.
    async fn finish(
        &self,
        op: &str,
        id: &JobId,
        state: JobState,
        error: Option<&str>,
        output: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?1,
                attempts = attempts + 1,
                last_error = COALESCE(?2, last_error),
                output = ?3,
                next_attempt_at = ?4,
                updated_at = ?5
            WHERE id = ?6
              AND state = 'processing'
            "#,
        )
        .bind(state.as_str())
        .bind(error)
        .bind(output)
        .bind(next_attempt_at.map(fmt_ts))
        .bind(fmt_ts(Utc::now()))
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(op, e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
        let max_retries = match job.max_retries {
            Some(n) => n,
            None => self.default_max_retries().await?,
        };
        let now = Utc::now().trunc_subsecs(6);

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id,
                command,
                state,
                attempts,
                max_retries,
                created_at,
                updated_at,
                next_attempt_at,
                last_error,
                output
            )
            VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?5, NULL, NULL, NULL)
            "#,
        )
        .bind(job.id.as_str())
        .bind(&job.command)
        .bind(i64::from(job.attempts))
        .bind(i64::from(max_retries))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                JobStoreError::AlreadyExists(job.id.clone())
            }
            other => map_sqlx_error("insert", other),
        })?;

        Ok(Job {
            id: job.id,
            command: job.command,
            state: JobState::Pending,
            attempts: job.attempts,
            max_retries,
            created_at: now,
            updated_at: now,
            next_attempt_at: None,
            last_error: None,
            output: None,
        })
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(row_to_job).transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim(&self) -> Result<Option<ClaimedJob>, JobStoreError> {
        let now = fmt_ts(Utc::now());

        let candidate = sqlx::query(
            r#"
            SELECT id, command, state, attempts, max_retries, updated_at
            FROM jobs
            WHERE state IN ('pending', 'failed')
              AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
            ORDER BY created_at ASC, rowid ASC
            LIMIT 1
            "#,
        )
        .bind(&now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_select", e))?;

        let Some(row) = candidate else {
            return Ok(None);
        };

        let id: String = get_column(&row, "id")?;
        let state: String = get_column(&row, "state")?;
        let attempts: i64 = get_column(&row, "attempts")?;
        let seen_updated_at: String = get_column(&row, "updated_at")?;

        // Only wins if the row still looks exactly as selected.
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'processing',
                updated_at = ?1
            WHERE id = ?2
              AND state = ?3
              AND attempts = ?4
              AND updated_at = ?5
              AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
            "#,
        )
        .bind(&now)
        .bind(&id)
        .bind(&state)
        .bind(attempts)
        .bind(&seen_updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_update", e))?;

        if result.rows_affected() != 1 {
            debug!(job_id = %id, "claim lost to another worker");
            return Ok(None);
        }

        Ok(Some(ClaimedJob {
            id: parse_id(id)?,
            command: get_column(&row, "command")?,
            attempts: to_u32("attempts", attempts)?,
            max_retries: to_u32("max_retries", get_column(&row, "max_retries")?)?,
        }))
    }

    #[instrument(skip(self, output), fields(job_id = %id), err)]
    async fn record_success(&self, id: &JobId, output: &str) -> Result<(), JobStoreError> {
        self.finish("record_success", id, JobState::Completed, None, output, None)
            .await
    }

    #[instrument(skip(self, error, output), fields(job_id = %id), err)]
    async fn record_failure(
        &self,
        id: &JobId,
        error: &str,
        output: &str,
        delay: Duration,
    ) -> Result<(), JobStoreError> {
        let next = later_by(Utc::now(), delay);
        self.finish("record_failure", id, JobState::Failed, Some(error), output, Some(next))
            .await
    }

    #[instrument(skip(self, error, output), fields(job_id = %id), err)]
    async fn record_dead(
        &self,
        id: &JobId,
        error: &str,
        output: &str,
    ) -> Result<(), JobStoreError> {
        self.finish("record_dead", id, JobState::Dead, Some(error), output, None)
            .await
    }

    #[instrument(skip(self), err)]
    async fn list_by_state(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE (?1 IS NULL OR state = ?1) \
             ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(state.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_state", e))?;

        rows.iter().map(row_to_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn count_by_state(&self) -> Result<JobCounts, JobStoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_by_state", e))?;

        let mut counts = JobCounts::default();
        for row in &rows {
            let state: String = get_column(row, "state")?;
            let n: i64 = get_column(row, "n")?;
            counts.add(parse_state(&state)?, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn requeue_from_dead(&self, id: &JobId) -> Result<Job, JobStoreError> {
        let row = sqlx::query(&format!(
            "UPDATE jobs \
             SET state = 'pending', attempts = 0, next_attempt_at = NULL, \
                 last_error = NULL, updated_at = ?1 \
             WHERE id = ?2 AND state = 'dead' \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(fmt_ts(Utc::now()))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_from_dead", e))?;

        match row {
            Some(row) => row_to_job(&row),
            None => Err(JobStoreError::NotFound(id.clone())),
        }
    }

    #[instrument(skip(self), err)]
    async fn recover_stale(&self, older_than: Duration) -> Result<Vec<JobId>, JobStoreError> {
        let now = Utc::now();
        let rows = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending',
                next_attempt_at = NULL,
                last_error = ?1,
                updated_at = ?2
            WHERE state = 'processing'
              AND updated_at <= ?3
            RETURNING id
            "#,
        )
        .bind(STALE_CLAIM_ERROR)
        .bind(fmt_ts(now))
        .bind(fmt_ts(earlier_by(now, older_than)))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("recover_stale", e))?;

        rows.iter()
            .map(|row| parse_id(get_column(row, "id")?))
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn get_setting(&self, key: SettingKey) -> Result<Option<String>, JobStoreError> {
        let row = sqlx::query("SELECT value FROM config WHERE key = ?1")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_setting", e))?;

        row.as_ref().map(|r| get_column(r, "value")).transpose()
    }

    #[instrument(skip(self), err)]
    async fn set_setting(&self, key: SettingKey, value: &str) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO config (key, value)
            VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key.as_str())
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_setting", e))?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Fixed-width RFC 3339 so that text comparison matches time order.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(column: &str, raw: &str) -> Result<DateTime<Utc>, JobStoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| JobStoreError::Corrupt(format!("invalid {column} '{raw}': {e}")))
}

fn parse_state(raw: &str) -> Result<JobState, JobStoreError> {
    JobState::from_str(raw).map_err(|e| JobStoreError::Corrupt(format!("invalid state: {e}")))
}

fn parse_id(raw: String) -> Result<JobId, JobStoreError> {
    raw.parse()
        .map_err(|e| JobStoreError::Corrupt(format!("invalid job id: {e}")))
}

fn to_u32(column: &str, n: i64) -> Result<u32, JobStoreError> {
    u32::try_from(n).map_err(|_| JobStoreError::Corrupt(format!("{column} out of range: {n}")))
}

fn get_column<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T, JobStoreError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column)
        .map_err(|e| JobStoreError::Corrupt(format!("failed to read column {column}: {e}")))
}

fn row_to_job(row: &SqliteRow) -> Result<Job, JobStoreError> {
    let created_at: String = get_column(row, "created_at")?;
    let updated_at: String = get_column(row, "updated_at")?;
    let next_attempt_at: Option<String> = get_column(row, "next_attempt_at")?;
    let state: String = get_column(row, "state")?;

    Ok(Job {
        id: parse_id(get_column(row, "id")?)?,
        command: get_column(row, "command")?,
        state: parse_state(&state)?,
        attempts: to_u32("attempts", get_column(row, "attempts")?)?,
        max_retries: to_u32("max_retries", get_column(row, "max_retries")?)?,
        created_at: parse_ts("created_at", &created_at)?,
        updated_at: parse_ts("updated_at", &updated_at)?,
        next_attempt_at: next_attempt_at
            .as_deref()
            .map(|raw| parse_ts("next_attempt_at", raw))
            .transpose()?,
        last_error: get_column(row, "last_error")?,
        output: get_column(row, "output")?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Storage(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::ColumnDecode { index, source } => {
            JobStoreError::Corrupt(format!("failed to decode column {} in {}: {}", index, operation, source))
        }
        other => JobStoreError::Storage(format!("{} failed: {}", operation, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::QueueSettings;

    async fn open() -> (tempfile::TempDir, SqliteJobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobStore::connect(dir.path().join("queue.db")).await.unwrap();
        (dir, store)
    }

    fn new_job(id: &str, command: &str) -> NewJob {
        NewJob::new(command).unwrap().with_id(id.parse().unwrap())
    }

    #[test]
    fn timestamps_sort_lexically() {
        let earlier = DateTime::from_timestamp(1_700_000_000, 5_000).unwrap();
        let later = DateTime::from_timestamp(1_700_000_000, 900_000_000).unwrap();
        assert_eq!(fmt_ts(earlier), "2023-11-14T22:13:20.000005Z");
        assert!(fmt_ts(earlier) < fmt_ts(later));
        assert_eq!(parse_ts("t", &fmt_ts(later)).unwrap(), later);
    }

    #[tokio::test]
    async fn insert_get_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        let store = SqliteJobStore::connect(&path).await.unwrap();
        let job = store.insert(new_job("job1", "echo hi")).await.unwrap();
        assert_eq!(job.max_retries, 3);
        store.close().await;

        let reopened = SqliteJobStore::connect(&path).await.unwrap();
        let stored = reopened.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored, job);
        assert!(reopened.get(&"nope".parse().unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let (_dir, store) = open().await;
        store.insert(new_job("job1", "true")).await.unwrap();
        assert!(matches!(
            store.insert(new_job("job1", "false")).await,
            Err(JobStoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn insert_takes_configured_default_retries() {
        let (_dir, store) = open().await;
        QueueSettings::set(&store, SettingKey::MaxRetries, "7").await.unwrap();

        let defaulted = store.insert(new_job("a", "true")).await.unwrap();
        let explicit = store
            .insert(new_job("b", "true").with_max_retries(1))
            .await
            .unwrap();
        assert_eq!(defaulted.max_retries, 7);
        assert_eq!(explicit.max_retries, 1);
    }

    #[tokio::test]
    async fn claim_is_fifo_and_exclusive() {
        let (_dir, store) = open().await;
        for id in ["first", "second", "third"] {
            store.insert(new_job(id, "true")).await.unwrap();
        }

        let a = store.claim().await.unwrap().unwrap();
        let b = store.claim().await.unwrap().unwrap();
        let c = store.claim().await.unwrap().unwrap();
        assert_eq!(
            [a.id.as_str(), b.id.as_str(), c.id.as_str()],
            ["first", "second", "third"]
        );
        assert!(store.claim().await.unwrap().is_none());

        let counts = store.count_by_state().await.unwrap();
        assert_eq!(counts.processing, 3);
        assert_eq!(counts.total(), 3);
    }

    #[tokio::test]
    async fn outcomes_increment_attempts() {
        let (_dir, store) = open().await;
        let job = store.insert(new_job("job1", "exit 1")).await.unwrap();

        store.claim().await.unwrap().unwrap();
        store
            .record_failure(&job.id, "boom", "partial", Duration::ZERO)
            .await
            .unwrap();
        let failed = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));
        assert_eq!(failed.output.as_deref(), Some("partial"));

        let retry = store.claim().await.unwrap().unwrap();
        assert_eq!(retry.attempts, 1);
        store.record_dead(&job.id, "boom again", "").await.unwrap();

        let dead = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(dead.state, JobState::Dead);
        assert_eq!(dead.attempts, 2);
        assert!(store.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn backoff_blocks_reclaim() {
        let (_dir, store) = open().await;
        let job = store.insert(new_job("job1", "false")).await.unwrap();
        store.claim().await.unwrap().unwrap();
        store
            .record_failure(&job.id, "boom", "", Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(store.claim().await.unwrap().is_none());
        let stored = store.get(&job.id).await.unwrap().unwrap();
        assert!(stored.next_attempt_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn outcome_without_claim_is_not_found() {
        let (_dir, store) = open().await;
        let job = store.insert(new_job("job1", "true")).await.unwrap();
        assert!(matches!(
            store.record_success(&job.id, "out").await,
            Err(JobStoreError::NotFound(_))
        ));
        assert_eq!(store.get(&job.id).await.unwrap().unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn requeue_only_touches_dead_jobs() {
        let (_dir, store) = open().await;
        let job = store
            .insert(new_job("job1", "false").with_max_retries(0))
            .await
            .unwrap();

        assert!(matches!(
            store.requeue_from_dead(&job.id).await,
            Err(JobStoreError::NotFound(_))
        ));

        store.claim().await.unwrap().unwrap();
        store.record_dead(&job.id, "boom", "").await.unwrap();

        let requeued = store.requeue_from_dead(&job.id).await.unwrap();
        assert_eq!(requeued.state, JobState::Pending);
        assert_eq!(requeued.attempts, 0);
        assert_eq!(requeued.last_error, None);
        assert_eq!(requeued.next_attempt_at, None);
        assert!(store.claim().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_filters_by_state_in_creation_order() {
        let (_dir, store) = open().await;
        for id in ["a", "b", "c"] {
            store.insert(new_job(id, "true")).await.unwrap();
        }
        let claimed = store.claim().await.unwrap().unwrap();
        store.record_success(&claimed.id, "ok").await.unwrap();

        let all = store.list_by_state(None).await.unwrap();
        let ids: Vec<_> = all.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);

        let pending = store.list_by_state(Some(JobState::Pending)).await.unwrap();
        assert_eq!(pending.len(), 2);
        let completed = store.list_by_state(Some(JobState::Completed)).await.unwrap();
        assert_eq!(completed[0].output.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn recover_stale_requeues_without_counting_an_attempt() {
        let (_dir, store) = open().await;
        let job = store.insert(new_job("job1", "sleep 100")).await.unwrap();
        store.claim().await.unwrap().unwrap();

        assert!(store.recover_stale(Duration::from_secs(3600)).await.unwrap().is_empty());
        assert_eq!(store.recover_stale(Duration::ZERO).await.unwrap(), vec![job.id.clone()]);

        let stored = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Pending);
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.last_error.as_deref(), Some(STALE_CLAIM_ERROR));
    }

    #[tokio::test]
    async fn settings_upsert() {
        let (_dir, store) = open().await;
        assert_eq!(store.get_setting(SettingKey::BackoffBase).await.unwrap(), None);
        store.set_setting(SettingKey::BackoffBase, "3").await.unwrap();
        store.set_setting(SettingKey::BackoffBase, "4").await.unwrap();
        assert_eq!(
            store.get_setting(SettingKey::BackoffBase).await.unwrap().as_deref(),
            Some("4")
        );
    }
}
