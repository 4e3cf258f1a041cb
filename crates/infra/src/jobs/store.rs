//! Job store abstraction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use queuectl_core::{ClaimedJob, DomainError, Job, JobId, JobState, NewJob};

use super::settings::SettingKey;

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

/// Error recorded on jobs returned to the queue by [`JobStore::recover_stale`].
pub const STALE_CLAIM_ERROR: &str = "claim expired; requeued";

/// Latest instant whose RFC 3339 form still sorts lexically (year 9999).
pub(crate) fn far_future() -> DateTime<Utc> {
    DateTime::from_timestamp(253_402_300_799, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at + by`, saturating at [`far_future`].
pub(crate) fn later_by(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .filter(|t| *t <= far_future())
        .unwrap_or_else(far_future)
}

/// `at - by`, saturating at the earliest representable instant.
pub(crate) fn earlier_by(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|d| at.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Number of jobs in each lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

impl JobCounts {
    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Dead => self.dead,
        }
    }

    pub fn add(&mut self, state: JobState, n: u64) {
        match state {
            JobState::Pending => self.pending += n,
            JobState::Processing => self.processing += n,
            JobState::Completed => self.completed += n,
            JobState::Failed => self.failed += n,
            JobState::Dead => self.dead += n,
        }
    }

    pub fn total(&self) -> u64 {
        JobState::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

/// Persistent table of job records.
///
/// Workers coordinate exclusively through [`JobStore::claim`]: no locks or
/// messages are exchanged between them. Every other mutation is a single-row
/// update keyed by job id.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job in `pending`.
    ///
    /// A missing `max_retries` takes the queue's configured default.
    async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError>;

    /// Claim the oldest eligible job.
    ///
    /// Selects the oldest-created job in `pending`/`failed` whose
    /// `next_attempt_at` is unset or elapsed, then moves it to `processing`
    /// with a conditional write that only succeeds if the row is unchanged.
    /// Losing that race yields `Ok(None)`, never a false claim and never a
    /// retry of the stale candidate.
    async fn claim(&self) -> Result<Option<ClaimedJob>, JobStoreError>;

    /// `processing → completed`, incrementing `attempts`.
    async fn record_success(&self, id: &JobId, output: &str) -> Result<(), JobStoreError>;

    /// `processing → failed`, incrementing `attempts` and scheduling the next
    /// attempt `delay` from now.
    async fn record_failure(
        &self,
        id: &JobId,
        error: &str,
        output: &str,
        delay: Duration,
    ) -> Result<(), JobStoreError>;

    /// `processing → dead`, incrementing `attempts`.
    async fn record_dead(&self, id: &JobId, error: &str, output: &str)
    -> Result<(), JobStoreError>;

    /// List jobs, optionally filtered by state, oldest first.
    async fn list_by_state(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError>;

    /// Count jobs per state.
    async fn count_by_state(&self) -> Result<JobCounts, JobStoreError>;

    /// Move a dead job back to `pending` with `attempts = 0` and no error or
    /// schedule. Jobs not currently dead report `NotFound`.
    async fn requeue_from_dead(&self, id: &JobId) -> Result<Job, JobStoreError>;

    /// Return jobs stuck in `processing` for at least `older_than` to
    /// `pending`. Operator-invoked only; `attempts` is left unchanged.
    async fn recover_stale(&self, older_than: Duration) -> Result<Vec<JobId>, JobStoreError>;

    /// Raw persisted setting value, if set.
    async fn get_setting(&self, key: SettingKey) -> Result<Option<String>, JobStoreError>;

    /// Persist a setting. Callers validate through [`super::QueueSettings::set`].
    async fn set_setting(&self, key: SettingKey, value: &str) -> Result<(), JobStoreError>;

    /// Release the underlying connection(s).
    async fn close(&self);
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
        (**self).insert(job).await
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(id).await
    }

    async fn claim(&self) -> Result<Option<ClaimedJob>, JobStoreError> {
        (**self).claim().await
    }

    async fn record_success(&self, id: &JobId, output: &str) -> Result<(), JobStoreError> {
        (**self).record_success(id, output).await
    }

    async fn record_failure(
        &self,
        id: &JobId,
        error: &str,
        output: &str,
        delay: Duration,
    ) -> Result<(), JobStoreError> {
        (**self).record_failure(id, error, output, delay).await
    }

    async fn record_dead(
        &self,
        id: &JobId,
        error: &str,
        output: &str,
    ) -> Result<(), JobStoreError> {
        (**self).record_dead(id, error, output).await
    }

    async fn list_by_state(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_state(state).await
    }

    async fn count_by_state(&self) -> Result<JobCounts, JobStoreError> {
        (**self).count_by_state().await
    }

    async fn requeue_from_dead(&self, id: &JobId) -> Result<Job, JobStoreError> {
        (**self).requeue_from_dead(id).await
    }

    async fn recover_stale(&self, older_than: Duration) -> Result<Vec<JobId>, JobStoreError> {
        (**self).recover_stale(older_than).await
    }

    async fn get_setting(&self, key: SettingKey) -> Result<Option<String>, JobStoreError> {
        (**self).get_setting(key).await
    }

    async fn set_setting(&self, key: SettingKey, value: &str) -> Result<(), JobStoreError> {
        (**self).set_setting(key, value).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}
