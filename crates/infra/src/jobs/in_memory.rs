//! In-memory job store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use queuectl_core::{ClaimedJob, Job, JobId, JobState, NewJob};

use super::settings::SettingKey;
use super::store::{JobCounts, JobStore, JobStoreError, STALE_CLAIM_ERROR, earlier_by, later_by};

#[derive(Debug, Default)]
struct Inner {
    /// Insertion order doubles as the FIFO tie-breaker.
    jobs: Vec<Job>,
    settings: HashMap<SettingKey, String>,
}

/// In-memory job store.
///
/// Claims are serialized by a single mutex, so the conditional transition is
/// trivially atomic. Shares the [`JobStore`] contract with the SQLite store.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, JobStoreError> {
        self.inner
            .lock()
            .map_err(|_| JobStoreError::Storage("in-memory store lock poisoned".to_string()))
    }

    /// Make every scheduled retry due immediately.
    #[cfg(test)]
    pub(crate) fn expire_backoff(&self) {
        if let Ok(mut inner) = self.lock() {
            let now = Utc::now();
            for job in inner.jobs.iter_mut().filter(|j| j.next_attempt_at.is_some()) {
                job.next_attempt_at = Some(now);
            }
        }
    }

    fn finish(
        &self,
        id: &JobId,
        apply: impl FnOnce(&mut Job),
    ) -> Result<(), JobStoreError> {
        let mut inner = self.lock()?;
        let job = inner
            .jobs
            .iter_mut()
            .find(|j| &j.id == id && j.state == JobState::Processing)
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))?;
        job.attempts += 1;
        job.updated_at = Utc::now();
        apply(job);
        Ok(())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
        let mut inner = self.lock()?;
        if inner.jobs.iter().any(|j| j.id == job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }

        let max_retries = match job.max_retries {
            Some(n) => n,
            None => match inner.settings.get(&SettingKey::MaxRetries) {
                Some(raw) => SettingKey::MaxRetries.parse_value(raw)?,
                None => SettingKey::MaxRetries.default_value(),
            },
        };

        let now = Utc::now();
        let record = Job {
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
        };
        inner.jobs.push(record.clone());
        Ok(record)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        let inner = self.lock()?;
        Ok(inner.jobs.iter().find(|j| &j.id == id).cloned())
    }

    async fn claim(&self) -> Result<Option<ClaimedJob>, JobStoreError> {
        let mut inner = self.lock()?;
        let now = Utc::now();

        // Stable sort keeps insertion order among equal timestamps.
        let mut candidates: Vec<usize> = (0..inner.jobs.len())
            .filter(|&i| inner.jobs[i].is_eligible_at(now))
            .collect();
        candidates.sort_by_key(|&i| inner.jobs[i].created_at);

        let Some(&idx) = candidates.first() else {
            return Ok(None);
        };

        let job = &mut inner.jobs[idx];
        job.state = JobState::Processing;
        job.updated_at = now;
        Ok(Some(ClaimedJob {
            id: job.id.clone(),
            command: job.command.clone(),
            attempts: job.attempts,
            max_retries: job.max_retries,
        }))
    }

    async fn record_success(&self, id: &JobId, output: &str) -> Result<(), JobStoreError> {
        self.finish(id, |job| {
            job.state = JobState::Completed;
            job.output = Some(output.to_string());
        })
    }

    async fn record_failure(
        &self,
        id: &JobId,
        error: &str,
        output: &str,
        delay: Duration,
    ) -> Result<(), JobStoreError> {
        self.finish(id, |job| {
            job.state = JobState::Failed;
            job.last_error = Some(error.to_string());
            job.output = Some(output.to_string());
            job.next_attempt_at = Some(later_by(job.updated_at, delay));
        })
    }

    async fn record_dead(
        &self,
        id: &JobId,
        error: &str,
        output: &str,
    ) -> Result<(), JobStoreError> {
        self.finish(id, |job| {
            job.state = JobState::Dead;
            job.last_error = Some(error.to_string());
            job.output = Some(output.to_string());
        })
    }

    async fn list_by_state(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.lock()?;
        let mut result: Vec<Job> = inner
            .jobs
            .iter()
            .filter(|j| state.is_none_or(|s| j.state == s))
            .cloned()
            .collect();
        result.sort_by_key(|j| j.created_at);
        Ok(result)
    }

    async fn count_by_state(&self) -> Result<JobCounts, JobStoreError> {
        let inner = self.lock()?;
        let mut counts = JobCounts::default();
        for job in &inner.jobs {
            counts.add(job.state, 1);
        }
        Ok(counts)
    }

    async fn requeue_from_dead(&self, id: &JobId) -> Result<Job, JobStoreError> {
        let mut inner = self.lock()?;
        let job = inner
            .jobs
            .iter_mut()
            .find(|j| &j.id == id && j.state == JobState::Dead)
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))?;

        job.state = JobState::Pending;
        job.attempts = 0;
        job.next_attempt_at = None;
        job.last_error = None;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn recover_stale(&self, older_than: Duration) -> Result<Vec<JobId>, JobStoreError> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let cutoff = earlier_by(now, older_than);

        let mut recovered = Vec::new();
        for job in inner
            .jobs
            .iter_mut()
            .filter(|j| j.state == JobState::Processing && j.updated_at <= cutoff)
        {
            job.state = JobState::Pending;
            job.next_attempt_at = None;
            job.last_error = Some(STALE_CLAIM_ERROR.to_string());
            job.updated_at = now;
            recovered.push(job.id.clone());
        }
        Ok(recovered)
    }

    async fn get_setting(&self, key: SettingKey) -> Result<Option<String>, JobStoreError> {
        Ok(self.lock()?.settings.get(&key).cloned())
    }

    async fn set_setting(&self, key: SettingKey, value: &str) -> Result<(), JobStoreError> {
        self.lock()?.settings.insert(key, value.to_string());
        Ok(())
    }

    async fn close(&self) {}
}
