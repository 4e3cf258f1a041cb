use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use queuectl_core::{ClaimedJob, RetryDecision, RetryPolicy};

use crate::jobs::{ExecutionResult, Executor, JobStore, JobStoreError};

/// Upper bound on the pause between outcome write attempts.
const MAX_RECORD_BACKOFF: Duration = Duration::from_secs(5);

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identifies this worker in logs.
    pub worker_id: u32,
    /// Sleep between claims when the queue is empty.
    pub poll_interval: Duration,
    /// Per-job execution timeout.
    pub job_timeout: Duration,
    pub retry: RetryPolicy,
    /// Tries at recording a job's outcome when the store reports a storage
    /// error (e.g. the database stayed locked past its busy timeout).
    pub record_attempts: u32,
    /// First pause between those tries; doubles up to 5s.
    pub record_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: 1,
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(3600),
            retry: RetryPolicy::default(),
            record_attempts: 10,
            record_backoff: Duration::from_millis(200),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, worker_id: u32) -> Self {
        self.worker_id = worker_id;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_job_timeout(mut self, job_timeout: Duration) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_record_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.record_attempts = attempts.max(1);
        self.record_backoff = backoff;
        self
    }
}

/// Lifecycle of a worker loop. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Running,
    Stopping,
    Stopped,
}

/// What happened to a job processed by one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Recorded as `failed`; eligible again after `delay`.
    Retrying { delay: Duration },
    DeadLettered,
    /// The job left `processing` while it ran (operator recovery), so the
    /// result was not recorded.
    Discarded,
}

/// Counters for one worker's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub worker_id: u32,
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_discarded: u64,
    pub store_errors: u64,
}

impl WorkerReport {
    fn record(&mut self, outcome: JobOutcome) {
        self.jobs_processed += 1;
        match outcome {
            JobOutcome::Completed => self.jobs_succeeded += 1,
            JobOutcome::Retrying { .. } => self.jobs_retried += 1,
            JobOutcome::DeadLettered => self.jobs_dead_lettered += 1,
            JobOutcome::Discarded => self.jobs_discarded += 1,
        }
    }
}

/// Claims and executes jobs one at a time until asked to stop.
///
/// Stopping is cooperative: the shutdown token is only observed between
/// iterations, so a job that has been claimed is always run and recorded.
/// A failed outcome write is retried with backoff; once shutdown is
/// requested the next failure is final and the job stays in `processing`
/// for `recover_stale`.
pub struct Worker<S, E> {
    store: S,
    executor: E,
    config: WorkerConfig,
    state: WorkerState,
}

impl<S: JobStore, E: Executor> Worker<S, E> {
    pub fn new(store: S, executor: E, config: WorkerConfig) -> Self {
        Self {
            store,
            executor,
            config,
            state: WorkerState::Running,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Run until `shutdown` is cancelled, then release the store.
    pub async fn run(&mut self, shutdown: CancellationToken) -> WorkerReport {
        let worker_id = self.config.worker_id;
        let mut report = WorkerReport {
            worker_id,
            ..WorkerReport::default()
        };
        info!(worker_id, "worker started");

        while !shutdown.is_cancelled() {
            match self.step(&shutdown).await {
                Ok(Some(outcome)) => report.record(outcome),
                Ok(None) => self.idle(&shutdown).await,
                Err(e) => {
                    report.store_errors += 1;
                    error!(worker_id, error = %e, "job store error");
                    self.idle(&shutdown).await;
                }
            }
        }

        self.state = WorkerState::Stopping;
        info!(worker_id, "worker stopping");
        self.store.close().await;
        self.state = WorkerState::Stopped;
        info!(
            worker_id,
            processed = report.jobs_processed,
            succeeded = report.jobs_succeeded,
            dead_lettered = report.jobs_dead_lettered,
            "worker stopped"
        );
        report
    }

    async fn idle(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }

    /// One iteration: claim, execute, record. `Ok(None)` when nothing was
    /// claimable (including a lost claim race).
    pub async fn run_once(&mut self) -> Result<Option<JobOutcome>, JobStoreError> {
        self.step(&CancellationToken::new()).await
    }

    async fn step(
        &mut self,
        shutdown: &CancellationToken,
    ) -> Result<Option<JobOutcome>, JobStoreError> {
        let worker_id = self.config.worker_id;
        let Some(job) = self.store.claim().await? else {
            return Ok(None);
        };

        let attempt = job.attempts + 1;
        info!(worker_id, job_id = %job.id, attempt, command = %job.command, "claimed job");

        let result = self.executor.run(&job.command, self.config.job_timeout).await;

        let outcome = match self.record_with_retry(&job, &result, attempt, shutdown).await {
            Ok(outcome) => outcome,
            Err(JobStoreError::NotFound(_)) => {
                warn!(worker_id, job_id = %job.id, "job left processing while running; result discarded");
                JobOutcome::Discarded
            }
            Err(e) => {
                error!(
                    worker_id,
                    job_id = %job.id,
                    attempt,
                    error = %e,
                    "giving up recording outcome; job left in processing"
                );
                return Err(e);
            }
        };

        match outcome {
            JobOutcome::Completed => {
                info!(worker_id, job_id = %job.id, attempt, "job completed");
            }
            JobOutcome::Retrying { delay } => {
                warn!(
                    worker_id,
                    job_id = %job.id,
                    attempt,
                    exit_code = result.exit_code,
                    retry_in_secs = delay.as_secs(),
                    "job failed; retry scheduled"
                );
            }
            JobOutcome::DeadLettered => {
                warn!(
                    worker_id,
                    job_id = %job.id,
                    attempt,
                    exit_code = result.exit_code,
                    "job moved to dead letter queue"
                );
            }
            JobOutcome::Discarded => {
                debug!(worker_id, job_id = %job.id, "outcome not recorded");
            }
        }

        Ok(Some(outcome))
    }

    /// Retry storage errors until the write lands, the store answers with
    /// anything else, the attempts run out, or shutdown is requested.
    async fn record_with_retry(
        &self,
        job: &ClaimedJob,
        result: &ExecutionResult,
        attempt: u32,
        shutdown: &CancellationToken,
    ) -> Result<JobOutcome, JobStoreError> {
        let worker_id = self.config.worker_id;
        let mut backoff = self.config.record_backoff;
        let mut tries = 1;
        loop {
            match self.record(job, result, attempt).await {
                Err(JobStoreError::Storage(e))
                    if tries < self.config.record_attempts && !shutdown.is_cancelled() =>
                {
                    warn!(
                        worker_id,
                        job_id = %job.id,
                        tries,
                        retry_in_ms = backoff.as_millis() as u64,
                        error = %e,
                        "failed to record outcome; retrying"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_RECORD_BACKOFF);
                    tries += 1;
                }
                other => return other,
            }
        }
    }

    async fn record(
        &self,
        job: &ClaimedJob,
        result: &ExecutionResult,
        attempt: u32,
    ) -> Result<JobOutcome, JobStoreError> {
        if result.succeeded() {
            return self
                .store
                .record_success(&job.id, &result.stdout)
                .await
                .map(|()| JobOutcome::Completed);
        }
        let message = result.error_message();
        match self.config.retry.decide(attempt, job.max_retries) {
            RetryDecision::Retry { delay } => self
                .store
                .record_failure(&job.id, &message, &result.stdout, delay)
                .await
                .map(|()| JobOutcome::Retrying { delay }),
            RetryDecision::DeadLetter => self
                .store
                .record_dead(&job.id, &message, &result.stdout)
                .await
                .map(|()| JobOutcome::DeadLettered),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use queuectl_core::{Job, JobId, JobState, NewJob};

    use super::*;
    use crate::jobs::{ExecutionKind, InMemoryJobStore, JobCounts, SettingKey};

    /// Understands `exit N`; anything else succeeds and echoes the command.
    struct FakeExecutor;

    #[async_trait]
    impl Executor for FakeExecutor {
        async fn run(&self, command: &str, _timeout: Duration) -> ExecutionResult {
            let code = command
                .strip_prefix("exit ")
                .and_then(|n| n.trim().parse().ok())
                .unwrap_or(0);
            ExecutionResult {
                kind: if code == 0 {
                    ExecutionKind::Succeeded
                } else {
                    ExecutionKind::Exited
                },
                exit_code: code,
                stdout: format!("ran {command}"),
                stderr: if code == 0 { String::new() } else { format!("failed with {code}") },
            }
        }
    }

    fn worker(store: Arc<InMemoryJobStore>) -> Worker<Arc<InMemoryJobStore>, FakeExecutor> {
        let config = WorkerConfig::default().with_poll_interval(Duration::from_millis(10));
        Worker::new(store, FakeExecutor, config)
    }

    async fn enqueue(store: &InMemoryJobStore, id: &str, command: &str, max_retries: u32) {
        let job = NewJob::new(command)
            .unwrap()
            .with_id(id.parse().unwrap())
            .with_max_retries(max_retries);
        store.insert(job).await.unwrap();
    }

    #[tokio::test]
    async fn success_completes_with_one_attempt() {
        let store = InMemoryJobStore::arc();
        enqueue(&store, "ok", "exit 0", 3).await;

        let outcome = worker(store.clone()).run_once().await.unwrap();
        assert_eq!(outcome, Some(JobOutcome::Completed));

        let job = store.get(&"ok".parse().unwrap()).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.output.as_deref(), Some("ran exit 0"));
    }

    #[tokio::test]
    async fn zero_retries_dead_letters_on_first_failure() {
        let store = InMemoryJobStore::arc();
        enqueue(&store, "bad", "exit 1", 0).await;

        let outcome = worker(store.clone()).run_once().await.unwrap();
        assert_eq!(outcome, Some(JobOutcome::DeadLettered));

        let job = store.get(&"bad".parse().unwrap()).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("failed with 1"));
    }

    #[tokio::test]
    async fn retries_back_off_then_dead_letter() {
        let store = InMemoryJobStore::arc();
        enqueue(&store, "flaky", "exit 2", 2).await;
        let mut worker = worker(store.clone());
        let id = "flaky".parse().unwrap();

        assert_eq!(
            worker.run_once().await.unwrap(),
            Some(JobOutcome::Retrying { delay: Duration::from_secs(2) })
        );
        assert_eq!(store.get(&id).await.unwrap().unwrap().state, JobState::Failed);
        // Still backing off.
        assert_eq!(worker.run_once().await.unwrap(), None);

        store.expire_backoff();
        assert_eq!(
            worker.run_once().await.unwrap(),
            Some(JobOutcome::Retrying { delay: Duration::from_secs(4) })
        );

        store.expire_backoff();
        assert_eq!(worker.run_once().await.unwrap(), Some(JobOutcome::DeadLettered));

        let job = store.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 3);
    }

    #[tokio::test]
    async fn empty_queue_yields_none() {
        let store = InMemoryJobStore::arc();
        assert_eq!(worker(store).run_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn run_drains_queue_and_stops_on_cancel() {
        let store = InMemoryJobStore::arc();
        for i in 0..5 {
            enqueue(&store, &format!("job-{i}"), "exit 0", 3).await;
        }

        let mut worker = worker(store.clone());
        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let watcher = store.clone();
        tokio::spawn(async move {
            while watcher.count_by_state().await.unwrap().completed < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            stopper.cancel();
        });

        let report = tokio::time::timeout(Duration::from_secs(5), worker.run(shutdown))
            .await
            .unwrap();
        assert_eq!(report.jobs_processed, 5);
        assert_eq!(report.jobs_succeeded, 5);
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn cancelled_before_start_processes_nothing() {
        let store = InMemoryJobStore::arc();
        enqueue(&store, "a", "exit 0", 3).await;

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let mut worker = worker(store.clone());
        let report = worker.run(shutdown).await;

        assert_eq!(report.jobs_processed, 0);
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(store.count_by_state().await.unwrap().pending, 1);
    }

    /// Delegates to an in-memory store, but the first `failures` outcome
    /// writes report a locked database.
    struct LockedStore {
        inner: Arc<InMemoryJobStore>,
        failures: AtomicU32,
    }

    impl LockedStore {
        fn new(inner: Arc<InMemoryJobStore>, failures: u32) -> Self {
            Self {
                inner,
                failures: AtomicU32::new(failures),
            }
        }

        fn fail_write(&self) -> Result<(), JobStoreError> {
            let took = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            match took {
                Ok(_) => Err(JobStoreError::Storage("database is locked".to_string())),
                Err(_) => Ok(()),
            }
        }
    }

    #[async_trait]
    impl JobStore for LockedStore {
        async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
            self.inner.insert(job).await
        }

        async fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
            self.inner.get(id).await
        }

        async fn claim(&self) -> Result<Option<ClaimedJob>, JobStoreError> {
            self.inner.claim().await
        }

        async fn record_success(&self, id: &JobId, output: &str) -> Result<(), JobStoreError> {
            self.fail_write()?;
            self.inner.record_success(id, output).await
        }

        async fn record_failure(
            &self,
            id: &JobId,
            error: &str,
            output: &str,
            delay: Duration,
        ) -> Result<(), JobStoreError> {
            self.fail_write()?;
            self.inner.record_failure(id, error, output, delay).await
        }

        async fn record_dead(
            &self,
            id: &JobId,
            error: &str,
            output: &str,
        ) -> Result<(), JobStoreError> {
            self.fail_write()?;
            self.inner.record_dead(id, error, output).await
        }

        async fn list_by_state(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list_by_state(state).await
        }

        async fn count_by_state(&self) -> Result<JobCounts, JobStoreError> {
            self.inner.count_by_state().await
        }

        async fn requeue_from_dead(&self, id: &JobId) -> Result<Job, JobStoreError> {
            self.inner.requeue_from_dead(id).await
        }

        async fn recover_stale(&self, older_than: Duration) -> Result<Vec<JobId>, JobStoreError> {
            self.inner.recover_stale(older_than).await
        }

        async fn get_setting(&self, key: SettingKey) -> Result<Option<String>, JobStoreError> {
            self.inner.get_setting(key).await
        }

        async fn set_setting(&self, key: SettingKey, value: &str) -> Result<(), JobStoreError> {
            self.inner.set_setting(key, value).await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    fn locked_worker(store: LockedStore, attempts: u32) -> Worker<LockedStore, FakeExecutor> {
        let config = WorkerConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_record_retry(attempts, Duration::from_millis(5));
        Worker::new(store, FakeExecutor, config)
    }

    #[tokio::test]
    async fn locked_database_does_not_lose_a_success() {
        let inner = InMemoryJobStore::arc();
        enqueue(&inner, "ok", "exit 0", 3).await;

        let mut worker = locked_worker(LockedStore::new(inner.clone(), 1), 5);
        assert_eq!(worker.run_once().await.unwrap(), Some(JobOutcome::Completed));

        let job = inner.get(&"ok".parse().unwrap()).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.output.as_deref(), Some("ran exit 0"));
    }

    #[tokio::test]
    async fn locked_database_does_not_lose_a_failure() {
        let inner = InMemoryJobStore::arc();
        enqueue(&inner, "bad", "exit 4", 0).await;

        let mut worker = locked_worker(LockedStore::new(inner.clone(), 3), 5);
        assert_eq!(worker.run_once().await.unwrap(), Some(JobOutcome::DeadLettered));

        let job = inner.get(&"bad".parse().unwrap()).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn outcome_write_gives_up_after_bounded_attempts() {
        let inner = InMemoryJobStore::arc();
        enqueue(&inner, "ok", "exit 0", 3).await;

        let mut worker = locked_worker(LockedStore::new(inner.clone(), u32::MAX), 3);
        assert!(matches!(
            worker.run_once().await,
            Err(JobStoreError::Storage(_))
        ));

        // Left for operator recovery, not silently completed or lost.
        let job = inner.get(&"ok".parse().unwrap()).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.attempts, 0);
        assert_eq!(inner.recover_stale(Duration::ZERO).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_outcome_retries() {
        let inner = InMemoryJobStore::arc();
        enqueue(&inner, "ok", "exit 0", 3).await;

        let mut worker = locked_worker(LockedStore::new(inner.clone(), u32::MAX), u32::MAX);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), worker.step(&shutdown))
            .await
            .unwrap();
        assert!(matches!(result, Err(JobStoreError::Storage(_))));
    }

    #[tokio::test]
    async fn recovered_job_result_is_discarded() {
        struct RecoveringExecutor(Arc<InMemoryJobStore>);

        #[async_trait]
        impl Executor for RecoveringExecutor {
            async fn run(&self, _command: &str, _timeout: Duration) -> ExecutionResult {
                self.0.recover_stale(Duration::ZERO).await.unwrap();
                ExecutionResult {
                    kind: ExecutionKind::Succeeded,
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                }
            }
        }

        let store = InMemoryJobStore::arc();
        enqueue(&store, "a", "true", 3).await;
        let mut worker = Worker::new(
            store.clone(),
            RecoveringExecutor(store.clone()),
            WorkerConfig::default(),
        );

        assert_eq!(worker.run_once().await.unwrap(), Some(JobOutcome::Discarded));
        let job = store.get(&"a".parse().unwrap()).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
    }
}
