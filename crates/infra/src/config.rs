//! Runtime configuration from `QUEUECTL_*` environment variables.
//!
//! These are process-level knobs (paths, intervals). Queue policy that must
//! be shared by every worker (`max-retries`, `backoff-base`) lives in the
//! database instead; see [`crate::jobs::QueueSettings`].

use std::path::PathBuf;
use std::time::Duration;

use crate::workers::{ManagerConfig, WorkerConfig};

pub const ENV_DB_PATH: &str = "QUEUECTL_DB_PATH";
pub const ENV_PIDFILE: &str = "QUEUECTL_PIDFILE";
pub const ENV_POLL_INTERVAL_MS: &str = "QUEUECTL_POLL_INTERVAL_MS";
pub const ENV_JOB_TIMEOUT_SECS: &str = "QUEUECTL_JOB_TIMEOUT_SECS";
pub const ENV_SHUTDOWN_GRACE_MS: &str = "QUEUECTL_SHUTDOWN_GRACE_MS";
pub const ENV_SUPERVISE_INTERVAL_MS: &str = "QUEUECTL_SUPERVISE_INTERVAL_MS";

pub const DEFAULT_DB_PATH: &str = "queuectl.db";
pub const DEFAULT_PIDFILE: &str = "queuectl_worker.pid";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid value for {var}: '{value}' ({reason})")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub db_path: PathBuf,
    pub pidfile: PathBuf,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub shutdown_grace: Duration,
    pub supervise_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            pidfile: PathBuf::from(DEFAULT_PIDFILE),
            poll_interval: Duration::from_millis(1000),
            job_timeout: Duration::from_secs(3600),
            shutdown_grace: Duration::from_millis(5000),
            supervise_interval: Duration::from_millis(1000),
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Unset or blank variables take
    /// their defaults; anything else must parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            db_path: get(ENV_DB_PATH).map(PathBuf::from).unwrap_or(defaults.db_path),
            pidfile: get(ENV_PIDFILE).map(PathBuf::from).unwrap_or(defaults.pidfile),
            poll_interval: millis(ENV_POLL_INTERVAL_MS, get(ENV_POLL_INTERVAL_MS))?
                .unwrap_or(defaults.poll_interval),
            job_timeout: positive(ENV_JOB_TIMEOUT_SECS, get(ENV_JOB_TIMEOUT_SECS))?
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_timeout),
            shutdown_grace: millis(ENV_SHUTDOWN_GRACE_MS, get(ENV_SHUTDOWN_GRACE_MS))?
                .unwrap_or(defaults.shutdown_grace),
            supervise_interval: millis(ENV_SUPERVISE_INTERVAL_MS, get(ENV_SUPERVISE_INTERVAL_MS))?
                .unwrap_or(defaults.supervise_interval),
        })
    }

    /// Worker loop settings; the retry policy comes from the database.
    pub fn worker_config(&self, worker_id: u32) -> WorkerConfig {
        WorkerConfig::default()
            .with_worker_id(worker_id)
            .with_poll_interval(self.poll_interval)
            .with_job_timeout(self.job_timeout)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            grace_period: self.shutdown_grace,
            supervise_interval: self.supervise_interval,
            ..ManagerConfig::default()
        }
    }
}

fn positive(var: &'static str, raw: Option<String>) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError {
            var,
            value: raw,
            reason: "must be greater than zero",
        }),
        Ok(n) => Ok(Some(n)),
        Err(_) => Err(ConfigError {
            var,
            value: raw,
            reason: "expected a positive integer",
        }),
    }
}

fn millis(var: &'static str, raw: Option<String>) -> Result<Option<Duration>, ConfigError> {
    Ok(positive(var, raw)?.map(Duration::from_millis))
}
