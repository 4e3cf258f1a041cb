//! Job record, lifecycle states, and enqueue validation.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Retry ceiling applied when neither the payload nor the queue settings say otherwise.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lifecycle state of a job.
///
/// ```text
/// pending ──claim──▶ processing ──ok──▶ completed
///    ▲                  │   │
///    │                  │   └──fail, attempts > max──▶ dead
///    │                  └──fail──▶ failed ──backoff elapses, claim──▶ processing
///    └──────────── operator requeue ◀────────────────── dead
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    /// States a worker may claim from (subject to `next_attempt_at`).
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Failed)
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(DomainError::invalid_state(other.to_string())),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub state: JobState,
    /// Execution attempts made so far.
    pub attempts: u32,
    pub max_retries: u32,
    /// FIFO ordering key for claim eligibility.
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Not claimable before this instant when set.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub output: Option<String>,
}

impl Job {
    /// Whether a worker could claim this job at `now`.
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        self.state.is_claimable() && self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

/// A job as handed to a worker by a successful claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub id: JobId,
    pub command: String,
    /// Attempts made before this one.
    pub attempts: u32,
    pub max_retries: u32,
}

/// Validated enqueue request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub id: JobId,
    pub command: String,
    /// `None` defers to the queue's configured default.
    pub max_retries: Option<u32>,
    pub attempts: u32,
}

impl NewJob {
    pub fn new(command: impl Into<String>) -> DomainResult<Self> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(DomainError::validation("job 'command' must not be empty"));
        }
        Ok(Self {
            id: JobId::generate(),
            command,
            max_retries: None,
            attempts: 0,
        })
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Parse an enqueue payload such as
    /// `{"id": "job1", "command": "echo hi", "max_retries": 2}`.
    ///
    /// Only `command` is required. Nothing is written when this fails.
    pub fn from_json(raw: &str) -> DomainResult<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| DomainError::validation(format!("invalid JSON for job data: {e}")))?;

        let obj = value
            .as_object()
            .ok_or_else(|| DomainError::validation("job data must be a JSON object"))?;

        let command = match obj.get("command") {
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(DomainError::validation("job 'command' must be a string")),
            None => return Err(DomainError::validation("job must contain a 'command' field")),
        };

        let mut job = NewJob::new(command)?;

        match obj.get("id") {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) => job = job.with_id(s.parse()?),
            Some(_) => return Err(DomainError::validation("job 'id' must be a string")),
        }

        if let Some(v) = obj.get("max_retries").filter(|v| !v.is_null()) {
            job.max_retries = Some(non_negative(v, "max_retries")?);
        }

        if let Some(v) = obj.get("attempts").filter(|v| !v.is_null()) {
            job.attempts = non_negative(v, "attempts")?;
        }

        Ok(job)
    }
}

fn non_negative(value: &Value, field: &str) -> DomainResult<u32> {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| {
            DomainError::validation(format!("job '{field}' must be a non-negative integer"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn state_names_round_trip_through_parse() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!(matches!(
            "running".parse::<JobState>(),
            Err(DomainError::InvalidState(_))
        ));
    }

    #[test]
    fn from_json_requires_command() {
        let err = NewJob::from_json(r#"{"id": "job1"}"#).unwrap_err();
        assert_eq!(
            err,
            DomainError::validation("job must contain a 'command' field")
        );
    }

    #[test]
    fn from_json_rejects_malformed_payloads() {
        assert!(NewJob::from_json("not json").is_err());
        assert!(NewJob::from_json(r#"["echo"]"#).is_err());
        assert!(NewJob::from_json(r#"{"command": 42}"#).is_err());
        assert!(NewJob::from_json(r#"{"command": "   "}"#).is_err());
        assert!(NewJob::from_json(r#"{"command": "true", "max_retries": -1}"#).is_err());
        assert!(NewJob::from_json(r#"{"command": "true", "id": 7}"#).is_err());
    }

    #[test]
    fn from_json_keeps_supplied_fields() {
        let job =
            NewJob::from_json(r#"{"id": "job1", "command": "echo hi", "max_retries": 2}"#).unwrap();
        assert_eq!(job.id.as_str(), "job1");
        assert_eq!(job.command, "echo hi");
        assert_eq!(job.max_retries, Some(2));
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn from_json_generates_id_when_absent() {
        let job = NewJob::from_json(r#"{"command": "echo hi"}"#).unwrap();
        assert!(!job.id.as_str().is_empty());
        assert_eq!(job.max_retries, None);
    }

    #[test]
    fn eligibility_respects_backoff() {
        let now = Utc::now();
        let mut job = Job {
            id: JobId::generate(),
            command: "true".into(),
            state: JobState::Failed,
            attempts: 1,
            max_retries: 3,
            created_at: now,
            updated_at: now,
            next_attempt_at: Some(now + Duration::seconds(2)),
            last_error: None,
            output: None,
        };
        assert!(!job.is_eligible_at(now));
        assert!(job.is_eligible_at(now + Duration::seconds(2)));

        job.state = JobState::Dead;
        job.next_attempt_at = None;
        assert!(!job.is_eligible_at(now));
    }
}
