//! `queuectl-core`: job queue domain building blocks.
//!
//! This crate contains **pure domain** primitives (no storage, no processes):
//! the job record and its lifecycle states, enqueue validation, and the
//! retry/backoff policy.

pub mod error;
pub mod id;
pub mod job;
pub mod retry;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{ClaimedJob, DEFAULT_MAX_RETRIES, Job, JobState, NewJob};
pub use retry::{DEFAULT_BACKOFF_BASE, RetryDecision, RetryPolicy, backoff_seconds};
