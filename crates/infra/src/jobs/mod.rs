//! Persistent job queue: storage, command execution, and queue settings.
//!
//! ## Components
//!
//! - `JobStore`: persistence for jobs, including the atomic claim protocol
//! - `SqliteJobStore`: durable store shared by independent worker processes
//! - `InMemoryJobStore`: same semantics without a database, for tests/dev
//! - `Executor`: runs one job's command in a child process with a timeout
//! - `QueueSettings`: operator-tunable defaults persisted next to the jobs

pub mod executor;
pub mod in_memory;
pub mod settings;
pub mod sqlite;
pub mod store;

pub use executor::{ExecutionKind, ExecutionResult, Executor, MARKER_EXIT_CODE, ShellExecutor};
pub use in_memory::InMemoryJobStore;
pub use settings::{QueueSettings, SettingKey};
pub use sqlite::SqliteJobStore;
pub use store::{JobCounts, JobStore, JobStoreError, STALE_CLAIM_ERROR};
