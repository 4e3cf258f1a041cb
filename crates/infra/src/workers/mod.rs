//! Worker processes: the per-process job loop and the manager that
//! supervises a pool of them.

pub mod job_worker;
pub mod manager;
pub mod supervisor;

pub use job_worker::{JobOutcome, Worker, WorkerConfig, WorkerReport, WorkerState};
pub use manager::{ManagerConfig, ManagerError, ManagerReport, StopReason, WorkerManager};
pub use supervisor::{OsProcessSupervisor, OsWorkerProcess, ProcessSupervisor, WorkerProcess};
