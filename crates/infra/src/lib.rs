//! Infrastructure layer: job storage, command execution, worker processes,
//! process control and runtime configuration.

pub mod config;
pub mod control;
pub mod jobs;
pub mod signals;
pub mod workers;
