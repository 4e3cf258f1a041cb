//! `queuectl` command-line surface.
//!
//! The binary is also what the worker manager re-executes (`worker run`) to
//! start each worker process.

pub mod cli;
pub mod commands;

pub use cli::Cli;
