//! Command-line definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use queuectl_core::JobState;
use queuectl_infra::config::{ENV_DB_PATH, ENV_PIDFILE};
use queuectl_infra::jobs::SettingKey;

/// queuectl - a persistent background job queue with retries and a dead letter queue
#[derive(Debug, Parser)]
#[command(name = "queuectl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Args)]
pub struct GlobalArgs {
    /// SQLite database file
    #[arg(long, env = ENV_DB_PATH, global = true)]
    pub db_path: Option<PathBuf>,

    /// Control file holding the worker manager's PID
    #[arg(long, env = ENV_PIDFILE, global = true)]
    pub pidfile: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Add a job, e.g. '{"id":"job1","command":"sleep 2"}'
    Enqueue {
        /// Job as a JSON object; only "command" is required
        job: String,
    },

    /// Start, stop or run workers
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },

    /// List jobs, oldest first
    List {
        /// Only jobs in this state
        #[arg(long, value_parser = parse_state)]
        state: Option<JobState>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Inspect or retry dead-lettered jobs
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },

    /// Job counts per state and whether a worker manager is running
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Read or change queue settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Return jobs stuck in 'processing' to 'pending'
    Recover {
        /// Only jobs claimed at least this many seconds ago
        #[arg(long, default_value_t = 3600)]
        older_than_secs: u64,
    },
}

#[derive(Debug, Subcommand)]
pub enum WorkerCommands {
    /// Run a pool of worker processes in the foreground until stopped
    Start {
        /// Number of worker processes
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        count: u32,
    },

    /// Signal the running worker manager to shut down
    Stop,

    /// Run a single worker loop (spawned by `worker start`)
    #[command(hide = true)]
    Run {
        #[arg(long, default_value_t = 1)]
        worker_id: u32,
    },
}

#[derive(Debug, Subcommand)]
pub enum DlqCommands {
    /// List dead-lettered jobs
    List {
        #[arg(long)]
        json: bool,
    },

    /// Move a dead job back to pending with its attempts reset
    Retry { job_id: String },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Show one setting
    Get {
        #[arg(value_parser = parse_key)]
        key: SettingKey,
    },

    /// Change a setting (max-retries, backoff-base)
    Set {
        #[arg(value_parser = parse_key)]
        key: SettingKey,
        value: String,
    },

    /// Show all settings
    List,
}

fn parse_state(raw: &str) -> Result<JobState, String> {
    raw.parse().map_err(|e| format!("{e}"))
}

fn parse_key(raw: &str) -> Result<SettingKey, String> {
    raw.parse().map_err(|e| format!("{e}"))
}
