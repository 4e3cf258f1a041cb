//! Command execution for claimed jobs.
//!
//! The executor never fails: spawn errors, timeouts and I/O faults all come
//! back as an [`ExecutionResult`] with a non-zero exit code and a message in
//! `stderr`.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

/// How a command run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionKind {
    /// Exit code 0.
    Succeeded,
    /// Ran to completion with a non-zero exit code (or was killed by a signal).
    Exited,
    /// Killed after exceeding its timeout.
    TimedOut,
    /// The shell could not be located.
    NotFound,
    /// Any other spawn or wait failure.
    Fault,
}

/// Captured result of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub kind: ExecutionKind,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Exit code reported for every failure marker.
pub const MARKER_EXIT_CODE: i32 = 1;

impl ExecutionResult {
    fn marker(kind: ExecutionKind, message: String) -> Self {
        Self {
            kind,
            exit_code: MARKER_EXIT_CODE,
            stdout: String::new(),
            stderr: message,
        }
    }

    pub fn timed_out(timeout: Duration) -> Self {
        Self::marker(
            ExecutionKind::TimedOut,
            format!("Command timed out after {} seconds", timeout.as_secs_f64()),
        )
    }

    pub fn not_found() -> Self {
        Self::marker(ExecutionKind::NotFound, "Command not found".to_string())
    }

    pub fn fault(err: impl std::fmt::Display) -> Self {
        Self::marker(ExecutionKind::Fault, format!("Execution error: {err}"))
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// Message recorded as the job's `last_error` for a failed run.
    pub fn error_message(&self) -> String {
        if self.stderr.is_empty() {
            format!("Command exited with code {}", self.exit_code)
        } else {
            self.stderr.clone()
        }
    }
}

/// Runs one job command to completion or timeout.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration) -> ExecutionResult;
}

/// Runs commands through the platform shell as child processes.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
    flag: String,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        if cfg!(windows) {
            Self::with_shell("cmd", "/C")
        } else {
            Self::with_shell("sh", "-c")
        }
    }
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific shell program, e.g. `("bash", "-c")`.
    pub fn with_shell(shell: impl Into<String>, flag: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            flag: flag.into(),
        }
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn run(&self, command: &str, timeout: Duration) -> ExecutionResult {
        let mut cmd = Command::new(&self.shell);
        cmd.arg(&self.flag)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future on timeout kills the child.
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(shell = %self.shell, "shell not found");
                return ExecutionResult::not_found();
            }
            Err(e) => return ExecutionResult::fault(e),
        };

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return ExecutionResult::fault(e),
            Err(_) => {
                debug!(timeout_secs = timeout.as_secs_f64(), "command timed out");
                return ExecutionResult::timed_out(timeout);
            }
        };

        // No code means the child was killed by a signal.
        let exit_code = output.status.code().unwrap_or(-1);
        ExecutionResult {
            kind: if exit_code == 0 {
                ExecutionKind::Succeeded
            } else {
                ExecutionKind::Exited
            },
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}
