//! OS process abstraction used by the worker manager.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::warn;

/// A spawned worker process.
#[async_trait]
pub trait WorkerProcess: Send {
    /// 1-based worker index passed at spawn time.
    fn worker_id(&self) -> u32;

    /// OS process id, if the process has not been reaped yet.
    fn pid(&self) -> Option<u32>;

    /// Non-blocking liveness check; reaps the process if it has exited.
    fn is_alive(&mut self) -> bool;

    /// Ask the process to stop (SIGTERM on unix).
    fn terminate(&mut self) -> io::Result<()>;

    /// Wait for exit, returning the exit code if there is one.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Forcibly kill and reap.
    async fn kill(&mut self) -> io::Result<()>;
}

/// Spawns worker processes.
pub trait ProcessSupervisor: Send + Sync {
    type Process: WorkerProcess;

    fn spawn(&self, worker_id: u32) -> io::Result<Self::Process>;
}

/// Re-executes a program (normally the running `queuectl` binary) as
/// `<program> <args..> worker run --worker-id N`.
///
/// Children inherit stdout/stderr, so the pool logs to one stream.
#[derive(Debug, Clone)]
pub struct OsProcessSupervisor {
    program: PathBuf,
    args: Vec<OsString>,
}

impl OsProcessSupervisor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Supervisor for the currently running executable.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Arguments placed before the `worker run` subcommand, e.g. global flags.
    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command(&self, worker_id: u32) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("worker")
            .arg("run")
            .arg("--worker-id")
            .arg(worker_id.to_string())
            .stdin(Stdio::null());
        cmd
    }
}

impl ProcessSupervisor for OsProcessSupervisor {
    type Process = OsWorkerProcess;

    fn spawn(&self, worker_id: u32) -> io::Result<OsWorkerProcess> {
        let child = self.command(worker_id).spawn()?;
        Ok(OsWorkerProcess { worker_id, child })
    }
}

#[derive(Debug)]
pub struct OsWorkerProcess {
    worker_id: u32,
    child: Child,
}

impl OsWorkerProcess {
    /// Wrap an already spawned child.
    pub fn from_child(worker_id: u32, child: Child) -> Self {
        Self { worker_id, child }
    }
}

#[async_trait]
impl WorkerProcess for OsWorkerProcess {
    fn worker_id(&self) -> u32 {
        self.worker_id
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        still_running(self.worker_id, self.child.try_wait())
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        // Already reaped.
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let raw = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.wait().await?.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

/// Interpret a `try_wait` result. A failed status check counts as exited.
fn still_running(worker_id: u32, status: io::Result<Option<ExitStatus>>) -> bool {
    match status {
        Ok(None) => true,
        Ok(Some(_)) => false,
        Err(e) => {
            warn!(worker_id, error = %e, "failed to check worker status; treating as exited");
            false
        }
    }
}
