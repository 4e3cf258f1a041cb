//! Manager control file.
//!
//! A running manager records its PID in a well-known file so that a later
//! `worker stop` can find and signal it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ControlFileError {
    #[error("control file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("control file {path} does not contain a PID: '{content}'")]
    Malformed { path: PathBuf, content: String },
    #[error("failed to signal manager {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
    #[error("signalling a manager is not supported on this platform")]
    Unsupported,
}

/// Result of [`stop_manager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// SIGTERM delivered to the manager.
    Signalled(u32),
    /// No control file (or an unreadable one).
    NoActiveManager,
    /// The recorded process no longer exists; the stale file was removed.
    ProcessNotFound(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFile {
    path: PathBuf,
}

impl ControlFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, pid: u32) -> Result<(), ControlFileError> {
        fs::write(&self.path, pid.to_string()).map_err(|source| self.io(source))?;
        debug!(path = %self.path.display(), pid, "control file written");
        Ok(())
    }

    /// The recorded PID, or `None` if there is no control file.
    pub fn read(&self) -> Result<Option<u32>, ControlFileError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io(e)),
        };
        content
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ControlFileError::Malformed {
                path: self.path.clone(),
                content: content.trim().to_string(),
            })
    }

    /// Remove the file. Missing files are fine.
    pub fn remove(&self) -> Result<(), ControlFileError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io(e)),
        }
    }

    /// PID of a manager that is recorded and still alive.
    pub fn active_manager(&self) -> Result<Option<u32>, ControlFileError> {
        match self.read() {
            Ok(Some(pid)) if is_process_alive(pid) => Ok(Some(pid)),
            Ok(_) | Err(ControlFileError::Malformed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn io(&self, source: io::Error) -> ControlFileError {
        ControlFileError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Ask the manager recorded in `control` to shut down.
///
/// The file is removed once the signal is delivered or the process turns out
/// to be gone. The manager removes it again after its own shutdown.
pub fn stop_manager(control: &ControlFile) -> Result<StopOutcome, ControlFileError> {
    let pid = match control.read() {
        Ok(Some(pid)) => pid,
        Ok(None) => return Ok(StopOutcome::NoActiveManager),
        Err(ControlFileError::Malformed { content, .. }) => {
            warn!(path = %control.path().display(), %content, "removing unreadable control file");
            control.remove()?;
            return Ok(StopOutcome::NoActiveManager);
        }
        Err(e) => return Err(e),
    };

    match send_terminate(pid) {
        Ok(true) => {
            control.remove()?;
            info!(pid, "sent stop signal to manager");
            Ok(StopOutcome::Signalled(pid))
        }
        Ok(false) => {
            control.remove()?;
            info!(pid, "manager process not found; removed stale control file");
            Ok(StopOutcome::ProcessNotFound(pid))
        }
        Err(source) => Err(ControlFileError::Signal { pid, source }),
    }
}

/// Whether a process with `pid` exists.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks existence; EPERM means it exists under another user.
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

/// SIGTERM `pid`. `Ok(false)` when no such process exists.
#[cfg(unix)]
fn send_terminate(pid: u32) -> io::Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(io::Error::from(e)),
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> io::Result<bool> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        ControlFileError::Unsupported.to_string(),
    ))
}
