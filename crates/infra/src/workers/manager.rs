use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::control::{ControlFile, ControlFileError};
use crate::signals;

use super::supervisor::{ProcessSupervisor, WorkerProcess};

/// Worker manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Total time granted to all children to exit after SIGTERM.
    pub grace_period: Duration,
    /// How often the supervision loop checks child liveness.
    pub supervise_interval: Duration,
    /// Cancel the shutdown token on SIGINT/SIGTERM.
    pub handle_signals: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            supervise_interval: Duration::from_secs(1),
            handle_signals: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("worker count must be at least 1")]
    InvalidCount,
    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),
    #[error(transparent)]
    Control(#[from] ControlFileError),
}

/// Why the supervision loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    StopRequested,
    AllWorkersExited,
}

/// Summary of one manager run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerReport {
    pub requested: u32,
    pub spawned: u32,
    pub spawn_failures: u32,
    pub reason: StopReason,
    /// Children that exited within the grace period after SIGTERM.
    pub terminated: u32,
    /// Children still alive at the deadline.
    pub killed: u32,
}

/// Owns a pool of worker processes and their collective lifecycle.
///
/// The manager never looks at job state; it only starts, watches and stops
/// processes.
pub struct WorkerManager<P> {
    supervisor: P,
    control: ControlFile,
    config: ManagerConfig,
}

impl<P: ProcessSupervisor> WorkerManager<P> {
    pub fn new(supervisor: P, control: ControlFile, config: ManagerConfig) -> Self {
        Self {
            supervisor,
            control,
            config,
        }
    }

    /// Run a pool of `count` workers until `shutdown` is cancelled or every
    /// worker has exited on its own.
    ///
    /// The control file holds this process's PID for the whole run and is
    /// removed only after the children are stopped.
    pub async fn start(
        &self,
        count: u32,
        shutdown: CancellationToken,
    ) -> Result<ManagerReport, ManagerError> {
        if count == 0 {
            return Err(ManagerError::InvalidCount);
        }

        // Handlers go in before the PID is published so an early stop
        // request is never fatal.
        let listener = if self.config.handle_signals {
            let listener = signals::cancel_on_termination(shutdown.clone())
                .map_err(ManagerError::Signals)?;
            Some(listener)
        } else {
            None
        };

        let pid = std::process::id();
        if let Err(e) = self.control.write(pid) {
            if let Some(listener) = listener {
                listener.abort();
            }
            return Err(e.into());
        }
        info!(pid, count, "manager starting workers");

        let mut children = Vec::with_capacity(count as usize);
        let mut spawn_failures = 0;
        for worker_id in 1..=count {
            match self.supervisor.spawn(worker_id) {
                Ok(child) => {
                    info!(worker_id, pid = ?child.pid(), "spawned worker");
                    children.push(child);
                }
                Err(e) => {
                    spawn_failures += 1;
                    error!(worker_id, error = %e, "failed to spawn worker");
                }
            }
        }
        let spawned = children.len() as u32;

        let reason = self.supervise(&mut children, &shutdown).await;
        info!(?reason, "manager stopping workers");
        let (terminated, killed) = self.stop_children(&mut children).await;

        if let Some(listener) = listener {
            listener.abort();
        }
        if let Err(e) = self.control.remove() {
            warn!(error = %e, "failed to remove control file");
        }
        info!(terminated, killed, "manager stopped");

        Ok(ManagerReport {
            requested: count,
            spawned,
            spawn_failures,
            reason,
            terminated,
            killed,
        })
    }

    async fn supervise(
        &self,
        children: &mut [P::Process],
        shutdown: &CancellationToken,
    ) -> StopReason {
        loop {
            if shutdown.is_cancelled() {
                return StopReason::StopRequested;
            }
            // Poll every child so exited ones are reaped.
            let alive = children.iter_mut().fold(0, |n, c| n + usize::from(c.is_alive()));
            if alive == 0 {
                return StopReason::AllWorkersExited;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return StopReason::StopRequested,
                _ = tokio::time::sleep(self.config.supervise_interval) => {}
            }
        }
    }

    /// SIGTERM every live child, wait until a shared deadline, then kill
    /// stragglers. Returns `(terminated, killed)`.
    async fn stop_children(&self, children: &mut [P::Process]) -> (u32, u32) {
        let mut signalled = Vec::new();
        for (idx, child) in children.iter_mut().enumerate() {
            if !child.is_alive() {
                continue;
            }
            if let Err(e) = child.terminate() {
                warn!(worker_id = child.worker_id(), error = %e, "failed to signal worker");
            }
            signalled.push(idx);
        }

        let deadline = Instant::now() + self.config.grace_period;
        let (mut terminated, mut killed) = (0, 0);
        for idx in signalled {
            let child = &mut children[idx];
            let worker_id = child.worker_id();
            match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(Ok(code)) => {
                    terminated += 1;
                    info!(worker_id, exit_code = ?code, "worker exited");
                }
                Ok(Err(e)) => {
                    warn!(worker_id, error = %e, "failed to wait for worker; killing");
                    kill(child).await;
                    killed += 1;
                }
                Err(_) => {
                    warn!(worker_id, "worker did not exit within grace period; killing");
                    kill(child).await;
                    killed += 1;
                }
            }
        }
        (terminated, killed)
    }
}

async fn kill<C: WorkerProcess>(child: &mut C) {
    if let Err(e) = child.kill().await {
        error!(worker_id = child.worker_id(), error = %e, "failed to kill worker");
    }
}
