//! Command handlers. Each writes its user-facing output to `out`.

use std::ffi::OsStr;
use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::info;

use queuectl_core::{Job, JobId, JobState, NewJob};
use queuectl_infra::config::QueueConfig;
use queuectl_infra::control::{ControlFile, StopOutcome, stop_manager};
use queuectl_infra::jobs::{
    JobStore, JobStoreError, QueueSettings, SettingKey, ShellExecutor, SqliteJobStore,
};
use queuectl_infra::signals;
use queuectl_infra::workers::{
    ManagerReport, OsProcessSupervisor, Worker, WorkerManager, WorkerReport,
};

pub async fn open_store(config: &QueueConfig) -> Result<SqliteJobStore> {
    SqliteJobStore::connect(&config.db_path)
        .await
        .with_context(|| format!("failed to open job database at {}", config.db_path.display()))
}

/// Validate and insert a job given as JSON. Nothing is written on error.
pub async fn enqueue<S: JobStore>(store: &S, raw: &str, out: &mut impl Write) -> Result<Job> {
    let new_job = NewJob::from_json(raw)?;
    let job = store.insert(new_job).await?;
    info!(job_id = %job.id, command = %job.command, "job enqueued");
    writeln!(out, "Job {} enqueued.", job.id)?;
    Ok(job)
}

pub async fn list<S: JobStore>(
    store: &S,
    state: Option<JobState>,
    json: bool,
    out: &mut impl Write,
) -> Result<()> {
    let jobs = store.list_by_state(state).await?;
    if json {
        return write_json(&jobs, out);
    }
    if jobs.is_empty() {
        writeln!(out, "No jobs found.")?;
        return Ok(());
    }

    writeln!(out, "{:36} | {:10} | {:8} | COMMAND", "ID", "STATE", "ATTEMPTS")?;
    writeln!(out, "{}", "-".repeat(80))?;
    for job in &jobs {
        writeln!(
            out,
            "{:36} | {:10} | {:8} | {}",
            job.id, job.state, job.attempts, job.command
        )?;
    }
    Ok(())
}

pub async fn dlq_list<S: JobStore>(store: &S, json: bool, out: &mut impl Write) -> Result<()> {
    let jobs = store.list_by_state(Some(JobState::Dead)).await?;
    if json {
        return write_json(&jobs, out);
    }
    if jobs.is_empty() {
        writeln!(out, "No jobs in DLQ.")?;
        return Ok(());
    }

    writeln!(out, "{:36} | COMMAND | LAST ERROR", "ID")?;
    writeln!(out, "{}", "-".repeat(80))?;
    for job in &jobs {
        writeln!(
            out,
            "{:36} | {} | {}",
            job.id,
            job.command,
            job.last_error.as_deref().unwrap_or("")
        )?;
    }
    Ok(())
}

/// Returns whether a dead job was found and requeued.
pub async fn dlq_retry<S: JobStore>(store: &S, raw_id: &str, out: &mut impl Write) -> Result<bool> {
    let id: JobId = raw_id.parse()?;
    match store.requeue_from_dead(&id).await {
        Ok(job) => {
            info!(job_id = %job.id, "job requeued from DLQ");
            writeln!(out, "Job {} moved back to pending queue.", job.id)?;
            Ok(true)
        }
        Err(JobStoreError::NotFound(_)) => {
            writeln!(out, "No DLQ job found with id {id}.")?;
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn status<S: JobStore>(
    store: &S,
    control: &ControlFile,
    json: bool,
    out: &mut impl Write,
) -> Result<()> {
    let counts = store.count_by_state().await?;
    let manager = control.active_manager()?;

    if json {
        let value = serde_json::json!({
            "jobs": counts,
            "total": counts.total(),
            "manager_pid": manager,
        });
        return write_json(&value, out);
    }

    writeln!(out, "Queue Status:")?;
    for state in JobState::ALL {
        writeln!(out, "  {:10}: {}", state.as_str(), counts.get(state))?;
    }
    writeln!(out, "  {:10}: {}", "total", counts.total())?;
    match manager {
        Some(pid) => writeln!(out, "Workers: manager running (PID {pid})")?,
        None => writeln!(out, "Workers: no active manager")?,
    }
    Ok(())
}

pub async fn config_get<S: JobStore>(store: &S, key: SettingKey, out: &mut impl Write) -> Result<()> {
    let settings = QueueSettings::load(store).await?;
    writeln!(out, "{key} = {}", settings.get(key))?;
    Ok(())
}

pub async fn config_set<S: JobStore>(
    store: &S,
    key: SettingKey,
    raw: &str,
    out: &mut impl Write,
) -> Result<()> {
    let value = QueueSettings::set(store, key, raw).await?;
    info!(%key, value, "setting updated");
    writeln!(out, "{key} = {value}")?;
    Ok(())
}

pub async fn config_list<S: JobStore>(store: &S, out: &mut impl Write) -> Result<()> {
    let settings = QueueSettings::load(store).await?;
    for key in SettingKey::ALL {
        writeln!(out, "{key} = {}", settings.get(key))?;
    }
    Ok(())
}

pub async fn recover<S: JobStore>(
    store: &S,
    older_than: Duration,
    out: &mut impl Write,
) -> Result<Vec<JobId>> {
    let recovered = store.recover_stale(older_than).await?;
    for id in &recovered {
        info!(job_id = %id, "stale job requeued");
    }
    writeln!(out, "Requeued {} stale job(s).", recovered.len())?;
    Ok(recovered)
}

pub fn worker_stop(control: &ControlFile, out: &mut impl Write) -> Result<StopOutcome> {
    let outcome = stop_manager(control)?;
    match outcome {
        StopOutcome::Signalled(pid) => writeln!(out, "Sent stop signal to manager (PID {pid}).")?,
        StopOutcome::NoActiveManager => writeln!(out, "No active worker manager found.")?,
        StopOutcome::ProcessNotFound(pid) => {
            writeln!(out, "Manager process {pid} not found (already stopped).")?
        }
    }
    Ok(outcome)
}

/// Run a pool of `count` worker processes in the foreground.
pub async fn worker_start(
    config: &QueueConfig,
    count: u32,
    out: &mut impl Write,
) -> Result<ManagerReport> {
    let control = ControlFile::new(&config.pidfile);
    if let Some(pid) = control.active_manager()? {
        bail!("a worker manager is already running (PID {pid})");
    }

    // Create the schema once instead of racing N children on it.
    open_store(config).await?.close().await;

    let supervisor = OsProcessSupervisor::current_exe()
        .context("failed to locate the queuectl executable")?
        .with_args([
            OsStr::new("--db-path"),
            config.db_path.as_os_str(),
            OsStr::new("--pidfile"),
            config.pidfile.as_os_str(),
        ]);

    writeln!(out, "Starting {count} worker(s) (manager PID {}).", std::process::id())?;
    out.flush()?;

    let manager = WorkerManager::new(supervisor, control, config.manager_config());
    let report = manager.start(count, CancellationToken::new()).await?;

    writeln!(
        out,
        "Manager stopped: {} worker(s) exited, {} killed.",
        report.terminated, report.killed
    )?;
    Ok(report)
}

/// Body of one worker process.
pub async fn worker_run(config: &QueueConfig, worker_id: u32) -> Result<WorkerReport> {
    let store = open_store(config).await?;
    let settings = QueueSettings::load(&store).await?;
    let worker_config = config
        .worker_config(worker_id)
        .with_retry(settings.retry_policy()?);

    let shutdown = CancellationToken::new();
    let listener = signals::cancel_on_termination(shutdown.clone())
        .context("failed to install signal handlers")?;

    let mut worker = Worker::new(store, ShellExecutor::new(), worker_config);
    let report = worker.run(shutdown).await;
    listener.abort();
    Ok(report)
}

fn write_json<T: serde::Serialize + ?Sized>(value: &T, out: &mut impl Write) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}
