use std::io;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use queuectl_cli::cli::{Cli, Commands, ConfigCommands, DlqCommands, GlobalArgs, WorkerCommands};
use queuectl_cli::commands;
use queuectl_infra::config::QueueConfig;
use queuectl_infra::control::ControlFile;
use queuectl_infra::jobs::JobStore;

fn load_config(global: &GlobalArgs) -> Result<QueueConfig> {
    let mut config = QueueConfig::from_env()?;
    if let Some(path) = &global.db_path {
        config.db_path = path.clone();
    }
    if let Some(path) = &global.pidfile {
        config.pidfile = path.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    queuectl_observability::init();

    let config = load_config(&cli.global)?;
    let mut out = io::stdout().lock();

    match cli.command {
        Commands::Enqueue { job } => {
            let store = commands::open_store(&config).await?;
            commands::enqueue(&store, &job, &mut out).await?;
            store.close().await;
        }
        Commands::Worker { command } => match command {
            WorkerCommands::Start { count } => {
                commands::worker_start(&config, count, &mut out).await?;
            }
            WorkerCommands::Stop => {
                commands::worker_stop(&ControlFile::new(&config.pidfile), &mut out)?;
            }
            WorkerCommands::Run { worker_id } => {
                commands::worker_run(&config, worker_id).await?;
            }
        },
        Commands::List { state, json } => {
            let store = commands::open_store(&config).await?;
            commands::list(&store, state, json, &mut out).await?;
        }
        Commands::Dlq { command } => {
            let store = commands::open_store(&config).await?;
            match command {
                DlqCommands::List { json } => commands::dlq_list(&store, json, &mut out).await?,
                DlqCommands::Retry { job_id } => {
                    commands::dlq_retry(&store, &job_id, &mut out).await?;
                }
            }
            store.close().await;
        }
        Commands::Status { json } => {
            let store = commands::open_store(&config).await?;
            let control = ControlFile::new(&config.pidfile);
            commands::status(&store, &control, json, &mut out).await?;
        }
        Commands::Config { command } => {
            let store = commands::open_store(&config).await?;
            match command {
                ConfigCommands::Get { key } => commands::config_get(&store, key, &mut out).await?,
                ConfigCommands::Set { key, value } => {
                    commands::config_set(&store, key, &value, &mut out).await?
                }
                ConfigCommands::List => commands::config_list(&store, &mut out).await?,
            }
            store.close().await;
        }
        Commands::Recover { older_than_secs } => {
            let store = commands::open_store(&config).await?;
            commands::recover(&store, Duration::from_secs(older_than_secs), &mut out).await?;
            store.close().await;
        }
    }

    Ok(())
}
