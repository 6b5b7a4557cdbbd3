//! # Courier
//!
//! Entry point of the `courier` binary. One executable serves every role:
//! - **daemon run**: supervisor ticks plus the cron sweep until shutdown
//! - **daemon start|stop|status**: pidfile control of that loop
//! - **worker** / **cron**: one-shot tick or sweep, with the daemon watchdog
//! - **execute**: a single job, spawned by the supervisor

use clap::Parser;
use courier_config::{AppConfig, ConfigLoader};
use courier_core::{init_telemetry, CourierResult};
use courier_queue::mysql::run_migrations;
use courier_queue::{Command, DaemonStatus, JobError, JobId, JobStore, NewJob, Priority, Role, StartOutcome, StopOutcome};
use courier_server::app::{connect_jobs, AppBuilder, DaemonControl};
use courier_server::cli::{Cli, DaemonAction, Mode};
use courier_server::startup::{install_metrics_exporter, print_startup_info, shutdown_signal};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!(code = e.error_code(), "Application error: {}", e);
        eprintln!("courier: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> CourierResult<()> {
    let loader = ConfigLoader::new(cli.config_dir.display().to_string())?;
    let config = loader.get().await;
    init_telemetry(&config.telemetry)?;

    let child_args = cli.child_args();

    match cli.command {
        Mode::Daemon { action } => run_daemon(action, config, child_args).await,
        Mode::Worker { frontend } => {
            let role = if frontend { Role::Frontend } else { Role::Backend };
            run_worker(config, child_args, role).await
        }
        Mode::Cron => run_cron(config, child_args).await,
        Mode::Execute { job } => execute(config, child_args, job).await,
        Mode::Enqueue {
            command,
            parameters,
            priority,
            force,
            delay,
        } => enqueue(&config, command, parameters, priority, force, delay).await,
        Mode::Migrate => migrate(&config).await,
    }
}

async fn run_daemon(action: DaemonAction, config: AppConfig, child_args: Vec<String>) -> CourierResult<()> {
    let control = DaemonControl::from_config(&config, child_args.clone())?;

    match action {
        DaemonAction::Start => match control.start().await? {
            StartOutcome::AlreadyRunning { pid } => println!("Daemon already running (pid {})", pid),
            StartOutcome::Started { pid } => println!("Daemon started (pid {})", pid),
        },
        DaemonAction::Stop => match control.stop()? {
            StopOutcome::NotRunning => println!("Daemon not running"),
            StopOutcome::Stopped { pid } => println!("Daemon stopped (pid {})", pid),
        },
        DaemonAction::Status => match control.status()? {
            DaemonStatus::Running { pid } => println!("Daemon running (pid {})", pid),
            DaemonStatus::Stale { pid } => println!("Daemon not running (stale pid {})", pid),
            DaemonStatus::Stopped => println!("Daemon not running"),
        },
        DaemonAction::Run => {
            info!("Starting Courier daemon...");
            info!("Version: {}", env!("CARGO_PKG_VERSION"));
            print_startup_info(&config);
            install_metrics_exporter(&config.metrics)?;

            let app = AppBuilder::new()
                .with_config(config)
                .with_child_args(child_args)
                .build()
                .await?;
            let daemon = app.daemon()?;

            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            tokio::spawn(async move {
                shutdown_signal().await;
                let _ = shutdown_tx.send(());
            });

            let summary = daemon.run(shutdown_rx).await?;
            app.wait_for_workers().await;
            info!(ticks = summary.ticks, sweeps = summary.sweeps, "Daemon shutdown complete");
        }
    }

    Ok(())
}

async fn run_worker(config: AppConfig, child_args: Vec<String>, role: Role) -> CourierResult<()> {
    let app = AppBuilder::new()
        .with_config(config)
        .with_child_args(child_args)
        .with_role(role)
        .build()
        .await?;

    let report = app.supervisor().tick().await;
    info!(
        claimed = report.claimed,
        spawned = report.spawned.len(),
        spawn_failures = report.spawn_failures,
        lock_busy = report.lock_busy,
        "Worker tick finished"
    );
    for e in &report.errors {
        warn!("Worker tick error: {}", e);
    }
    app.wait_for_workers().await;

    match app.watchdog().check().await {
        Ok(outcome) => info!(?outcome, "Watchdog checked"),
        Err(e) => warn!("Watchdog check failed: {}", e),
    }
    Ok(())
}

async fn run_cron(config: AppConfig, child_args: Vec<String>) -> CourierResult<()> {
    let app = AppBuilder::new()
        .with_config(config)
        .with_child_args(child_args)
        .build()
        .await?;

    let report = app.sweep().run().await;
    info!(
        released = report.stale.released.len(),
        killed = report.stale.killed.len(),
        deleted = report.clean.deleted,
        inline = report.dispatch.inline_succeeded,
        enqueued = report.dispatch.enqueued,
        pruned = report.pruned,
        watchdog = ?report.watchdog,
        "Cron sweep finished"
    );
    for e in &report.errors {
        warn!("Cron sweep error: {}", e);
    }
    app.wait_for_workers().await;
    Ok(())
}

async fn execute(config: AppConfig, child_args: Vec<String>, job: JobId) -> CourierResult<()> {
    let app = AppBuilder::new()
        .with_config(config)
        .with_child_args(child_args)
        .build()
        .await?;

    let outcome = app.runner().run_by_id(job, std::process::id()).await?;
    info!(job_id = %job, ?outcome, "Job finished");
    Ok(())
}

async fn enqueue(
    config: &AppConfig,
    command: String,
    parameters: Vec<String>,
    priority: Priority,
    force: bool,
    delay: Option<u64>,
) -> CourierResult<()> {
    if command.parse::<Command>().is_err() {
        warn!(%command, "Enqueuing a command no worker knows");
    }

    let mut job = NewJob::new(command)
        .params(parameters)
        .priority(priority)
        .force_priority(force);
    if let Some(secs) = delay {
        job = job.delay(Duration::from_secs(secs));
    }

    let (_, store) = connect_jobs(config).await?;
    let id = store.enqueue(job).await.map_err(JobError::from)?;
    println!("{}", id);
    Ok(())
}

async fn migrate(config: &AppConfig) -> CourierResult<()> {
    let (pool, _) = connect_jobs(config).await?;
    run_migrations(&pool).await.map_err(JobError::from)?;
    info!("Migrations applied");
    Ok(())
}
