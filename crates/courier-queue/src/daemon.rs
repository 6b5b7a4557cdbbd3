//! Continuous mode.
//!
//! The [`Daemon`] runs supervisor ticks and the cron sweep in one loop and
//! advertises itself through a [`PidFile`]. One-shot invocations keep it
//! alive through the [`DaemonWatchdog`].

use crate::cron::CronSweep;
use crate::error::{JobError, JobResult};
use crate::locks::{NamedLocks, LOCK_WATCHDOG};
use crate::metrics::DaemonMetrics;
use crate::process::{send_terminate, DaemonLauncher, ProcessProbe};
use crate::supervisor::WorkerSupervisor;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Parse a cron expression with a seconds field.
pub fn parse_schedule(expr: &str) -> JobResult<Schedule> {
    Schedule::from_str(expr)
        .map_err(|e| JobError::Configuration(format!("Invalid cron expression {:?}: {}", expr, e)))
}

/// File holding the pid of the running daemon.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored pid. A missing or unreadable file reads as `None`.
    pub fn read(&self) -> JobResult<Option<u32>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => match content.trim().parse::<u32>() {
                Ok(pid) if pid > 0 => Ok(Some(pid)),
                _ => {
                    warn!(path = %self.path.display(), "Ignoring malformed pidfile");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write(&self, pid: u32) -> JobResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, format!("{}\n", pid))?;
        Ok(())
    }

    /// Remove the file. Removing a missing file is not an error.
    pub fn remove(&self) -> JobResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Pid of a live daemon, if the file names one.
    pub fn running_pid(&self, probe: &dyn ProcessProbe) -> JobResult<Option<u32>> {
        Ok(self.read()?.filter(|pid| probe.is_alive(*pid)))
    }
}

/// What `daemon status` found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Running { pid: u32 },
    /// The pidfile names a dead process.
    Stale { pid: u32 },
    Stopped,
}

/// Outcome of `daemon start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyRunning { pid: u32 },
    Started { pid: u32 },
}

/// Outcome of `daemon stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped { pid: u32 },
}

pub fn status(pidfile: &PidFile, probe: &dyn ProcessProbe) -> JobResult<DaemonStatus> {
    Ok(match pidfile.read()? {
        Some(pid) if probe.is_alive(pid) => DaemonStatus::Running { pid },
        Some(pid) => DaemonStatus::Stale { pid },
        None => DaemonStatus::Stopped,
    })
}

/// Launch a detached daemon unless one is running.
pub async fn start(
    pidfile: &PidFile,
    probe: &dyn ProcessProbe,
    launcher: &dyn DaemonLauncher,
) -> JobResult<StartOutcome> {
    if let Some(pid) = pidfile.running_pid(probe)? {
        info!(pid, "Daemon already running");
        return Ok(StartOutcome::AlreadyRunning { pid });
    }

    pidfile.remove()?;
    let pid = launcher.launch().await?;
    pidfile.write(pid)?;
    info!(pid, pidfile = %pidfile.path().display(), "Daemon started");
    Ok(StartOutcome::Started { pid })
}

/// Signal the daemon to shut down and remove its pidfile.
pub fn stop(pidfile: &PidFile, probe: &dyn ProcessProbe) -> JobResult<StopOutcome> {
    let Some(pid) = pidfile.running_pid(probe)? else {
        pidfile.remove()?;
        return Ok(StopOutcome::NotRunning);
    };

    send_terminate(pid)?;
    pidfile.remove()?;
    info!(pid, "Daemon stopped");
    Ok(StopOutcome::Stopped { pid })
}

/// Supervisor ticks and cron sweeps in one loop.
pub struct Daemon {
    supervisor: Arc<WorkerSupervisor>,
    sweep: Arc<CronSweep>,
    pidfile: PidFile,
    probe: Arc<dyn ProcessProbe>,
    tick_interval: Duration,
    schedule: Schedule,
}

impl Daemon {
    pub fn new(
        supervisor: Arc<WorkerSupervisor>,
        sweep: Arc<CronSweep>,
        pidfile: PidFile,
        probe: Arc<dyn ProcessProbe>,
        tick_interval: Duration,
        schedule: Schedule,
    ) -> Self {
        Self {
            supervisor,
            sweep,
            pidfile,
            probe,
            tick_interval,
            schedule,
        }
    }

    /// Run until `shutdown` fires.
    ///
    /// A sweep whose fire time passed during a slow tick runs before the
    /// next tick. Fails only when another live daemon owns the pidfile or
    /// the pidfile cannot be written.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> JobResult<DaemonSummary> {
        let own_pid = std::process::id();
        if let Some(pid) = self.pidfile.running_pid(self.probe.as_ref())? {
            if pid != own_pid {
                return Err(JobError::Conflict(format!("daemon already running with pid {}", pid)));
            }
        }
        self.pidfile.write(own_pid)?;

        info!(
            pid = own_pid,
            tick_interval_ms = self.tick_interval.as_millis() as u64,
            pidfile = %self.pidfile.path().display(),
            "Daemon running"
        );

        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_sweep = self.next_sweep_after(Utc::now());
        let mut summary = DaemonSummary::default();

        loop {
            let until_sweep = until(next_sweep, Utc::now());

            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("Received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(until_sweep), if next_sweep.is_some() => {
                    self.sweep.run().await;
                    summary.sweeps += 1;
                    next_sweep = self.next_sweep_after(Utc::now());
                }

                _ = ticker.tick() => {
                    let report = self.supervisor.tick().await;
                    summary.ticks += 1;
                    if !report.spawned.is_empty() || !report.errors.is_empty() {
                        debug!(
                            spawned = report.spawned.len(),
                            spawn_failures = report.spawn_failures,
                            errors = report.errors.len(),
                            "Tick finished"
                        );
                    }
                }
            }
        }

        // Another daemon may have taken over after a stop.
        match self.pidfile.read() {
            Ok(Some(pid)) if pid == own_pid => {
                if let Err(e) = self.pidfile.remove() {
                    warn!(error = %e, "Failed to remove pidfile");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to read pidfile on shutdown"),
        }

        info!(pid = own_pid, ticks = summary.ticks, sweeps = summary.sweeps, "Daemon stopped");
        Ok(summary)
    }

    fn next_sweep_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next = self.schedule.after(&now).next();
        if next.is_none() {
            warn!("Cron schedule has no future fire time, sweeps disabled");
        }
        next
    }
}

/// Time left until `at`. A fire time already passed is due now.
fn until(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    at.map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
        .unwrap_or(Duration::MAX)
}

/// Work done by one [`Daemon::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DaemonSummary {
    pub ticks: u64,
    pub sweeps: u64,
}

/// What a watchdog check did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// Continuous mode is off.
    Disabled,
    /// Checked too recently.
    NotDue,
    Running { pid: u32 },
    Respawned { pid: u32 },
    /// No launcher was configured for this process.
    NotConfigured,
}

/// Relaunches the daemon from one-shot invocations when it died.
pub struct DaemonWatchdog {
    pidfile: PidFile,
    probe: Arc<dyn ProcessProbe>,
    launcher: Option<Arc<dyn DaemonLauncher>>,
    locks: Arc<dyn NamedLocks>,
    interval: Duration,
    enabled: bool,
}

impl DaemonWatchdog {
    pub fn new(
        pidfile: PidFile,
        probe: Arc<dyn ProcessProbe>,
        launcher: Option<Arc<dyn DaemonLauncher>>,
        locks: Arc<dyn NamedLocks>,
        interval: Duration,
        enabled: bool,
    ) -> Self {
        Self {
            pidfile,
            probe,
            launcher,
            locks,
            interval,
            enabled,
        }
    }

    /// Check the daemon at most once per interval.
    ///
    /// The watchdog lock is never released; its expiry is the rate limit.
    pub async fn check(&self) -> JobResult<WatchdogOutcome> {
        if !self.enabled {
            return Ok(WatchdogOutcome::Disabled);
        }
        if self.locks.try_acquire(LOCK_WATCHDOG, self.interval).await?.is_none() {
            return Ok(WatchdogOutcome::NotDue);
        }

        if let Some(pid) = self.pidfile.running_pid(self.probe.as_ref())? {
            debug!(pid, "Daemon alive");
            return Ok(WatchdogOutcome::Running { pid });
        }

        let Some(launcher) = &self.launcher else {
            warn!("Daemon is not running and no launcher is configured");
            return Ok(WatchdogOutcome::NotConfigured);
        };

        let pid = match launcher.launch().await {
            Ok(pid) => pid,
            Err(e) => {
                error!(error = %e, "Failed to relaunch daemon");
                return Err(e.into());
            }
        };
        self.pidfile.write(pid)?;
        DaemonMetrics::relaunched();
        warn!(pid, "Daemon was not running, relaunched");
        Ok(WatchdogOutcome::Respawned { pid })
    }
}
