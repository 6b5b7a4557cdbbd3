//! Component wiring.
//!
//! [`AppBuilder`] connects MySQL and the lock backend and builds the full
//! component graph for the modes that touch the queue. [`DaemonControl`]
//! covers `daemon start|stop|status`, which only need the pidfile.

use courier_config::{AppConfig, LockBackend, WorkerIsolation};
use courier_core::CourierResult;
use courier_queue::daemon::{self, parse_schedule};
use courier_queue::mysql::create_pool;
use courier_queue::redis::create_pool as create_redis_pool;
use courier_queue::{
    ActivityDeliverer, ApDeliveryCommand, BulkDeliveryCommand, Command, CommandLauncher,
    CommandRegistry, CommandSpawner, CronCommand, CronSweep, Daemon, DaemonLauncher,
    DaemonStatus, DaemonWatchdog, DeferPolicy, DeliveryDispatcher, DeliveryTargetTracker,
    HeartbeatProbe, HttpTransport, InboxDelivery, JobRunner, JobStore, MemoryLocks,
    MySqlDeliveryStore, MySqlJobStore, MySqlReachability, NamedLocks, OsProcessProbe, PidFile,
    PriorityScheduler, ProcessProbe, ProcessRegistry, ProcessSpawner, RedisKeys, RedisLocks, Role,
    SchedulerSettings, StartOutcome, StopOutcome, SupervisorSettings, TaskSpawner, Transport,
    WorkerSupervisor,
};
use sqlx::mysql::MySqlPool;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Executable re-run for workers and the daemon.
fn worker_executable(config: &AppConfig) -> CourierResult<PathBuf> {
    match &config.worker.executable {
        Some(path) => Ok(path.clone()),
        None => Ok(std::env::current_exe()?),
    }
}

/// Named locks on the configured backend.
pub async fn build_locks(config: &AppConfig) -> CourierResult<Arc<dyn NamedLocks>> {
    match config.locks.backend {
        LockBackend::Redis => {
            let pool = create_redis_pool(&config.redis).await?;
            info!(prefix = %config.redis.key_prefix, "Using Redis named locks");
            Ok(Arc::new(RedisLocks::new(pool, RedisKeys::new(config.redis.key_prefix.clone()))))
        }
        LockBackend::Memory => {
            warn!("Using process-local named locks; separate worker and cron processes are not excluded from each other");
            Ok(MemoryLocks::shared())
        }
    }
}

/// Isolation that can run on this platform. Process workers are watched
/// through signals; without them, jobs run as tasks.
fn effective_isolation(configured: WorkerIsolation, signals: bool) -> WorkerIsolation {
    match configured {
        WorkerIsolation::Process if !signals => {
            warn!("Process isolation needs signals on this platform, running workers as tasks");
            WorkerIsolation::Task
        }
        isolation => isolation,
    }
}

/// Spawner and liveness probe handed to the supervisor.
struct Workers {
    spawner: Arc<dyn ProcessSpawner>,
    probe: Arc<dyn ProcessProbe>,
    /// Set for task isolation; bound to the runner once it exists.
    tasks: Option<Arc<TaskSpawner>>,
}

impl Workers {
    fn new(
        isolation: WorkerIsolation,
        executable: PathBuf,
        args: Vec<String>,
        registry: Arc<ProcessRegistry>,
    ) -> Self {
        match isolation {
            WorkerIsolation::Process => Self {
                spawner: Arc::new(CommandSpawner::new(executable, args, registry)),
                probe: Arc::new(OsProcessProbe),
                tasks: None,
            },
            WorkerIsolation::Task => {
                let tasks = Arc::new(TaskSpawner::unbound(registry.clone()));
                Self {
                    spawner: tasks.clone(),
                    probe: Arc::new(HeartbeatProbe::new(registry)),
                    tasks: Some(tasks),
                }
            }
        }
    }
}

/// Pidfile operations behind `daemon start|stop|status`.
pub struct DaemonControl {
    pidfile: PidFile,
    probe: Arc<dyn ProcessProbe>,
    launcher: Arc<dyn DaemonLauncher>,
}

impl DaemonControl {
    pub fn from_config(config: &AppConfig, child_args: Vec<String>) -> CourierResult<Self> {
        let launcher = CommandLauncher::new(worker_executable(config)?, child_args);
        Ok(Self::new(
            PidFile::new(&config.daemon.pidfile),
            Arc::new(OsProcessProbe),
            Arc::new(launcher),
        ))
    }

    pub fn new(
        pidfile: PidFile,
        probe: Arc<dyn ProcessProbe>,
        launcher: Arc<dyn DaemonLauncher>,
    ) -> Self {
        Self {
            pidfile,
            probe,
            launcher,
        }
    }

    pub fn pidfile(&self) -> &PidFile {
        &self.pidfile
    }

    pub async fn start(&self) -> CourierResult<StartOutcome> {
        Ok(daemon::start(&self.pidfile, self.probe.as_ref(), self.launcher.as_ref()).await?)
    }

    pub fn stop(&self) -> CourierResult<StopOutcome> {
        Ok(daemon::stop(&self.pidfile, self.probe.as_ref())?)
    }

    pub fn status(&self) -> CourierResult<DaemonStatus> {
        Ok(daemon::status(&self.pidfile, self.probe.as_ref())?)
    }
}

/// Builds an [`App`] from configuration.
pub struct AppBuilder {
    config: Option<AppConfig>,
    child_args: Vec<String>,
    role: Role,
}

impl AppBuilder {
    /// Creates a new application builder.
    pub fn new() -> Self {
        Self {
            config: None,
            child_args: Vec::new(),
            role: Role::Backend,
        }
    }

    /// Sets the configuration.
    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Arguments passed to spawned workers and the launched daemon.
    pub fn with_child_args(mut self, args: Vec<String>) -> Self {
        self.child_args = args;
        self
    }

    /// Selects the process limit of the supervisor.
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Connects the backends and wires every component.
    pub async fn build(self) -> CourierResult<App> {
        let config = self.config.unwrap_or_default();
        let executable = worker_executable(&config)?;

        let pool = create_pool(&config.database).await?;
        let locks = build_locks(&config).await?;

        let jobs: Arc<dyn JobStore> = Arc::new(MySqlJobStore::new(pool.clone()));
        let tracker = Arc::new(DeliveryTargetTracker::new(
            Arc::new(MySqlDeliveryStore::new(pool.clone())),
            Arc::new(MySqlReachability::new(pool.clone())),
            config.delivery.reachability_ttl(),
        ));

        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config.delivery)?);
        let deliverer: Arc<dyn InboxDelivery> =
            Arc::new(ActivityDeliverer::new(tracker.clone(), transport));

        let registry = Arc::new(ProcessRegistry::new());
        let isolation = effective_isolation(config.worker.isolation, cfg!(unix));
        let workers = Workers::new(
            isolation,
            executable.clone(),
            self.child_args.clone(),
            registry.clone(),
        );
        // The pidfile and the watchdog always refer to a real daemon process.
        let probe: Arc<dyn ProcessProbe> = Arc::new(OsProcessProbe);

        let supervisor = Arc::new(WorkerSupervisor::new(
            jobs.clone(),
            PriorityScheduler::new(SchedulerSettings::from(&config.worker), self.role),
            registry,
            workers.spawner,
            workers.probe,
            locks.clone(),
            SupervisorSettings::new(&config.worker, &config.locks),
        ));

        let defer_limit = config.worker.defer_limit;
        let dispatcher = Arc::new(DeliveryDispatcher::new(
            tracker.clone(),
            jobs.clone(),
            deliverer.clone(),
            defer_limit,
        ));

        let pidfile = PidFile::new(&config.daemon.pidfile);
        let launcher: Arc<dyn DaemonLauncher> =
            Arc::new(CommandLauncher::new(executable, self.child_args));
        let watchdog = Arc::new(DaemonWatchdog::new(
            pidfile.clone(),
            probe.clone(),
            Some(launcher),
            locks,
            config.daemon.watchdog_interval(),
            config.daemon.enabled,
        ));

        // The daemon's own sweep has no watchdog: it is the process being watched.
        let daemon_sweep = Arc::new(CronSweep::new(
            supervisor.clone(),
            dispatcher.clone(),
            tracker.clone(),
            defer_limit,
        ));
        let sweep = Arc::new(
            CronSweep::new(supervisor.clone(), dispatcher, tracker.clone(), defer_limit)
                .with_watchdog(watchdog.clone()),
        );

        let commands = CommandRegistry::new()
            .register(
                Command::ApDelivery,
                Arc::new(ApDeliveryCommand::new(tracker.clone(), deliverer.clone())),
            )
            .register(
                Command::BulkDelivery,
                Arc::new(BulkDeliveryCommand::new(tracker, deliverer)),
            )
            .register(Command::Cron, Arc::new(CronCommand::new(sweep.clone())));
        debug!(commands = ?commands.commands(), "Command registry built");

        let runner = Arc::new(JobRunner::new(
            jobs.clone(),
            commands,
            DeferPolicy::new(defer_limit),
            config.worker.cooldown(),
        ));

        if let Some(tasks) = &workers.tasks {
            tasks.bind(runner.clone());
        }

        info!(role = %self.role, ?isolation, "Application components wired");

        Ok(App {
            config,
            pool,
            jobs,
            supervisor,
            sweep,
            daemon_sweep,
            watchdog,
            runner,
            pidfile,
            probe,
            tasks: workers.tasks,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The wired component graph.
pub struct App {
    config: AppConfig,
    pool: MySqlPool,
    jobs: Arc<dyn JobStore>,
    supervisor: Arc<WorkerSupervisor>,
    sweep: Arc<CronSweep>,
    daemon_sweep: Arc<CronSweep>,
    watchdog: Arc<DaemonWatchdog>,
    runner: Arc<JobRunner>,
    pidfile: PidFile,
    probe: Arc<dyn ProcessProbe>,
    tasks: Option<Arc<TaskSpawner>>,
}

impl App {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    pub fn jobs(&self) -> Arc<dyn JobStore> {
        self.jobs.clone()
    }

    pub fn supervisor(&self) -> &WorkerSupervisor {
        &self.supervisor
    }

    /// Sweep run by the `cron` mode and the `Cron` command.
    pub fn sweep(&self) -> &CronSweep {
        &self.sweep
    }

    pub fn watchdog(&self) -> &DaemonWatchdog {
        &self.watchdog
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    /// Wait for task workers started by this process. Process workers are
    /// detached and not waited for.
    pub async fn wait_for_workers(&self) {
        if let Some(tasks) = &self.tasks {
            let running = tasks.active_tasks();
            if running > 0 {
                info!(running, "Waiting for worker tasks");
            }
            tasks.join_all().await;
        }
    }

    /// The long-running daemon on the configured tick and cron schedule.
    pub fn daemon(&self) -> CourierResult<Daemon> {
        let schedule = parse_schedule(&self.config.daemon.cron_schedule)?;
        Ok(Daemon::new(
            self.supervisor.clone(),
            self.daemon_sweep.clone(),
            self.pidfile.clone(),
            self.probe.clone(),
            self.config.daemon.tick_interval(),
            schedule,
        ))
    }
}

/// Connect without building the rest, for `migrate` and `enqueue`.
pub async fn connect_jobs(config: &AppConfig) -> CourierResult<(MySqlPool, MySqlJobStore)> {
    let pool = create_pool(&config.database).await?;
    let store = MySqlJobStore::new(pool.clone());
    Ok((pool, store))
}
