//! Worker process control.
//!
//! The supervisor only sees the traits in this module. With process isolation
//! [`CommandSpawner`] and [`OsProcessProbe`] run every job in its own
//! `courier execute --job <id>` process. With task isolation, and on
//! platforms without signals, [`TaskSpawner`] and [`HeartbeatProbe`] run jobs
//! as tokio tasks instead.

use crate::error::SpawnError;
use crate::job::Job;
use crate::registry::ProcessRegistry;
use crate::runner::JobRunner;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Starts and stops worker processes.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Start a worker for a claimed job, returning its pid.
    async fn spawn(&self, job: &Job) -> Result<u32, SpawnError>;

    /// Ask a worker to stop.
    fn terminate(&self, pid: u32) -> Result<(), SpawnError>;
}

/// Answers whether a worker pid is still running.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Starts a detached daemon process.
#[async_trait]
pub trait DaemonLauncher: Send + Sync {
    async fn launch(&self) -> Result<u32, SpawnError>;
}

/// Liveness through signal 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessProbe;

impl ProcessProbe for OsProcessProbe {
    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }

        // EPERM: the process exists but belongs to someone else.
        matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        false
    }
}

/// Send SIGTERM to a pid.
#[cfg(unix)]
pub fn send_terminate(pid: u32) -> Result<(), SpawnError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| SpawnError::Unsupported(format!("pid {} out of range", pid)))?;
    kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(|errno| SpawnError::Io(errno.into()))
}

/// Send SIGTERM to a pid.
#[cfg(not(unix))]
pub fn send_terminate(pid: u32) -> Result<(), SpawnError> {
    Err(SpawnError::Unsupported(format!(
        "cannot signal pid {} on this platform",
        pid
    )))
}

/// Runs each job in a child process of the Courier binary.
pub struct CommandSpawner {
    executable: PathBuf,
    args: Vec<String>,
    registry: Arc<ProcessRegistry>,
}

impl CommandSpawner {
    /// Spawn `executable [args...] execute --job <id>` per job.
    pub fn new(executable: PathBuf, args: Vec<String>, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            executable,
            args,
            registry,
        }
    }

    /// Spawner re-running the current executable.
    pub fn current_exe(args: Vec<String>, registry: Arc<ProcessRegistry>) -> Result<Self, SpawnError> {
        Ok(Self::new(std::env::current_exe()?, args, registry))
    }
}

#[async_trait]
impl ProcessSpawner for CommandSpawner {
    async fn spawn(&self, job: &Job) -> Result<u32, SpawnError> {
        let mut child = tokio::process::Command::new(&self.executable)
            .args(&self.args)
            .arg("execute")
            .arg("--job")
            .arg(job.id.to_string())
            .stdin(Stdio::null())
            .spawn()?;

        let pid = child.id().ok_or(SpawnError::MissingPid)?;
        let job_id = job.id;
        let registry = self.registry.clone();

        // Reap the child so it does not linger as a zombie that still
        // answers signal 0.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    debug!(job_id = %job_id, pid, "Worker process exited");
                }
                Ok(status) => {
                    warn!(job_id = %job_id, pid, status = %status, "Worker process failed");
                }
                Err(e) => {
                    error!(job_id = %job_id, pid, error = %e, "Failed to wait for worker process");
                }
            }
            if registry.pid_for(job_id) == Some(pid) {
                registry.unregister_job(job_id);
            }
        });

        Ok(pid)
    }

    fn terminate(&self, pid: u32) -> Result<(), SpawnError> {
        send_terminate(pid)
    }
}

/// First synthetic pid handed out by [`TaskSpawner`], far above real pids.
pub const SYNTHETIC_PID_BASE: u32 = 1 << 30;

/// Runs each job as a tokio task with a synthetic pid and heartbeats.
///
/// The runner may be bound after construction, since the runner's commands
/// usually need the supervisor that owns this spawner.
pub struct TaskSpawner {
    runner: OnceLock<Arc<JobRunner>>,
    registry: Arc<ProcessRegistry>,
    heartbeat_interval: Duration,
    next_pid: AtomicU32,
    tasks: Arc<Mutex<HashMap<u32, JoinHandle<()>>>>,
}

impl TaskSpawner {
    /// Create a spawner heartbeating into `registry`.
    pub fn new(runner: Arc<JobRunner>, registry: Arc<ProcessRegistry>) -> Self {
        let spawner = Self::unbound(registry);
        spawner.bind(runner);
        spawner
    }

    /// Create a spawner whose runner is supplied later through [`bind`](Self::bind).
    pub fn unbound(registry: Arc<ProcessRegistry>) -> Self {
        let heartbeat_interval = registry.heartbeat_timeout() / 3;
        Self {
            runner: OnceLock::new(),
            registry,
            heartbeat_interval,
            next_pid: AtomicU32::new(SYNTHETIC_PID_BASE),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Set the runner. Returns false if one was already bound.
    pub fn bind(&self, runner: Arc<JobRunner>) -> bool {
        self.runner.set(runner).is_ok()
    }

    /// Number of tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Wait for every running task to finish.
    pub async fn join_all(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut tasks = self.tasks.lock();
                tasks.drain().map(|(_, handle)| handle).collect()
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        error!(error = %e, "Worker task panicked");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ProcessSpawner for TaskSpawner {
    async fn spawn(&self, job: &Job) -> Result<u32, SpawnError> {
        let runner = self
            .runner
            .get()
            .cloned()
            .ok_or_else(|| SpawnError::Unsupported("task spawner has no runner".to_string()))?;
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let job_id = job.id;
        let registry = self.registry.clone();
        let tasks = self.tasks.clone();
        let period = self.heartbeat_interval.max(Duration::from_millis(1));

        // Hold the task map lock until the handle is stored so a fast task
        // cannot remove its entry before it exists.
        let mut guard = self.tasks.lock();
        let handle = tokio::spawn(
            async move {
                let mut heartbeat =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                let run = runner.run_by_id(job_id, pid);
                tokio::pin!(run);

                loop {
                    tokio::select! {
                        result = &mut run => {
                            if let Err(e) = result {
                                error!(error = %e, "Worker task failed");
                            }
                            break;
                        }
                        _ = heartbeat.tick() => {
                            registry.heartbeat(pid);
                        }
                    }
                }

                if registry.pid_for(job_id) == Some(pid) {
                    registry.unregister_job(job_id);
                }
                tasks.lock().remove(&pid);
            }
            .instrument(tracing::info_span!("worker_task", job_id = %job_id, pid)),
        );
        guard.insert(pid, handle);

        Ok(pid)
    }

    fn terminate(&self, pid: u32) -> Result<(), SpawnError> {
        if let Some(handle) = self.tasks.lock().remove(&pid) {
            handle.abort();
            info!(pid, "Worker task aborted");
        }
        Ok(())
    }
}

/// Liveness from registry heartbeats, for [`TaskSpawner`] workers.
pub struct HeartbeatProbe {
    registry: Arc<ProcessRegistry>,
}

impl HeartbeatProbe {
    pub fn new(registry: Arc<ProcessRegistry>) -> Self {
        Self { registry }
    }
}

impl ProcessProbe for HeartbeatProbe {
    fn is_alive(&self, pid: u32) -> bool {
        self.registry.is_alive(pid)
    }
}

/// Launches `executable [args...] daemon run` detached from the caller.
pub struct CommandLauncher {
    executable: PathBuf,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(executable: PathBuf, args: Vec<String>) -> Self {
        Self { executable, args }
    }

    /// Launcher re-running the current executable.
    pub fn current_exe(args: Vec<String>) -> Result<Self, SpawnError> {
        Ok(Self::new(std::env::current_exe()?, args))
    }
}

#[async_trait]
impl DaemonLauncher for CommandLauncher {
    async fn launch(&self) -> Result<u32, SpawnError> {
        let mut command = std::process::Command::new(&self.executable);
        command
            .args(&self.args)
            .arg("daemon")
            .arg("run")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command.spawn()?;
        let pid = child.id();
        info!(pid, executable = %self.executable.display(), "Daemon launched");
        Ok(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Command, CommandExecutor, CommandOutcome, CommandRegistry, JobContext};
    use crate::error::JobResult;
    use crate::job::NewJob;
    use crate::memory::MemoryJobStore;
    use crate::retry::DeferPolicy;
    use crate::store::JobStore;

    #[test]
    fn test_probe_sees_own_process() {
        let probe = OsProcessProbe;
        if cfg!(unix) {
            assert!(probe.is_alive(std::process::id()));
        }
        assert!(!probe.is_alive(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_after_exit() {
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();
        assert!(!OsProcessProbe.is_alive(pid));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_stops_process() {
        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        assert!(OsProcessProbe.is_alive(pid));

        send_terminate(pid).unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_heartbeat_probe() {
        let registry = Arc::new(ProcessRegistry::new());
        let probe = HeartbeatProbe::new(registry.clone());
        assert!(!probe.is_alive(42));
        registry.register(crate::job::JobId(1), 42, crate::priority::Priority::High);
        assert!(probe.is_alive(42));
    }

    struct Done;

    #[async_trait]
    impl CommandExecutor for Done {
        async fn execute(&self, _ctx: &JobContext) -> JobResult<CommandOutcome> {
            Ok(CommandOutcome::Completed)
        }
    }

    fn runner(store: Arc<MemoryJobStore>) -> Arc<JobRunner> {
        let commands = CommandRegistry::new().register(Command::Cron, Arc::new(Done));
        Arc::new(JobRunner::new(store, commands, DeferPolicy::new(15), Duration::ZERO))
    }

    #[tokio::test]
    async fn test_unbound_task_spawner_refuses() {
        let store = Arc::new(MemoryJobStore::new());
        let id = store.enqueue(NewJob::new("Cron")).await.unwrap();
        let job = store.get(id).await.unwrap().unwrap();

        let spawner = TaskSpawner::unbound(Arc::new(ProcessRegistry::new()));
        assert!(matches!(spawner.spawn(&job).await, Err(SpawnError::Unsupported(_))));
        assert_eq!(spawner.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_bound_task_spawner_runs_job() {
        let store = Arc::new(MemoryJobStore::new());
        let id = store.enqueue(NewJob::new("Cron")).await.unwrap();
        let job = store.get(id).await.unwrap().unwrap();
        let registry = Arc::new(ProcessRegistry::new());

        let spawner = TaskSpawner::unbound(registry.clone());
        assert!(spawner.bind(runner(store.clone())));
        assert!(!spawner.bind(runner(store.clone())));

        let pid = spawner.spawn(&job).await.unwrap();
        assert!(pid >= SYNTHETIC_PID_BASE);
        registry.register(id, pid, job.priority);

        spawner.join_all().await;
        assert_eq!(spawner.active_tasks(), 0);
        assert!(store.get(id).await.unwrap().unwrap().done);
        assert_eq!(registry.pid_for(id), None);
    }
}
