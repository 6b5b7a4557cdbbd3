//! Worker supervision: spawning, stale detection and queue cleanup.
//!
//! A [`WorkerSupervisor`] owns its [`ProcessRegistry`] and talks to the job
//! store, the process layer and the named locks it was built with. None of
//! its operations return errors; failures are logged, counted in the
//! returned report, and retried on the next tick or sweep.

use crate::error::{JobError, StaleProcessError};
use crate::job::{Job, JobId};
use crate::locks::{self, NamedLocks, LOCK_PROCESS, LOCK_WORKER};
use crate::metrics::{JobMetrics, SupervisorMetrics};
use crate::priority::Priority;
use crate::process::{ProcessProbe, ProcessSpawner};
use crate::registry::ProcessRegistry;
use crate::scheduler::{PriorityScheduler, WorkerQuota};
use crate::store::JobStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use courier_config::{LockConfig, MaxDurationConfig, WorkerConfig};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Supervisor knobs taken from the worker and lock configuration.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Jobs claimed per tick over all tiers.
    pub fetch_limit: u32,
    pub max_duration: MaxDurationConfig,
    /// How long finished jobs are kept.
    pub retention: Duration,
    pub lock_timeout: Duration,
    pub lock_ttl: Duration,
    /// Pid written into claimed rows until the worker's own pid is known.
    pub claimer_pid: u32,
}

impl SupervisorSettings {
    pub fn new(worker: &WorkerConfig, locks: &LockConfig) -> Self {
        Self {
            fetch_limit: worker.fetch_limit,
            max_duration: worker.max_duration,
            retention: worker.retention(),
            lock_timeout: locks.timeout(),
            lock_ttl: locks.ttl(),
            claimer_pid: std::process::id(),
        }
    }

    /// Maximum run time of a tier.
    pub fn max_duration(&self, priority: Priority) -> ChronoDuration {
        let minutes = match priority {
            Priority::Critical => self.max_duration.critical,
            Priority::High => self.max_duration.high,
            Priority::Medium => self.max_duration.medium,
            Priority::Low => self.max_duration.low,
            Priority::Negligible => self.max_duration.negligible,
        };
        ChronoDuration::minutes(i64::try_from(minutes).unwrap_or(i64::MAX / 60_000))
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::new(&WorkerConfig::default(), &LockConfig::default())
    }
}

/// Result of one tick.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub quota: Option<WorkerQuota>,
    pub claimed: usize,
    /// Spawned workers as `(job, pid)`.
    pub spawned: Vec<(JobId, u32)>,
    pub spawn_failures: usize,
    /// `LOCK_WORKER` was held elsewhere for the whole timeout.
    pub lock_busy: bool,
    pub errors: Vec<String>,
}

/// Result of one stale sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    /// Claims whose worker was gone, put back without penalty.
    pub released: Vec<JobId>,
    /// Overrunning workers terminated and requeued one tier lower.
    pub killed: Vec<JobId>,
    /// `LOCK_WORKER` was held elsewhere for the whole timeout.
    pub lock_busy: bool,
    pub errors: Vec<String>,
}

/// Result of one queue cleanup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub deleted: u64,
    pub optimized: bool,
    pub errors: Vec<String>,
}

/// Spawns workers for queued jobs and reclaims jobs from dead ones.
pub struct WorkerSupervisor {
    store: Arc<dyn JobStore>,
    scheduler: PriorityScheduler,
    registry: Arc<ProcessRegistry>,
    spawner: Arc<dyn ProcessSpawner>,
    probe: Arc<dyn ProcessProbe>,
    locks: Arc<dyn NamedLocks>,
    settings: SupervisorSettings,
}

impl WorkerSupervisor {
    pub fn new(
        store: Arc<dyn JobStore>,
        scheduler: PriorityScheduler,
        registry: Arc<ProcessRegistry>,
        spawner: Arc<dyn ProcessSpawner>,
        probe: Arc<dyn ProcessProbe>,
        locks: Arc<dyn NamedLocks>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            store,
            scheduler,
            registry,
            spawner,
            probe,
            locks,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Sample the load, claim what the budget allows and spawn workers.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        let (load, counts) = match (self.store.connection_load().await, self.store.queue_counts().await) {
            (Ok(load), Ok(counts)) => (load, counts),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "Failed to sample queue state");
                report.errors.push(e.to_string());
                return report;
            }
        };

        for priority in Priority::ALL {
            JobMetrics::update_depth(priority, counts.queued(priority), counts.running(priority));
        }

        let quota = self.scheduler.plan(load, &counts);
        SupervisorMetrics::update_load(quota.load, quota.allowed);

        if quota.suppressed {
            info!(load = quota.load, "Connection load too high, not spawning workers");
            report.quota = Some(quota);
            return report;
        }
        if quota.budgets.is_empty() {
            debug!(allowed = quota.allowed, running = quota.running, "Nothing to spawn");
            report.quota = Some(quota);
            return report;
        }

        let token = match locks::acquire(
            self.locks.as_ref(),
            LOCK_WORKER,
            self.settings.lock_timeout,
            self.settings.lock_ttl,
        )
        .await
        {
            Ok(token) => token,
            Err(JobError::LockTimeout(name)) => {
                debug!(lock = %name, "Claim lock busy, skipping tick");
                report.lock_busy = true;
                report.quota = Some(quota);
                return report;
            }
            Err(e) => {
                error!(error = %e, "Failed to take claim lock");
                report.errors.push(e.to_string());
                report.quota = Some(quota);
                return report;
            }
        };

        // Workers are spawned and their pids recorded before the lock is
        // released, so maintenance never sees a claimed job without a pid.
        match self.claim(&quota).await {
            Ok(claimed) => {
                report.claimed = claimed.len();
                for job in claimed {
                    self.spawn_worker(&job, &mut report).await;
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to claim jobs");
                report.errors.push(e.to_string());
            }
        }

        if let Err(e) = self.locks.release(&token).await {
            warn!(lock = LOCK_WORKER, error = %e, "Failed to release lock");
        }

        report.quota = Some(quota);
        report
    }

    /// Claim jobs tier by tier. The caller holds `LOCK_WORKER`.
    async fn claim(&self, quota: &WorkerQuota) -> Result<Vec<Job>, JobError> {
        let mut claimed = Vec::new();
        let mut left = self.settings.fetch_limit;
        let mut failure = None;
        for budget in &quota.budgets {
            if left == 0 {
                break;
            }
            let limit = budget.slots.min(left);
            match self
                .store
                .claim_next(&[budget.priority], limit, self.settings.claimer_pid)
                .await
            {
                Ok(jobs) => {
                    left -= u32::try_from(jobs.len()).unwrap_or(left).min(left);
                    for job in &jobs {
                        JobMetrics::job_claimed(job.priority);
                    }
                    claimed.extend(jobs);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        match failure {
            // Jobs claimed before the failure still get workers.
            Some(e) if claimed.is_empty() => Err(e.into()),
            Some(e) => {
                warn!(error = %e, claimed = claimed.len(), "Claim interrupted");
                Ok(claimed)
            }
            None => Ok(claimed),
        }
    }

    async fn spawn_worker(&self, job: &Job, report: &mut TickReport) {
        match self.spawner.spawn(job).await {
            Ok(pid) => {
                self.registry.register(job.id, pid, job.priority);
                if let Err(e) = self.store.assign_worker(job.id, pid).await {
                    error!(job_id = %job.id, pid, error = %e, "Failed to record worker pid");
                    report.errors.push(e.to_string());
                }
                SupervisorMetrics::worker_spawned(job.priority);
                info!(job_id = %job.id, pid, priority = %job.priority, command = %job.command, "Worker spawned");
                report.spawned.push((job.id, pid));
            }
            Err(e) => {
                error!(job_id = %job.id, priority = %job.priority, error = %e, "Failed to spawn worker");
                SupervisorMetrics::spawn_failed(job.priority);
                report.spawn_failures += 1;
                // Left claimed with pid 0; the stale sweep puts it back.
                if let Err(e) = self.store.assign_worker(job.id, 0).await {
                    report.errors.push(e.to_string());
                }
            }
        }
    }

    /// Reclaim jobs of dead workers and kill workers that overran.
    pub async fn sweep_stale(&self) -> SweepReport {
        self.sweep_stale_at(Utc::now()).await
    }

    /// [`Self::sweep_stale`] with an explicit clock.
    ///
    /// Runs under `LOCK_WORKER`, so claims a tick is still spawning for are
    /// never taken for dead.
    pub async fn sweep_stale_at(&self, now: DateTime<Utc>) -> SweepReport {
        let token = match locks::acquire(
            self.locks.as_ref(),
            LOCK_WORKER,
            self.settings.lock_timeout,
            self.settings.lock_ttl,
        )
        .await
        {
            Ok(token) => token,
            Err(JobError::LockTimeout(name)) => {
                debug!(lock = %name, "Claim lock busy, skipping stale sweep");
                return SweepReport {
                    lock_busy: true,
                    ..SweepReport::default()
                };
            }
            Err(e) => {
                error!(error = %e, "Failed to take claim lock");
                return SweepReport {
                    errors: vec![e.to_string()],
                    ..SweepReport::default()
                };
            }
        };

        let report = self.reclaim(now).await;

        if let Err(e) = self.locks.release(&token).await {
            warn!(lock = LOCK_WORKER, error = %e, "Failed to release lock");
        }
        report
    }

    async fn reclaim(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let running = match self.store.running().await {
            Ok(running) => running,
            Err(e) => {
                error!(error = %e, "Failed to list running jobs");
                report.errors.push(e.to_string());
                return report;
            }
        };
        report.examined = running.len();

        for job in &running {
            if job.pid == 0 || !self.probe.is_alive(job.pid) {
                let stale = StaleProcessError {
                    job_id: job.id,
                    pid: job.pid,
                };
                match self.store.release(job.id).await {
                    Ok(()) => {
                        warn!(job_id = %job.id, pid = job.pid, priority = %job.priority, error = %stale, "Released stale claim");
                        self.registry.unregister_job(job.id);
                        SupervisorMetrics::stale_released(job.priority);
                        report.released.push(job.id);
                    }
                    Err(e) => report.errors.push(e.to_string()),
                }
                continue;
            }

            let Some(running_for) = job.running_for(now) else {
                continue;
            };
            let limit = self.settings.max_duration(job.priority);
            if running_for <= limit {
                continue;
            }

            let demoted = job.priority.demote();
            if let Err(e) = self.spawner.terminate(job.pid) {
                warn!(job_id = %job.id, pid = job.pid, error = %e, "Failed to terminate worker");
            }
            match self.store.requeue(job.id, demoted).await {
                Ok(()) => {
                    warn!(
                        job_id = %job.id,
                        pid = job.pid,
                        running_minutes = running_for.num_minutes(),
                        max_minutes = limit.num_minutes(),
                        priority = %job.priority,
                        new_priority = %demoted,
                        "Killed overrunning worker"
                    );
                    self.registry.unregister_job(job.id);
                    SupervisorMetrics::stale_killed(job.priority);
                    report.killed.push(job.id);
                }
                Err(e) => report.errors.push(e.to_string()),
            }
        }

        // Registry entries whose job is no longer claimed.
        let live: HashSet<JobId> = running.iter().map(|j| j.id).collect();
        for entry in self.registry.entries() {
            if !live.contains(&entry.job_id) {
                self.registry.unregister_job(entry.job_id);
            }
        }

        if !report.released.is_empty() || !report.killed.is_empty() {
            info!(
                examined = report.examined,
                released = report.released.len(),
                killed = report.killed.len(),
                "Stale sweep finished"
            );
        }
        report
    }

    /// Delete old finished jobs and optimize the queue table.
    pub async fn clean_queue(&self) -> CleanReport {
        let mut report = CleanReport::default();

        match self.store.delete_done_older_than(self.settings.retention).await {
            Ok(deleted) => {
                report.deleted = deleted;
                if deleted > 0 {
                    info!(deleted, "Deleted finished jobs");
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to delete finished jobs");
                report.errors.push(e.to_string());
            }
        }

        let outcome = locks::with_locks(
            self.locks.as_ref(),
            &[LOCK_PROCESS, LOCK_WORKER],
            self.settings.lock_timeout,
            self.settings.lock_ttl,
            self.store.optimize(),
        )
        .await;

        match outcome {
            Ok(Some(Ok(()))) => report.optimized = true,
            Ok(Some(Err(e))) => {
                error!(error = %e, "Failed to optimize queue table");
                report.errors.push(e.to_string());
            }
            Ok(None) => debug!("Maintenance locks busy, skipping optimize"),
            Err(e) => {
                error!(error = %e, "Failed to take maintenance locks");
                report.errors.push(e.to_string());
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpawnError;
    use crate::job::NewJob;
    use crate::locks::MemoryLocks;
    use crate::memory::MemoryJobStore;
    use crate::scheduler::{Role, SchedulerSettings};
    use crate::store::ConnectionLoad;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Hands out pids and tracks which of them are alive.
    #[derive(Default)]
    struct FakeProcesses {
        next: AtomicU32,
        alive: Mutex<HashSet<u32>>,
        terminated: Mutex<Vec<u32>>,
        fail: Mutex<bool>,
    }

    impl FakeProcesses {
        fn kill(&self, pid: u32) {
            self.alive.lock().remove(&pid);
        }
    }

    #[async_trait]
    impl ProcessSpawner for FakeProcesses {
        async fn spawn(&self, _job: &Job) -> Result<u32, SpawnError> {
            if *self.fail.lock() {
                return Err(SpawnError::Unsupported("fork refused".into()));
            }
            let pid = 1000 + self.next.fetch_add(1, Ordering::SeqCst);
            self.alive.lock().insert(pid);
            Ok(pid)
        }

        fn terminate(&self, pid: u32) -> Result<(), SpawnError> {
            self.terminated.lock().push(pid);
            self.kill(pid);
            Ok(())
        }
    }

    impl ProcessProbe for FakeProcesses {
        fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().contains(&pid)
        }
    }

    struct Fixture {
        store: Arc<MemoryJobStore>,
        processes: Arc<FakeProcesses>,
        locks: Arc<MemoryLocks>,
        supervisor: WorkerSupervisor,
    }

    fn fixture(max_processes: u32, fetch_limit: u32) -> Fixture {
        let store = Arc::new(MemoryJobStore::new());
        let processes = Arc::new(FakeProcesses::default());
        let locks = Arc::new(MemoryLocks::new());
        let scheduler = PriorityScheduler::new(
            SchedulerSettings {
                max_processes_backend: max_processes,
                max_connections: 100,
                ..SchedulerSettings::default()
            },
            Role::Backend,
        );
        let settings = SupervisorSettings {
            fetch_limit,
            lock_timeout: Duration::from_millis(100),
            claimer_pid: 1,
            ..SupervisorSettings::default()
        };
        let supervisor = WorkerSupervisor::new(
            store.clone(),
            scheduler,
            Arc::new(ProcessRegistry::new()),
            processes.clone(),
            processes.clone(),
            locks.clone(),
            settings,
        );
        Fixture {
            store,
            processes,
            locks,
            supervisor,
        }
    }

    #[tokio::test]
    async fn test_tick_spawns_in_tier_order() {
        let f = fixture(5, 2);
        f.store.enqueue(NewJob::new("Cron").priority(Priority::Low)).await.unwrap();
        let high = f.store.enqueue(NewJob::new("APDelivery").param("a").priority(Priority::High)).await.unwrap();
        let critical = f.store.enqueue(NewJob::new("APDelivery").param("b").priority(Priority::Critical)).await.unwrap();

        let report = f.supervisor.tick().await;
        assert_eq!(report.claimed, 2);
        let ids: Vec<JobId> = report.spawned.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![critical, high]);

        for (id, pid) in &report.spawned {
            assert_eq!(f.store.get(*id).await.unwrap().unwrap().pid, *pid);
            assert_eq!(f.supervisor.registry().pid_for(*id), Some(*pid));
        }
        assert!(!f.locks.is_held(LOCK_WORKER));
    }

    #[tokio::test]
    async fn test_tick_respects_running_count() {
        let f = fixture(2, 10);
        for i in 0..4 {
            f.store.enqueue(NewJob::new("APDelivery").param(i.to_string())).await.unwrap();
        }

        assert_eq!(f.supervisor.tick().await.spawned.len(), 2);
        assert_eq!(f.supervisor.tick().await.spawned.len(), 0);
    }

    #[tokio::test]
    async fn test_tick_suppressed_under_load() {
        let f = fixture(5, 5);
        f.store.enqueue(NewJob::new("Cron")).await.unwrap();
        f.store.set_connection_load(ConnectionLoad { current: 90, server_max: None });

        let report = f.supervisor.tick().await;
        assert!(report.quota.unwrap().suppressed);
        assert_eq!(report.claimed, 0);
    }

    #[tokio::test]
    async fn test_tick_skips_when_lock_busy() {
        let f = fixture(5, 5);
        f.store.enqueue(NewJob::new("Cron")).await.unwrap();
        let _held = f.locks.try_acquire(LOCK_WORKER, Duration::from_secs(60)).await.unwrap();

        let report = f.supervisor.tick().await;
        assert!(report.lock_busy);
        assert_eq!(f.store.queue_counts().await.unwrap().total_queued(), 1);
    }

    /// Records whether the claim lock was held during each spawn.
    struct LockWatchingSpawner {
        locks: Arc<MemoryLocks>,
        held: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl ProcessSpawner for LockWatchingSpawner {
        async fn spawn(&self, _job: &Job) -> Result<u32, SpawnError> {
            self.held.lock().push(self.locks.is_held(LOCK_WORKER));
            Ok(4242)
        }

        fn terminate(&self, _pid: u32) -> Result<(), SpawnError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_claim_lock_held_across_spawn() {
        let f = fixture(5, 5);
        let spawner = Arc::new(LockWatchingSpawner {
            locks: f.locks.clone(),
            held: Mutex::new(Vec::new()),
        });
        let supervisor = WorkerSupervisor::new(
            f.store.clone(),
            PriorityScheduler::new(
                SchedulerSettings {
                    max_connections: 100,
                    ..SchedulerSettings::default()
                },
                Role::Backend,
            ),
            Arc::new(ProcessRegistry::new()),
            spawner.clone(),
            f.processes.clone(),
            f.locks.clone(),
            SupervisorSettings {
                fetch_limit: 2,
                lock_timeout: Duration::from_millis(100),
                claimer_pid: 1,
                ..SupervisorSettings::default()
            },
        );
        let a = f.store.enqueue(NewJob::new("APDelivery").param("a")).await.unwrap();
        f.store.enqueue(NewJob::new("APDelivery").param("b")).await.unwrap();

        let report = supervisor.tick().await;
        assert_eq!(report.spawned.len(), 2);
        assert_eq!(*spawner.held.lock(), vec![true, true]);
        assert_eq!(f.store.get(a).await.unwrap().unwrap().pid, 4242);
        assert!(!f.locks.is_held(LOCK_WORKER));
    }

    #[tokio::test]
    async fn test_spawn_failure_released_by_sweep() {
        let f = fixture(5, 5);
        let id = f.store.enqueue(NewJob::new("Cron").priority(Priority::High)).await.unwrap();
        *f.processes.fail.lock() = true;

        let report = f.supervisor.tick().await;
        assert_eq!(report.spawn_failures, 1);
        let job = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.pid, 0);
        assert!(job.is_claimed());

        let sweep = f.supervisor.sweep_stale().await;
        assert_eq!(sweep.released, vec![id]);
        let job = f.store.get(id).await.unwrap().unwrap();
        assert!(job.is_claimable_at(Utc::now()));
        assert_eq!(job.priority, Priority::High);
    }

    #[tokio::test]
    async fn test_sweep_kills_overrunning_worker() {
        let f = fixture(5, 5);
        let id = f.store.enqueue(NewJob::new("Cron").priority(Priority::Critical)).await.unwrap();
        let report = f.supervisor.tick().await;
        let pid = report.spawned[0].1;

        // Critical may run for 720 minutes and is never demoted.
        let later = Utc::now() + ChronoDuration::minutes(721);
        let sweep = f.supervisor.sweep_stale_at(later).await;
        assert_eq!(sweep.killed, vec![id]);
        assert_eq!(*f.processes.terminated.lock(), vec![pid]);

        let job = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.priority, Priority::Critical);
        assert_eq!(job.retrial, 1);
        assert!(f.supervisor.registry().get(id).is_none());
    }

    #[tokio::test]
    async fn test_sweep_skips_while_claim_lock_busy() {
        let f = fixture(5, 5);
        let id = f.store.enqueue(NewJob::new("Cron").priority(Priority::High)).await.unwrap();
        *f.processes.fail.lock() = true;
        f.supervisor.tick().await;

        // A tick elsewhere is between claiming and recording the pid.
        let held = f.locks.try_acquire(LOCK_WORKER, Duration::from_secs(60)).await.unwrap().unwrap();
        let sweep = f.supervisor.sweep_stale().await;
        assert!(sweep.lock_busy);
        assert!(sweep.released.is_empty());
        assert!(f.store.get(id).await.unwrap().unwrap().is_claimed());

        f.locks.release(&held).await.unwrap();
        assert_eq!(f.supervisor.sweep_stale().await.released, vec![id]);
    }

    #[tokio::test]
    async fn test_sweep_leaves_healthy_workers() {
        let f = fixture(5, 5);
        let id = f.store.enqueue(NewJob::new("Cron").priority(Priority::High)).await.unwrap();
        f.supervisor.tick().await;

        let sweep = f.supervisor.sweep_stale_at(Utc::now() + ChronoDuration::minutes(9)).await;
        assert_eq!(sweep.examined, 1);
        assert!(sweep.released.is_empty() && sweep.killed.is_empty());
        assert!(f.store.get(id).await.unwrap().unwrap().is_claimed());
    }

    #[tokio::test]
    async fn test_clean_queue() {
        let f = fixture(5, 5);
        let id = f.store.enqueue(NewJob::new("Cron")).await.unwrap();
        f.store.mark_done(id).await.unwrap();
        let mut job = f.store.get(id).await.unwrap().unwrap();
        job.executed_at = Some(Utc::now() - ChronoDuration::hours(2));
        f.store.put(job);

        let report = f.supervisor.clean_queue().await;
        assert_eq!(report.deleted, 1);
        assert!(report.optimized);
        assert!(!f.locks.is_held(LOCK_PROCESS));
        assert!(!f.locks.is_held(LOCK_WORKER));
    }

    #[tokio::test]
    async fn test_clean_queue_skips_optimize_when_locked() {
        let f = fixture(5, 5);
        let _held = f.locks.try_acquire(LOCK_WORKER, Duration::from_secs(60)).await.unwrap();

        let report = f.supervisor.clean_queue().await;
        assert!(!report.optimized);
        assert!(report.errors.is_empty());
        assert!(!f.locks.is_held(LOCK_PROCESS));
    }
}
