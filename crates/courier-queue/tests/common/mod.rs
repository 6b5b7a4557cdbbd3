//! Shared fixtures for the queue integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use courier_queue::{
    DeliveryDispatcher, DeliveryFailure, DeliveryTargetTracker, Job, MemoryDeliveryStore,
    MemoryJobStore, MemoryLocks, PriorityScheduler, ProcessProbe, ProcessRegistry,
    ProcessSpawner, Role, SchedulerSettings, SpawnError, StaticReachability, SupervisorSettings,
    Transport, WorkerSupervisor,
};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod database;

/// Pretend worker processes: spawning hands out a pid that stays alive
/// until killed.
#[derive(Default)]
pub struct FakeProcesses {
    next: AtomicU32,
    alive: Mutex<HashSet<u32>>,
    pub terminated: Mutex<Vec<u32>>,
}

impl FakeProcesses {
    pub fn kill(&self, pid: u32) {
        self.alive.lock().remove(&pid);
    }
}

#[async_trait]
impl ProcessSpawner for FakeProcesses {
    async fn spawn(&self, _job: &Job) -> Result<u32, SpawnError> {
        let pid = 20_000 + self.next.fetch_add(1, Ordering::SeqCst);
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

/// Transport answering from a script, then with `fallback`.
pub struct ScriptedTransport {
    answers: Mutex<VecDeque<Result<u16, DeliveryFailure>>>,
    fallback: Result<u16, DeliveryFailure>,
    pub posts: Mutex<Vec<(String, String)>>,
}

impl ScriptedTransport {
    pub fn always(answer: Result<u16, DeliveryFailure>) -> Arc<Self> {
        Self::scripted(Vec::new(), answer)
    }

    pub fn scripted(
        answers: Vec<Result<u16, DeliveryFailure>>,
        fallback: Result<u16, DeliveryFailure>,
    ) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into()),
            fallback,
            posts: Mutex::new(Vec::new()),
        })
    }

    pub fn post_count(&self) -> usize {
        self.posts.lock().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post(&self, inbox: &str, payload: &str) -> Result<u16, DeliveryFailure> {
        self.posts.lock().push((inbox.to_string(), payload.to_string()));
        self.answers
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Everything a supervisor needs, on in-memory stores.
pub struct Harness {
    pub jobs: Arc<MemoryJobStore>,
    pub deliveries: Arc<MemoryDeliveryStore>,
    pub oracle: Arc<StaticReachability>,
    pub tracker: Arc<DeliveryTargetTracker>,
    pub processes: Arc<FakeProcesses>,
    pub locks: Arc<MemoryLocks>,
    pub registry: Arc<ProcessRegistry>,
    pub supervisor: Arc<WorkerSupervisor>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_limits(5, 1)
    }

    pub fn with_limits(max_processes: u32, fetch_limit: u32) -> Self {
        let jobs = Arc::new(MemoryJobStore::new());
        let deliveries = Arc::new(MemoryDeliveryStore::new());
        let oracle = Arc::new(StaticReachability::new());
        let tracker = Arc::new(DeliveryTargetTracker::new(
            deliveries.clone(),
            oracle.clone(),
            Duration::from_secs(60),
        ));
        let processes = Arc::new(FakeProcesses::default());
        let locks = Arc::new(MemoryLocks::new());
        let registry = Arc::new(ProcessRegistry::new());

        let scheduler = PriorityScheduler::new(
            SchedulerSettings {
                max_processes_backend: max_processes,
                max_connections: 100,
                ..SchedulerSettings::default()
            },
            Role::Backend,
        );
        let supervisor = Arc::new(WorkerSupervisor::new(
            jobs.clone(),
            scheduler,
            registry.clone(),
            processes.clone(),
            processes.clone(),
            locks.clone(),
            SupervisorSettings {
                fetch_limit,
                lock_timeout: Duration::from_millis(200),
                claimer_pid: 1,
                ..SupervisorSettings::default()
            },
        ));

        Self {
            jobs,
            deliveries,
            oracle,
            tracker,
            processes,
            locks,
            registry,
            supervisor,
        }
    }

    /// Dispatcher delivering through `transport`.
    pub fn dispatcher(&self, transport: Arc<dyn Transport>) -> DeliveryDispatcher {
        let delivery = Arc::new(courier_queue::ActivityDeliverer::new(
            self.tracker.clone(),
            transport,
        ));
        DeliveryDispatcher::new(self.tracker.clone(), self.jobs.clone(), delivery, 15)
    }
}
