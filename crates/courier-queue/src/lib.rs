//! Courier Queue - Background Worker and Federated Delivery
//!
//! A priority job queue with supervised worker processes:
//! - Five priority tiers with load-based admission of new workers
//! - Atomic claims across concurrent supervisors
//! - Stale worker detection, termination and tier demotion
//! - Deferred retries with backoff and a retrial limit
//! - Per-destination delivery failure tracking with inline-or-queue dispatch
//! - A daemon loop with pidfile, cron sweep and watchdog
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Courier Queue Architecture                     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  Producers                        Daemon (tick + cron sweep)     │
//! │     │                                   │            │           │
//! │     ▼                                   ▼            ▼           │
//! │  ┌──────────────────┐   ┌──────────────────┐  ┌──────────────┐  │
//! │  │ DeliveryTarget   │◀──│ DeliveryDispatch │  │  CronSweep   │  │
//! │  │ Tracker          │   │ inline or queue  │◀─│ stale/clean/ │  │
//! │  └──────────────────┘   └────────┬─────────┘  │ dispatch     │  │
//! │                                  │            └──────┬───────┘  │
//! │                                  ▼                   │          │
//! │  ┌─────────────────────────────────────────────────┐ │          │
//! │  │                   JobStore                       │ │          │
//! │  │  ┌────────┐ ┌──────┐ ┌────────┐ ┌─────┐ ┌─────┐ │ │          │
//! │  │  │Critical│ │ High │ │ Medium │ │ Low │ │Negl.│ │ │          │
//! │  │  └────────┘ └──────┘ └────────┘ └─────┘ └─────┘ │ │          │
//! │  └───────────────────────┬─────────────────────────┘ │          │
//! │                          │ claim_next                │          │
//! │                          ▼                           ▼          │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │  WorkerSupervisor  (PriorityScheduler + ProcessRegistry) │   │
//! │  └───────────────────────┬─────────────────────────────────┘   │
//! │                          │ spawn                               │
//! │          ┌───────────────┼───────────────┐                     │
//! │          ▼               ▼               ▼                     │
//! │     ┌─────────┐     ┌─────────┐     ┌─────────┐                │
//! │     │ Worker  │     │ Worker  │     │ Worker  │  JobRunner     │
//! │     └─────────┘     └─────────┘     └─────────┘                │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use courier_queue::prelude::*;
//!
//! let store = MySqlJobStore::new(pool);
//! store
//!     .enqueue(NewJob::new("APDelivery").param(inbox).priority(Priority::High))
//!     .await?;
//!
//! let report = supervisor.tick().await;
//! ```

pub mod commands;
pub mod cron;
pub mod daemon;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod locks;
pub mod memory;
pub mod metrics;
pub mod mysql;
pub mod priority;
pub mod process;
pub mod redis;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod tracker;

pub use commands::{
    ApDeliveryCommand, BulkDeliveryCommand, Command, CommandExecutor, CommandOutcome,
    CommandRegistry, CronCommand, JobContext,
};
pub use crate::cron::{CronReport, CronSweep};
pub use daemon::{Daemon, DaemonStatus, DaemonSummary, DaemonWatchdog, PidFile, StartOutcome, StopOutcome, WatchdogOutcome};
pub use delivery::{ActivityDeliverer, DeliveryReport, HttpTransport, InboxDelivery, Transport};
pub use dispatcher::{DeliveryDispatcher, DispatchAction, DispatchReport};
pub use error::{DeliveryFailure, JobError, JobResult, PersistenceError, SpawnError, StaleProcessError};
pub use job::{Job, JobId, NewJob};
pub use locks::{MemoryLocks, NamedLocks, LOCK_PROCESS, LOCK_WATCHDOG, LOCK_WORKER};
pub use memory::{MemoryDeliveryStore, MemoryJobStore};
pub use crate::metrics::{register_metrics, DaemonMetrics, DeliveryMetrics, JobMetrics, SupervisorMetrics};
pub use mysql::{MySqlDeliveryStore, MySqlJobStore, MySqlReachability};
pub use priority::Priority;
pub use process::{
    CommandLauncher, CommandSpawner, DaemonLauncher, HeartbeatProbe, OsProcessProbe,
    ProcessProbe, ProcessSpawner, TaskSpawner,
};
pub use crate::redis::{RedisKeys, RedisLocks};
pub use registry::{ProcessEntry, ProcessRegistry};
pub use retry::{DeferDecision, DeferPolicy};
pub use runner::{JobRunner, RunOutcome};
pub use scheduler::{PriorityScheduler, Role, SchedulerSettings, TierBudget, WorkerQuota};
pub use store::{ConnectionLoad, JobStore, QueueCounts};
pub use supervisor::{CleanReport, SupervisorSettings, SweepReport, TickReport, WorkerSupervisor};
pub use tracker::{
    DeliveryStore, DeliveryTarget, DeliveryTargetTracker, NewActivity, PendingActivity,
    ReachabilityOracle, StaticReachability,
};

/// Re-export commonly used traits
pub mod prelude {
    pub use crate::job::{Job, JobId, NewJob};
    pub use crate::mysql::MySqlJobStore;
    pub use crate::priority::Priority;
    pub use crate::store::JobStore;
    pub use crate::supervisor::WorkerSupervisor;
    pub use crate::tracker::{DeliveryTargetTracker, NewActivity};
    pub use crate::{JobError, JobResult};
}
