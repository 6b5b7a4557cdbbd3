//! Job store abstraction.

use crate::error::PersistenceError;
use crate::job::{Job, JobId, NewJob};
use crate::priority::Priority;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, PersistenceError>;

/// Queued and running job counts per tier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueCounts {
    /// Claimable jobs per tier.
    pub queued: BTreeMap<Priority, u64>,
    /// Claimed, unfinished jobs per tier.
    pub running: BTreeMap<Priority, u64>,
}

impl QueueCounts {
    /// Claimable jobs in one tier.
    pub fn queued(&self, priority: Priority) -> u64 {
        self.queued.get(&priority).copied().unwrap_or(0)
    }

    /// Running jobs in one tier.
    pub fn running(&self, priority: Priority) -> u64 {
        self.running.get(&priority).copied().unwrap_or(0)
    }

    /// Claimable jobs over all tiers.
    pub fn total_queued(&self) -> u64 {
        self.queued.values().sum()
    }

    /// Running jobs over all tiers.
    pub fn total_running(&self) -> u64 {
        self.running.values().sum()
    }
}

/// Database connection usage sampled from the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionLoad {
    /// Open connections.
    pub current: u32,
    /// Server-side connection limit, if known.
    pub server_max: Option<u32>,
}

/// Persistent queue of jobs.
///
/// Every operation may fail with a [`PersistenceError`]; callers treat it as
/// transient and retry on their next tick.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job, or return the id of an identical unfinished job.
    ///
    /// With `force_priority`, the existing job's priority is overwritten as
    /// long as it has not been claimed.
    async fn enqueue(&self, job: NewJob) -> StoreResult<JobId>;

    /// Atomically claim up to `limit` claimable jobs in the given tiers,
    /// ordered by priority, retrial count and creation time.
    async fn claim_next(
        &self,
        eligible: &[Priority],
        limit: u32,
        claimer_pid: u32,
    ) -> StoreResult<Vec<Job>>;

    /// Record the pid of the worker running a claimed job.
    async fn assign_worker(&self, id: JobId, pid: u32) -> StoreResult<()>;

    /// Fetch a job.
    async fn get(&self, id: JobId) -> StoreResult<Option<Job>>;

    /// Mark a job finished.
    async fn mark_done(&self, id: JobId) -> StoreResult<()>;

    /// Put a claimed job back in the queue without penalty.
    async fn release(&self, id: JobId) -> StoreResult<()>;

    /// Put a claimed job back in the queue at `priority`, counting a retrial
    /// and resetting its creation time.
    async fn requeue(&self, id: JobId, priority: Priority) -> StoreResult<()>;

    /// Postpone a job until `next_try`.
    async fn defer(
        &self,
        id: JobId,
        retrial: u32,
        next_try: DateTime<Utc>,
        priority: Priority,
    ) -> StoreResult<()>;

    /// Unfinished jobs that are claimed.
    async fn running(&self) -> StoreResult<Vec<Job>>;

    /// Delete finished jobs that completed more than `age` ago.
    async fn delete_done_older_than(&self, age: Duration) -> StoreResult<u64>;

    /// Queued and running counts per tier.
    async fn queue_counts(&self) -> StoreResult<QueueCounts>;

    /// Current database connection usage.
    async fn connection_load(&self) -> StoreResult<ConnectionLoad>;

    /// Table maintenance after large deletes.
    async fn optimize(&self) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_counts() {
        let mut counts = QueueCounts::default();
        counts.queued.insert(Priority::High, 3);
        counts.queued.insert(Priority::Low, 2);
        counts.running.insert(Priority::High, 1);

        assert_eq!(counts.queued(Priority::High), 3);
        assert_eq!(counts.queued(Priority::Critical), 0);
        assert_eq!(counts.total_queued(), 5);
        assert_eq!(counts.total_running(), 1);
    }
}
