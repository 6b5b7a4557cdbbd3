use crate::job::{Job, JobId, NewJob};
use crate::priority::Priority;
use crate::store::{ConnectionLoad, JobStore, QueueCounts, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

#[derive(Default)]
struct State {
    next_id: i64,
    jobs: BTreeMap<JobId, Job>,
}

/// Job store kept in process memory behind a single mutex.
///
/// Claims are atomic because every operation holds the lock for its whole
/// duration.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<State>,
    load: Mutex<ConnectionLoad>,
}

impl MemoryJobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection load reported by [`JobStore::connection_load`].
    pub fn set_connection_load(&self, load: ConnectionLoad) {
        *self.load.lock() = load;
    }

    /// All jobs, finished ones included.
    pub fn snapshot(&self) -> Vec<Job> {
        self.state.lock().jobs.values().cloned().collect()
    }

    /// Overwrite a job row. Test helper for backdating timestamps.
    pub fn put(&self, job: Job) {
        self.state.lock().jobs.insert(job.id, job);
    }

    fn update(&self, id: JobId, f: impl FnOnce(&mut Job)) {
        if let Some(job) = self.state.lock().jobs.get_mut(&id) {
            f(job);
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, new_job: NewJob) -> StoreResult<JobId> {
        let now = Utc::now();
        let mut state = self.state.lock();

        if let Some(existing) = state
            .jobs
            .values_mut()
            .find(|j| !j.done && j.same_work(&new_job.command, &new_job.parameters))
        {
            if new_job.force_priority && !existing.is_claimed() {
                existing.priority = new_job.priority;
            }
            debug!(job_id = %existing.id, command = %new_job.command, "Job already queued");
            return Ok(existing.id);
        }

        state.next_id += 1;
        let id = JobId(state.next_id);
        let next_try = new_job.next_try_from(now);
        state.jobs.insert(
            id,
            Job {
                id,
                command: new_job.command,
                parameters: new_job.parameters,
                priority: new_job.priority,
                created_at: now,
                executed_at: None,
                next_try,
                retrial: 0,
                done: false,
                pid: 0,
                force_priority: new_job.force_priority,
            },
        );

        Ok(id)
    }

    async fn claim_next(
        &self,
        eligible: &[Priority],
        limit: u32,
        claimer_pid: u32,
    ) -> StoreResult<Vec<Job>> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let mut candidates: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| eligible.contains(&j.priority) && j.is_claimable_at(now))
            .collect();
        candidates.sort_by_key(|j| (j.priority, j.retrial, j.created_at, j.id));
        let ids: Vec<JobId> = candidates
            .into_iter()
            .take(limit as usize)
            .map(|j| j.id)
            .collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.executed_at = Some(now);
                job.pid = claimer_pid;
                claimed.push(job.clone());
            }
        }

        Ok(claimed)
    }

    async fn assign_worker(&self, id: JobId, pid: u32) -> StoreResult<()> {
        self.update(id, |job| {
            if !job.done {
                job.pid = pid;
            }
        });
        Ok(())
    }

    async fn get(&self, id: JobId) -> StoreResult<Option<Job>> {
        Ok(self.state.lock().jobs.get(&id).cloned())
    }

    async fn mark_done(&self, id: JobId) -> StoreResult<()> {
        let now = Utc::now();
        self.update(id, |job| {
            job.done = true;
            job.executed_at = Some(now);
        });
        Ok(())
    }

    async fn release(&self, id: JobId) -> StoreResult<()> {
        self.update(id, |job| {
            if !job.done {
                job.executed_at = None;
                job.pid = 0;
            }
        });
        Ok(())
    }

    async fn requeue(&self, id: JobId, priority: Priority) -> StoreResult<()> {
        let now = Utc::now();
        self.update(id, |job| {
            if !job.done {
                job.executed_at = None;
                job.pid = 0;
                job.priority = priority;
                job.retrial += 1;
                job.created_at = now;
            }
        });
        Ok(())
    }

    async fn defer(
        &self,
        id: JobId,
        retrial: u32,
        next_try: DateTime<Utc>,
        priority: Priority,
    ) -> StoreResult<()> {
        self.update(id, |job| {
            if !job.done {
                job.retrial = retrial;
                job.next_try = Some(next_try);
                job.priority = priority;
                job.executed_at = None;
                job.pid = 0;
            }
        });
        Ok(())
    }

    async fn running(&self) -> StoreResult<Vec<Job>> {
        Ok(self
            .state
            .lock()
            .jobs
            .values()
            .filter(|j| j.is_claimed())
            .cloned()
            .collect())
    }

    async fn delete_done_older_than(&self, age: Duration) -> StoreResult<u64> {
        let cutoff = Utc::now() - ChronoDuration::from_std(age).unwrap_or_else(|_| ChronoDuration::days(36500));
        let mut state = self.state.lock();
        let before = state.jobs.len();
        state
            .jobs
            .retain(|_, j| !(j.done && j.executed_at.map_or(true, |t| t < cutoff)));
        Ok((before - state.jobs.len()) as u64)
    }

    async fn queue_counts(&self) -> StoreResult<QueueCounts> {
        let now = Utc::now();
        let state = self.state.lock();
        let mut counts = QueueCounts::default();
        for job in state.jobs.values() {
            if job.is_claimable_at(now) {
                *counts.queued.entry(job.priority).or_insert(0) += 1;
            } else if job.is_claimed() {
                *counts.running.entry(job.priority).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn connection_load(&self) -> StoreResult<ConnectionLoad> {
        Ok(*self.load.lock())
    }

    async fn optimize(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_enqueue_and_get() {
        let store = MemoryJobStore::new();
        let id = store
            .enqueue(NewJob::new("APDelivery").param("https://a.example/inbox").priority(Priority::High))
            .await
            .unwrap();

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.command, "APDelivery");
        assert_eq!(job.priority, Priority::High);
        assert_eq!(job.pid, 0);
        assert!(!job.done);
    }

    #[tokio::test]
    async fn test_enqueue_deduplicates() {
        let store = MemoryJobStore::new();
        let first = store
            .enqueue(NewJob::new("APDelivery").param("inbox").priority(Priority::Low))
            .await
            .unwrap();
        let second = store
            .enqueue(NewJob::new("APDelivery").param("inbox").priority(Priority::High))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.snapshot().len(), 1);
        assert_eq!(store.get(first).await.unwrap().unwrap().priority, Priority::Low);

        store
            .enqueue(
                NewJob::new("APDelivery")
                    .param("inbox")
                    .priority(Priority::High)
                    .force_priority(true),
            )
            .await
            .unwrap();
        assert_eq!(store.get(first).await.unwrap().unwrap().priority, Priority::High);
    }

    #[tokio::test]
    async fn test_force_priority_ignored_once_claimed() {
        let store = MemoryJobStore::new();
        let id = store
            .enqueue(NewJob::new("APDelivery").param("inbox").priority(Priority::Low))
            .await
            .unwrap();
        store.claim_next(&[Priority::Low], 1, 99).await.unwrap();

        store
            .enqueue(
                NewJob::new("APDelivery")
                    .param("inbox")
                    .priority(Priority::High)
                    .force_priority(true),
            )
            .await
            .unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().priority, Priority::Low);
    }

    #[tokio::test]
    async fn test_claim_order() {
        let store = MemoryJobStore::new();
        let low = store.enqueue(NewJob::new("A").priority(Priority::Low)).await.unwrap();
        let high = store.enqueue(NewJob::new("B").priority(Priority::High)).await.unwrap();
        let high2 = store.enqueue(NewJob::new("C").priority(Priority::High)).await.unwrap();

        let claimed = store
            .claim_next(&[Priority::High, Priority::Low], 2, 7)
            .await
            .unwrap();
        let ids: Vec<JobId> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![high, high2]);
        assert!(claimed.iter().all(|j| j.pid == 7 && j.executed_at.is_some()));

        let rest = store.claim_next(&[Priority::High, Priority::Low], 5, 7).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, low);
    }

    #[tokio::test]
    async fn test_claim_respects_tiers_and_delay() {
        let store = MemoryJobStore::new();
        store.enqueue(NewJob::new("A").priority(Priority::Low)).await.unwrap();
        store
            .enqueue(NewJob::new("B").priority(Priority::High).delay(Duration::from_secs(600)))
            .await
            .unwrap();

        assert!(store.claim_next(&[Priority::High], 5, 1).await.unwrap().is_empty());
        assert_eq!(store.claim_next(&[Priority::Low], 5, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        let store = Arc::new(MemoryJobStore::new());
        for i in 0..50 {
            store
                .enqueue(NewJob::new("Job").param(i.to_string()).priority(Priority::Medium))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for pid in 1..=8u32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = store.claim_next(&Priority::ALL, 3, pid).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|j| j.id));
                }
                mine
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        let before = all.len();
        all.dedup();
        assert_eq!(before, 50);
        assert_eq!(all.len(), 50);
    }

    #[tokio::test]
    async fn test_requeue_and_release() {
        let store = MemoryJobStore::new();
        let id = store.enqueue(NewJob::new("A").priority(Priority::High)).await.unwrap();
        store.claim_next(&[Priority::High], 1, 5).await.unwrap();
        store.assign_worker(id, 1234).await.unwrap();
        assert_eq!(store.running().await.unwrap()[0].pid, 1234);

        store.requeue(id, Priority::Medium).await.unwrap();
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.priority, Priority::Medium);
        assert_eq!(job.retrial, 1);
        assert_eq!(job.pid, 0);
        assert!(job.executed_at.is_none());

        store.claim_next(&[Priority::Medium], 1, 5).await.unwrap();
        store.release(id).await.unwrap();
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.retrial, 1);
        assert_eq!(job.priority, Priority::Medium);
        assert!(store.running().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_done_and_counts() {
        let store = MemoryJobStore::new();
        let a = store.enqueue(NewJob::new("A").priority(Priority::High)).await.unwrap();
        store.enqueue(NewJob::new("B").priority(Priority::High)).await.unwrap();
        store.enqueue(NewJob::new("C").priority(Priority::Low)).await.unwrap();
        store.claim_next(&[Priority::Low], 1, 3).await.unwrap();

        let counts = store.queue_counts().await.unwrap();
        assert_eq!(counts.queued(Priority::High), 2);
        assert_eq!(counts.running(Priority::Low), 1);

        store.mark_done(a).await.unwrap();
        assert_eq!(store.delete_done_older_than(Duration::from_secs(3600)).await.unwrap(), 0);

        let mut job = store.get(a).await.unwrap().unwrap();
        job.executed_at = Some(Utc::now() - ChronoDuration::hours(2));
        store.put(job);
        assert_eq!(store.delete_done_older_than(Duration::from_secs(3600)).await.unwrap(), 1);
        assert!(store.get(a).await.unwrap().is_none());
    }
}
