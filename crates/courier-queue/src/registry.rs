//! Registry of running worker processes.
//!
//! Maps claimed job IDs to the pid of the worker running them, with a
//! heartbeat timestamp per worker. The supervisor owns one registry; the
//! stale sweep uses it to find and kill workers that overran.

use crate::job::JobId;
use crate::priority::Priority;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default heartbeat timeout (90 seconds - 3x heartbeat interval).
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

/// A running worker.
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    /// Job being run.
    pub job_id: JobId,
    /// Worker pid (real or synthetic).
    pub pid: u32,
    /// Tier of the job when it was spawned.
    pub priority: Priority,
    /// Spawn timestamp.
    pub started_at: Instant,
    /// Last heartbeat timestamp.
    pub last_heartbeat: Instant,
}

impl ProcessEntry {
    fn new(job_id: JobId, pid: u32, priority: Priority) -> Self {
        let now = Instant::now();
        Self {
            job_id,
            pid,
            priority,
            started_at: now,
            last_heartbeat: now,
        }
    }

    /// Check if the worker is considered alive based on heartbeat timeout.
    pub fn is_alive(&self, timeout: Duration) -> bool {
        self.last_heartbeat.elapsed() < timeout
    }
}

/// Registry of running workers, keyed by job.
pub struct ProcessRegistry {
    entries: RwLock<HashMap<JobId, ProcessEntry>>,
    heartbeat_timeout: Duration,
    registration_count: AtomicU64,
}

impl ProcessRegistry {
    /// Create a new registry.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_HEARTBEAT_TIMEOUT)
    }

    /// Create a new registry with custom heartbeat timeout.
    pub fn with_timeout(heartbeat_timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            heartbeat_timeout,
            registration_count: AtomicU64::new(0),
        }
    }

    /// Heartbeat timeout of this registry.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Record that `pid` is running `job_id`.
    ///
    /// Returns the registration sequence number.
    pub fn register(&self, job_id: JobId, pid: u32, priority: Priority) -> u64 {
        let seq = self.registration_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries
            .write()
            .insert(job_id, ProcessEntry::new(job_id, pid, priority));

        info!(
            job_id = %job_id,
            pid = pid,
            priority = %priority,
            registration_seq = seq,
            "Worker registered"
        );

        seq
    }

    /// Update the heartbeat of every entry run by `pid`.
    ///
    /// Returns true if the pid is registered.
    pub fn heartbeat(&self, pid: u32) -> bool {
        let mut entries = self.entries.write();
        let mut found = false;
        for entry in entries.values_mut().filter(|e| e.pid == pid) {
            entry.last_heartbeat = Instant::now();
            found = true;
        }

        if found {
            debug!(pid = pid, "Worker heartbeat received");
        } else {
            warn!(pid = pid, "Heartbeat from unknown worker");
        }
        found
    }

    /// Pid running a job, if registered.
    pub fn pid_for(&self, job_id: JobId) -> Option<u32> {
        self.entries.read().get(&job_id).map(|e| e.pid)
    }

    /// Entry of a job, if registered.
    pub fn get(&self, job_id: JobId) -> Option<ProcessEntry> {
        self.entries.read().get(&job_id).cloned()
    }

    /// Check if a pid is registered and its heartbeat has not expired.
    pub fn is_alive(&self, pid: u32) -> bool {
        let timeout = self.heartbeat_timeout;
        self.entries
            .read()
            .values()
            .any(|e| e.pid == pid && e.is_alive(timeout))
    }

    /// Forget the worker of a job.
    pub fn unregister_job(&self, job_id: JobId) -> Option<ProcessEntry> {
        let removed = self.entries.write().remove(&job_id);
        if let Some(ref entry) = removed {
            info!(job_id = %job_id, pid = entry.pid, "Worker unregistered");
        }
        removed
    }

    /// Forget every job run by `pid`. Returns the affected job IDs.
    pub fn unregister_pid(&self, pid: u32) -> Vec<JobId> {
        let mut entries = self.entries.write();
        let ids: Vec<JobId> = entries
            .values()
            .filter(|e| e.pid == pid)
            .map(|e| e.job_id)
            .collect();
        for id in &ids {
            entries.remove(id);
        }
        if !ids.is_empty() {
            info!(pid = pid, jobs = ids.len(), "Worker exited");
        }
        ids
    }

    /// Remove entries that have missed heartbeats.
    ///
    /// Returns the removed entries.
    pub fn cleanup_stale(&self) -> Vec<ProcessEntry> {
        let mut entries = self.entries.write();
        let timeout = self.heartbeat_timeout;

        let stale_ids: Vec<JobId> = entries
            .values()
            .filter(|e| !e.is_alive(timeout))
            .map(|e| e.job_id)
            .collect();

        stale_ids
            .into_iter()
            .filter_map(|id| {
                let entry = entries.remove(&id)?;
                warn!(job_id = %id, pid = entry.pid, "Removed stale worker");
                Some(entry)
            })
            .collect()
    }

    /// All registered entries.
    pub fn entries(&self) -> Vec<ProcessEntry> {
        self.entries.read().values().cloned().collect()
    }

    /// Number of workers with a live heartbeat.
    pub fn active_count(&self) -> usize {
        let timeout = self.heartbeat_timeout;
        self.entries
            .read()
            .values()
            .filter(|e| e.is_alive(timeout))
            .count()
    }

    /// Get total registration count.
    pub fn total_registrations(&self) -> u64 {
        self.registration_count.load(Ordering::Relaxed)
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration() {
        let registry = ProcessRegistry::new();

        assert_eq!(registry.register(JobId(1), 100, Priority::High), 1);
        assert_eq!(registry.register(JobId(2), 200, Priority::Low), 2);

        assert_eq!(registry.pid_for(JobId(1)), Some(100));
        assert!(registry.is_alive(100));
        assert!(registry.is_alive(200));
        assert!(!registry.is_alive(300));
        assert_eq!(registry.active_count(), 2);
        assert_eq!(registry.total_registrations(), 2);
    }

    #[test]
    fn test_heartbeat() {
        let registry = ProcessRegistry::with_timeout(Duration::from_millis(30));
        registry.register(JobId(1), 100, Priority::Medium);

        std::thread::sleep(Duration::from_millis(20));
        assert!(registry.heartbeat(100));
        assert!(!registry.heartbeat(999));

        std::thread::sleep(Duration::from_millis(20));
        assert!(registry.is_alive(100));
    }

    #[test]
    fn test_stale_cleanup() {
        let registry = ProcessRegistry::with_timeout(Duration::from_millis(10));

        registry.register(JobId(1), 100, Priority::High);

        // Worker should be alive initially
        assert!(registry.is_alive(100));

        // Wait for timeout
        std::thread::sleep(Duration::from_millis(20));

        // Worker should now be stale
        assert!(!registry.is_alive(100));

        let stale = registry.cleanup_stale();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].job_id, JobId(1));
        assert!(registry.get(JobId(1)).is_none());
    }

    #[test]
    fn test_unregister() {
        let registry = ProcessRegistry::new();

        registry.register(JobId(1), 100, Priority::High);
        registry.register(JobId(2), 100, Priority::High);
        registry.register(JobId(3), 200, Priority::High);

        assert!(registry.unregister_job(JobId(3)).is_some());
        assert!(registry.unregister_job(JobId(3)).is_none()); // Already removed

        let mut ids = registry.unregister_pid(100);
        ids.sort();
        assert_eq!(ids, vec![JobId(1), JobId(2)]);
        assert!(registry.entries().is_empty());
    }
}
