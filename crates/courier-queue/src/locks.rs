//! Named locks shared between supervisors.
//!
//! Table maintenance runs under both [`LOCK_PROCESS`] and [`LOCK_WORKER`] so
//! it never overlaps a claim/spawn tick on another host. Every lock carries a
//! TTL, so a holder that crashes blocks others for at most that long.

use crate::error::{JobError, JobResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Held while claiming jobs and while optimizing the queue table.
pub const LOCK_WORKER: &str = "worker";

/// Held while optimizing the queue table.
pub const LOCK_PROCESS: &str = "process";

/// Rate-limits the daemon watchdog. Never released, left to expire.
pub const LOCK_WATCHDOG: &str = "daemon-watchdog";

/// Delay between two acquire attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Proof of holding a named lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub name: String,
    pub token: String,
}

impl LockToken {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            token: Uuid::new_v4().to_string(),
        }
    }
}

/// A store of named, expiring locks.
#[async_trait]
pub trait NamedLocks: Send + Sync {
    /// Take `name` for `ttl` if nobody holds it.
    async fn try_acquire(&self, name: &str, ttl: Duration) -> JobResult<Option<LockToken>>;

    /// Release a lock. Releasing a lock that expired or changed hands is a no-op.
    async fn release(&self, token: &LockToken) -> JobResult<()>;
}

/// Retry [`NamedLocks::try_acquire`] until `timeout` elapses.
pub async fn acquire(
    locks: &dyn NamedLocks,
    name: &str,
    timeout: Duration,
    ttl: Duration,
) -> JobResult<LockToken> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(token) = locks.try_acquire(name, ttl).await? {
            debug!(lock = name, "Lock acquired");
            return Ok(token);
        }
        if Instant::now() >= deadline {
            return Err(JobError::LockTimeout(name.to_string()));
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
}

/// Run `work` while holding every lock in `names`.
///
/// Locks are taken in order, each with its own `timeout`, and all acquired
/// locks are released afterwards whatever the outcome. Returns `Ok(None)` if
/// a lock could not be taken in time.
pub async fn with_locks<T, F>(
    locks: &dyn NamedLocks,
    names: &[&str],
    timeout: Duration,
    ttl: Duration,
    work: F,
) -> JobResult<Option<T>>
where
    F: Future<Output = T> + Send,
{
    let mut held = Vec::with_capacity(names.len());
    let mut failure = None;

    for name in names {
        match acquire(locks, name, timeout, ttl).await {
            Ok(token) => held.push(token),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    let result = if failure.is_none() {
        Some(work.await)
    } else {
        None
    };

    for token in held.iter().rev() {
        if let Err(e) = locks.release(token).await {
            warn!(lock = %token.name, error = %e, "Failed to release lock");
        }
    }

    match failure {
        None | Some(JobError::LockTimeout(_)) => Ok(result),
        Some(e) => Err(e),
    }
}

/// Process-local locks.
#[derive(Default)]
pub struct MemoryLocks {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle.
    pub fn shared() -> Arc<dyn NamedLocks> {
        Arc::new(Self::new())
    }

    /// Whether `name` is currently held.
    pub fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .get(name)
            .is_some_and(|(_, expires)| *expires > Instant::now())
    }
}

#[async_trait]
impl NamedLocks for MemoryLocks {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> JobResult<Option<LockToken>> {
        let mut held = self.held.lock();
        let now = Instant::now();
        if let Some((_, expires)) = held.get(name) {
            if *expires > now {
                return Ok(None);
            }
        }

        let token = LockToken::new(name);
        held.insert(name.to_string(), (token.token.clone(), now + ttl));
        Ok(Some(token))
    }

    async fn release(&self, token: &LockToken) -> JobResult<()> {
        let mut held = self.held.lock();
        if held.get(&token.name).is_some_and(|(t, _)| *t == token.token) {
            held.remove(&token.name);
        }
        Ok(())
    }
}
