//! Per-destination delivery failure tracking.
//!
//! Pending activities are stored one row per `(inbox, activity)` with a
//! failure counter. The failure count of a destination is the maximum counter
//! over its rows; it grows on every failed run, drops back to zero after a
//! successful one, and rows that reach the defer limit are pruned.

use crate::delivery::DeliveryReport;
use crate::error::PersistenceError;
use crate::store::StoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A destination inbox with pending activities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTarget {
    /// Inbox URL.
    pub inbox: String,
    /// Remote server the inbox belongs to, if known.
    pub server_id: Option<i64>,
    /// Highest failure counter over the pending rows.
    pub failed: u32,
    /// Shared inbox serving many recipients on the server.
    pub shared: bool,
}

/// An activity waiting to be delivered to one inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingActivity {
    pub inbox: String,
    pub activity_id: String,
    /// Serialized activity, posted as-is.
    pub payload: String,
    pub failed: u32,
    pub created_at: DateTime<Utc>,
}

/// An activity handed over by a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewActivity {
    pub inbox: String,
    pub activity_id: String,
    pub payload: String,
    pub server_id: Option<i64>,
    pub shared: bool,
}

impl NewActivity {
    /// Activity for a personal inbox on an unknown server.
    pub fn new(
        inbox: impl Into<String>,
        activity_id: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            inbox: inbox.into(),
            activity_id: activity_id.into(),
            payload: payload.into(),
            server_id: None,
            shared: false,
        }
    }

    /// Attach the remote server.
    pub fn server(mut self, server_id: i64) -> Self {
        self.server_id = Some(server_id);
        self
    }

    /// Mark the inbox as a shared inbox.
    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }
}

/// Storage of pending activity rows.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Store an activity for an inbox. Storing the same activity twice is a no-op.
    async fn insert_pending(&self, activity: NewActivity) -> StoreResult<()>;

    /// Pending activities of an inbox, oldest first.
    async fn pending_for_inbox(&self, inbox: &str) -> StoreResult<Vec<PendingActivity>>;

    /// Remove one activity row. Returns false if it was already gone.
    async fn remove_pending(&self, inbox: &str, activity_id: &str) -> StoreResult<bool>;

    /// Increment the counters of all rows of an inbox.
    async fn increment_failures(&self, inbox: &str) -> StoreResult<u64>;

    /// Reset the counters of all rows of an inbox.
    async fn reset_failures(&self, inbox: &str) -> StoreResult<u64>;

    /// One entry per inbox with pending rows, carrying `MAX(failed)`.
    async fn aggregated_targets(&self) -> StoreResult<Vec<DeliveryTarget>>;

    /// Delete rows whose counter reached `limit`, optionally for one inbox.
    async fn delete_failed_at_least(&self, limit: u32, inbox: Option<&str>) -> StoreResult<u64>;

    /// Delete inbox entries without pending rows, optionally only `inbox`.
    async fn delete_orphan_targets(&self, inbox: Option<&str>) -> StoreResult<u64>;

    /// Server of an inbox, if known.
    async fn server_for_inbox(&self, inbox: &str) -> StoreResult<Option<i64>>;

    /// Inboxes of a server that have pending rows.
    async fn inboxes_for_server(&self, server_id: i64) -> StoreResult<Vec<String>>;
}

/// Answers whether a remote server is currently worth contacting.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReachabilityOracle: Send + Sync {
    async fn is_reachable(&self, server_id: i64) -> Result<bool, PersistenceError>;

    /// Record the outcome of contacting the server.
    async fn record_contact(&self, server_id: i64, reachable: bool) -> Result<(), PersistenceError>;
}

/// Reachability from a fixed set of unreachable servers.
#[derive(Debug, Default)]
pub struct StaticReachability {
    unreachable: RwLock<HashSet<i64>>,
}

impl StaticReachability {
    /// Every server reachable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a server unreachable.
    pub fn mark_unreachable(&self, server_id: i64) {
        self.unreachable.write().insert(server_id);
    }

    /// Mark a server reachable again.
    pub fn mark_reachable(&self, server_id: i64) {
        self.unreachable.write().remove(&server_id);
    }
}

#[async_trait]
impl ReachabilityOracle for StaticReachability {
    async fn is_reachable(&self, server_id: i64) -> Result<bool, PersistenceError> {
        Ok(!self.unreachable.read().contains(&server_id))
    }

    async fn record_contact(&self, server_id: i64, reachable: bool) -> Result<(), PersistenceError> {
        if reachable {
            self.mark_reachable(server_id);
        } else {
            self.mark_unreachable(server_id);
        }
        Ok(())
    }
}

/// Delivery failure counters plus a reachability cache.
pub struct DeliveryTargetTracker {
    store: Arc<dyn DeliveryStore>,
    oracle: Arc<dyn ReachabilityOracle>,
    cache: RwLock<HashMap<i64, (bool, Instant)>>,
    ttl: Duration,
}

impl DeliveryTargetTracker {
    /// Create a tracker caching reachability answers for `ttl`.
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        oracle: Arc<dyn ReachabilityOracle>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            oracle,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Store a new activity for delivery.
    pub async fn record_pending(&self, activity: NewActivity) -> StoreResult<()> {
        debug!(inbox = %activity.inbox, activity_id = %activity.activity_id, "Recording pending activity");
        self.store.insert_pending(activity).await
    }

    /// Pending activities of an inbox.
    pub async fn pending_for_inbox(&self, inbox: &str) -> StoreResult<Vec<PendingActivity>> {
        self.store.pending_for_inbox(inbox).await
    }

    /// Drop an activity that was delivered or permanently rejected.
    pub async fn mark_delivered(&self, inbox: &str, activity_id: &str) -> StoreResult<bool> {
        self.store.remove_pending(inbox, activity_id).await
    }

    /// Count one failed run against every pending row of an inbox.
    pub async fn record_failure(&self, inbox: &str) -> StoreResult<()> {
        let rows = self.store.increment_failures(inbox).await?;
        self.record_contact(inbox, false).await?;
        debug!(inbox = %inbox, rows, "Recorded delivery failure");
        Ok(())
    }

    /// Clear the failure counters of an inbox after a successful run.
    pub async fn record_success(&self, inbox: &str) -> StoreResult<()> {
        let rows = self.store.reset_failures(inbox).await?;
        self.record_contact(inbox, true).await?;
        debug!(inbox = %inbox, rows, "Recorded delivery success");
        Ok(())
    }

    /// Apply the outcome of a delivery run.
    ///
    /// A failed run counts against the inbox. A run that only dropped
    /// rejected activities says nothing about the remote and changes no
    /// counter.
    pub async fn record_report(&self, report: &DeliveryReport) -> StoreResult<()> {
        if !report.success {
            self.record_failure(&report.inbox).await
        } else if report.reached_remote() {
            self.record_success(&report.inbox).await
        } else {
            Ok(())
        }
    }

    async fn record_contact(&self, inbox: &str, reachable: bool) -> StoreResult<()> {
        let Some(server_id) = self.store.server_for_inbox(inbox).await? else {
            return Ok(());
        };
        if let Err(e) = self.oracle.record_contact(server_id, reachable).await {
            warn!(server_id, error = %e, "Failed to record server contact");
        }
        self.cache
            .write()
            .insert(server_id, (reachable, Instant::now()));
        Ok(())
    }

    /// Whether the server is reachable, answered from cache when fresh.
    ///
    /// Oracle errors count as unreachable so the caller falls back to
    /// queueing.
    pub async fn is_reachable(&self, server_id: i64) -> bool {
        let cached = self.cache.read().get(&server_id).copied();
        if let Some((reachable, at)) = cached {
            if at.elapsed() < self.ttl {
                return reachable;
            }
        }

        let reachable = match self.oracle.is_reachable(server_id).await {
            Ok(reachable) => reachable,
            Err(e) => {
                warn!(server_id, error = %e, "Reachability lookup failed");
                return false;
            }
        };

        self.cache
            .write()
            .insert(server_id, (reachable, Instant::now()));
        reachable
    }

    /// One entry per destination with pending activities.
    pub async fn list_pending_aggregated_by_destination(&self) -> StoreResult<Vec<DeliveryTarget>> {
        self.store.aggregated_targets().await
    }

    /// Delete rows of every inbox whose counter reached `defer_limit`, then
    /// forget inboxes left with nothing pending.
    ///
    /// Inboxes emptied by successful deliveries are kept until this runs so
    /// their server is still known when the success is recorded.
    pub async fn prune_failures_beyond(&self, defer_limit: u32) -> StoreResult<u64> {
        let removed = self.store.delete_failed_at_least(defer_limit, None).await?;
        if removed > 0 {
            info!(removed, defer_limit, "Pruned undeliverable activities");
        }
        let forgotten = self.store.delete_orphan_targets(None).await?;
        if forgotten > 0 {
            debug!(forgotten, "Forgot inboxes without pending activities");
        }
        Ok(removed)
    }

    /// Delete rows of one inbox whose counter reached `defer_limit`.
    pub async fn prune_inbox_failures(&self, inbox: &str, defer_limit: u32) -> StoreResult<u64> {
        let removed = self
            .store
            .delete_failed_at_least(defer_limit, Some(inbox))
            .await?;
        if removed > 0 {
            info!(inbox = %inbox, removed, defer_limit, "Pruned undeliverable activities");
            self.store.delete_orphan_targets(Some(inbox)).await?;
        }
        Ok(removed)
    }

    /// Inboxes of a server that have pending activities.
    pub async fn inboxes_for_server(&self, server_id: i64) -> StoreResult<Vec<String>> {
        self.store.inboxes_for_server(server_id).await
    }
}
