use crate::store::StoreResult;
use crate::tracker::{DeliveryStore, DeliveryTarget, NewActivity, PendingActivity};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct State {
    /// inbox -> (server_id, shared)
    targets: HashMap<String, (Option<i64>, bool)>,
    /// (inbox, activity_id) -> row
    rows: BTreeMap<(String, String), PendingActivity>,
}

/// Delivery store kept in process memory.
#[derive(Default)]
pub struct MemoryDeliveryStore {
    state: Mutex<State>,
}

impl MemoryDeliveryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending rows over all inboxes.
    pub fn pending_count(&self) -> usize {
        self.state.lock().rows.len()
    }

    /// Number of known inboxes.
    pub fn target_count(&self) -> usize {
        self.state.lock().targets.len()
    }
}

#[async_trait]
impl DeliveryStore for MemoryDeliveryStore {
    async fn insert_pending(&self, activity: NewActivity) -> StoreResult<()> {
        let mut state = self.state.lock();
        let target = state
            .targets
            .entry(activity.inbox.clone())
            .or_insert((None, false));
        if activity.server_id.is_some() {
            target.0 = activity.server_id;
        }
        target.1 |= activity.shared;

        state
            .rows
            .entry((activity.inbox.clone(), activity.activity_id.clone()))
            .or_insert_with(|| PendingActivity {
                inbox: activity.inbox,
                activity_id: activity.activity_id,
                payload: activity.payload,
                failed: 0,
                created_at: Utc::now(),
            });
        Ok(())
    }

    async fn pending_for_inbox(&self, inbox: &str) -> StoreResult<Vec<PendingActivity>> {
        let mut rows: Vec<PendingActivity> = self
            .state
            .lock()
            .rows
            .values()
            .filter(|r| r.inbox == inbox)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    async fn remove_pending(&self, inbox: &str, activity_id: &str) -> StoreResult<bool> {
        Ok(self
            .state
            .lock()
            .rows
            .remove(&(inbox.to_string(), activity_id.to_string()))
            .is_some())
    }

    async fn increment_failures(&self, inbox: &str) -> StoreResult<u64> {
        let mut state = self.state.lock();
        let mut touched = 0;
        for row in state.rows.values_mut().filter(|r| r.inbox == inbox) {
            row.failed += 1;
            touched += 1;
        }
        Ok(touched)
    }

    async fn reset_failures(&self, inbox: &str) -> StoreResult<u64> {
        let mut state = self.state.lock();
        let mut touched = 0;
        for row in state.rows.values_mut().filter(|r| r.inbox == inbox) {
            row.failed = 0;
            touched += 1;
        }
        Ok(touched)
    }

    async fn aggregated_targets(&self) -> StoreResult<Vec<DeliveryTarget>> {
        let state = self.state.lock();
        let mut max_failed: BTreeMap<&str, u32> = BTreeMap::new();
        for row in state.rows.values() {
            let entry = max_failed.entry(row.inbox.as_str()).or_insert(0);
            *entry = (*entry).max(row.failed);
        }

        Ok(max_failed
            .into_iter()
            .map(|(inbox, failed)| {
                let (server_id, shared) = state.targets.get(inbox).copied().unwrap_or((None, false));
                DeliveryTarget {
                    inbox: inbox.to_string(),
                    server_id,
                    failed,
                    shared,
                }
            })
            .collect())
    }

    async fn delete_failed_at_least(&self, limit: u32, inbox: Option<&str>) -> StoreResult<u64> {
        let mut state = self.state.lock();
        let before = state.rows.len();
        state
            .rows
            .retain(|_, r| !(r.failed >= limit && inbox.map_or(true, |i| r.inbox == i)));
        Ok((before - state.rows.len()) as u64)
    }

    async fn delete_orphan_targets(&self, inbox: Option<&str>) -> StoreResult<u64> {
        let mut state = self.state.lock();
        let State { targets, rows } = &mut *state;
        let before = targets.len();
        targets.retain(|target, _| {
            inbox.is_some_and(|i| i != target.as_str()) || rows.values().any(|r| r.inbox == *target)
        });
        Ok((before - targets.len()) as u64)
    }

    async fn server_for_inbox(&self, inbox: &str) -> StoreResult<Option<i64>> {
        Ok(self.state.lock().targets.get(inbox).and_then(|t| t.0))
    }

    async fn inboxes_for_server(&self, server_id: i64) -> StoreResult<Vec<String>> {
        let state = self.state.lock();
        let mut inboxes: Vec<String> = state
            .rows
            .values()
            .filter(|r| state.targets.get(&r.inbox).and_then(|t| t.0) == Some(server_id))
            .map(|r| r.inbox.clone())
            .collect();
        inboxes.dedup();
        Ok(inboxes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let store = MemoryDeliveryStore::new();
        let activity = NewActivity::new("https://a.example/inbox", "act-1", r#"{"type":"Note"}"#);
        store.insert_pending(activity.clone()).await.unwrap();
        store.increment_failures("https://a.example/inbox").await.unwrap();
        store.insert_pending(activity).await.unwrap();

        let rows = store.pending_for_inbox("https://a.example/inbox").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].failed, 1);
    }

    #[tokio::test]
    async fn test_aggregates_max_failed() {
        let store = MemoryDeliveryStore::new();
        store
            .insert_pending(NewActivity::new("https://a.example/inbox", "old", "{}").server(4).shared(true))
            .await
            .unwrap();
        store.increment_failures("https://a.example/inbox").await.unwrap();
        store
            .insert_pending(NewActivity::new("https://a.example/inbox", "new", "{}"))
            .await
            .unwrap();

        let targets = store.aggregated_targets().await.unwrap();
        assert_eq!(
            targets,
            vec![DeliveryTarget {
                inbox: "https://a.example/inbox".to_string(),
                server_id: Some(4),
                failed: 1,
                shared: true,
            }]
        );
    }

    #[tokio::test]
    async fn test_inboxes_for_server() {
        let store = MemoryDeliveryStore::new();
        for (inbox, server) in [
            ("https://a.example/inbox", 1),
            ("https://a.example/users/bob/inbox", 1),
            ("https://b.example/inbox", 2),
        ] {
            store
                .insert_pending(NewActivity::new(inbox, "act", "{}").server(server))
                .await
                .unwrap();
        }
        store
            .insert_pending(NewActivity::new("https://a.example/inbox", "act-2", "{}"))
            .await
            .unwrap();

        let inboxes = store.inboxes_for_server(1).await.unwrap();
        assert_eq!(
            inboxes,
            vec!["https://a.example/inbox".to_string(), "https://a.example/users/bob/inbox".to_string()]
        );
        assert!(store.remove_pending("https://b.example/inbox", "act").await.unwrap());
        assert!(store.inboxes_for_server(2).await.unwrap().is_empty());
    }
}
