//! Integration tests for the MySQL stores.
//!
//! These tests run against a real MySQL database using testcontainers.
//! Requires Docker; run with `cargo test -- --ignored`.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::database::TestDatabase;
use courier_queue::{
    DeliveryStore, JobStore, MySqlDeliveryStore, MySqlJobStore, MySqlReachability, NewActivity,
    NewJob, Priority, ReachabilityOracle,
};
use std::time::Duration;

const INBOX: &str = "https://remote.example/inbox";

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_enqueue_deduplicates_unfinished_work() {
    let db = TestDatabase::new().await;
    let store = MySqlJobStore::new(db.pool());

    let first = store
        .enqueue(NewJob::new("APDelivery").param(INBOX).priority(Priority::Medium))
        .await
        .expect("Failed to enqueue");
    let second = store
        .enqueue(
            NewJob::new("APDelivery")
                .param(INBOX)
                .priority(Priority::High)
                .force_priority(true),
        )
        .await
        .expect("Failed to enqueue");

    assert_eq!(first, second);
    let job = store.get(first).await.expect("Query failed").expect("Job not found");
    assert_eq!(job.priority, Priority::High);
    assert_eq!(job.parameters, vec![INBOX.to_string()]);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_claim_orders_by_priority_and_skips_claimed() {
    let db = TestDatabase::new().await;
    let store = MySqlJobStore::new(db.pool());

    let low = store
        .enqueue(NewJob::new("APDelivery").param("a").priority(Priority::Low))
        .await
        .unwrap();
    let critical = store
        .enqueue(NewJob::new("APDelivery").param("b").priority(Priority::Critical))
        .await
        .unwrap();

    let claimed = store.claim_next(&Priority::ALL, 1, 42).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, critical);
    assert_eq!(claimed[0].pid, 42);

    let next = store.claim_next(&Priority::ALL, 5, 43).await.unwrap();
    assert_eq!(next.iter().map(|j| j.id).collect::<Vec<_>>(), vec![low]);
    assert!(store.claim_next(&Priority::ALL, 5, 44).await.unwrap().is_empty());

    let counts = store.queue_counts().await.unwrap();
    assert_eq!(counts.total_queued(), 0);
    assert_eq!(counts.running(Priority::Critical), 1);
    assert_eq!(counts.running(Priority::Low), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_requeue_defer_and_cleanup() {
    let db = TestDatabase::new().await;
    let store = MySqlJobStore::new(db.pool());

    let id = store
        .enqueue(NewJob::new("APDelivery").param(INBOX).priority(Priority::High))
        .await
        .unwrap();
    store.claim_next(&[Priority::High], 1, 7).await.unwrap();

    store.requeue(id, Priority::Medium).await.unwrap();
    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.priority, Priority::Medium);
    assert_eq!(job.retrial, 1);
    assert!(!job.is_claimed());

    store.claim_next(&[Priority::Medium], 1, 7).await.unwrap();
    let next_try = Utc::now() + ChronoDuration::hours(1);
    store.defer(id, 2, next_try, Priority::Low).await.unwrap();
    assert!(store.claim_next(&Priority::ALL, 1, 8).await.unwrap().is_empty());

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.retrial, 2);
    assert_eq!(job.priority, Priority::Low);

    store.mark_done(id).await.unwrap();
    assert_eq!(store.delete_done_older_than(Duration::from_secs(3600)).await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.delete_done_older_than(Duration::ZERO).await.unwrap(), 1);
    store.optimize().await.expect("Failed to optimize");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_connection_load_reports_server_limit() {
    let db = TestDatabase::new().await;
    let store = MySqlJobStore::new(db.pool());

    let load = store.connection_load().await.unwrap();
    assert!(load.current >= 1);
    assert!(load.server_max.is_some_and(|max| max > 0));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_delivery_failures_aggregate_per_inbox() {
    let db = TestDatabase::new().await;
    let store = MySqlDeliveryStore::new(db.pool());

    for activity in ["act-1", "act-2"] {
        store
            .insert_pending(NewActivity::new(INBOX, activity, "{}").server(3).shared(true))
            .await
            .unwrap();
    }
    store.increment_failures(INBOX).await.unwrap();
    store.increment_failures(INBOX).await.unwrap();

    let targets = store.aggregated_targets().await.unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].failed, 2);
    assert_eq!(targets[0].server_id, Some(3));
    assert!(targets[0].shared);

    assert_eq!(store.server_for_inbox(INBOX).await.unwrap(), Some(3));
    assert_eq!(store.inboxes_for_server(3).await.unwrap(), vec![INBOX.to_string()]);

    assert!(store.remove_pending(INBOX, "act-1").await.unwrap());
    assert_eq!(store.reset_failures(INBOX).await.unwrap(), 1);
    assert_eq!(store.delete_failed_at_least(1, Some(INBOX)).await.unwrap(), 0);
    assert_eq!(store.pending_for_inbox(INBOX).await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_orphan_targets_deleted() {
    let db = TestDatabase::new().await;
    let pool = db.pool();
    let store = MySqlDeliveryStore::new(pool.clone());
    let other = "https://other.example/inbox";

    store.insert_pending(NewActivity::new(INBOX, "act-1", "{}").server(3)).await.unwrap();
    store.insert_pending(NewActivity::new(other, "act-1", "{}")).await.unwrap();

    assert!(store.remove_pending(INBOX, "act-1").await.unwrap());
    assert_eq!(store.delete_orphan_targets(Some(other)).await.unwrap(), 0);
    assert_eq!(store.server_for_inbox(INBOX).await.unwrap(), Some(3));

    store.increment_failures(other).await.unwrap();
    assert_eq!(store.delete_failed_at_least(1, Some(other)).await.unwrap(), 1);
    assert_eq!(store.delete_orphan_targets(None).await.unwrap(), 2);

    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM delivery_target")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(remaining, 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_reachability_follows_remote_server_row() {
    let db = TestDatabase::new().await;
    let pool = db.pool();
    let oracle = MySqlReachability::new(pool.clone());

    assert!(!oracle.is_reachable(1).await.unwrap());

    let id: u64 = sqlx::query("INSERT INTO remote_server (url) VALUES (?)")
        .bind("https://remote.example")
        .execute(&pool)
        .await
        .unwrap()
        .last_insert_id();
    let id = i64::try_from(id).unwrap();

    assert!(oracle.is_reachable(id).await.unwrap());
    oracle.mark_unreachable(id).await.unwrap();
    assert!(!oracle.is_reachable(id).await.unwrap());
    oracle.mark_reachable(id).await.unwrap();
    assert!(oracle.is_reachable(id).await.unwrap());
}
