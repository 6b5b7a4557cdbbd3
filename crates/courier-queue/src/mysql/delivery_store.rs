//! MySQL delivery store over `delivery_target` and `post_delivery`.

use crate::store::StoreResult;
use crate::tracker::{DeliveryStore, DeliveryTarget, NewActivity, PendingActivity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::MySqlPool;
use sqlx::FromRow;

/// Delivery store backed by MySQL.
#[derive(Clone)]
pub struct MySqlDeliveryStore {
    pool: MySqlPool,
}

impl MySqlDeliveryStore {
    #[must_use]
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct PendingRow {
    inbox: String,
    activity_id: String,
    payload: String,
    failed: u32,
    created: DateTime<Utc>,
}

impl From<PendingRow> for PendingActivity {
    fn from(row: PendingRow) -> Self {
        PendingActivity {
            inbox: row.inbox,
            activity_id: row.activity_id,
            payload: row.payload,
            failed: row.failed,
            created_at: row.created,
        }
    }
}

#[derive(Debug, FromRow)]
struct TargetRow {
    inbox: String,
    server_id: Option<i64>,
    failed: u64,
    shared: Option<bool>,
}

impl From<TargetRow> for DeliveryTarget {
    fn from(row: TargetRow) -> Self {
        DeliveryTarget {
            inbox: row.inbox,
            server_id: row.server_id,
            failed: u32::try_from(row.failed).unwrap_or(u32::MAX),
            shared: row.shared.unwrap_or(false),
        }
    }
}

#[async_trait]
impl DeliveryStore for MySqlDeliveryStore {
    async fn insert_pending(&self, activity: NewActivity) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO delivery_target (inbox, server_id, shared)
            VALUES (?, ?, ?)
            ON DUPLICATE KEY UPDATE
                server_id = COALESCE(VALUES(server_id), server_id),
                shared = shared OR VALUES(shared)
            "#,
        )
        .bind(&activity.inbox)
        .bind(activity.server_id)
        .bind(activity.shared)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT IGNORE INTO post_delivery (inbox, activity_id, payload, failed, created)
            VALUES (?, ?, ?, 0, ?)
            "#,
        )
        .bind(&activity.inbox)
        .bind(&activity.activity_id)
        .bind(&activity.payload)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn pending_for_inbox(&self, inbox: &str) -> StoreResult<Vec<PendingActivity>> {
        let rows = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT inbox, activity_id, payload, failed, created
            FROM post_delivery
            WHERE inbox = ?
            ORDER BY created, activity_id
            "#,
        )
        .bind(inbox)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PendingActivity::from).collect())
    }

    async fn remove_pending(&self, inbox: &str, activity_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM post_delivery WHERE inbox = ? AND activity_id = ?")
            .bind(inbox)
            .bind(activity_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn increment_failures(&self, inbox: &str) -> StoreResult<u64> {
        let result = sqlx::query("UPDATE post_delivery SET failed = failed + 1 WHERE inbox = ?")
            .bind(inbox)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn reset_failures(&self, inbox: &str) -> StoreResult<u64> {
        let result = sqlx::query("UPDATE post_delivery SET failed = 0 WHERE inbox = ? AND failed > 0")
            .bind(inbox)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn aggregated_targets(&self) -> StoreResult<Vec<DeliveryTarget>> {
        let rows = sqlx::query_as::<_, TargetRow>(
            r#"
            SELECT p.inbox, t.server_id, CAST(MAX(p.failed) AS UNSIGNED) AS failed, t.shared
            FROM post_delivery p
            LEFT JOIN delivery_target t ON t.inbox = p.inbox
            GROUP BY p.inbox, t.server_id, t.shared
            ORDER BY p.inbox
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(DeliveryTarget::from).collect())
    }

    async fn delete_failed_at_least(&self, limit: u32, inbox: Option<&str>) -> StoreResult<u64> {
        let result = match inbox {
            Some(inbox) => {
                sqlx::query("DELETE FROM post_delivery WHERE failed >= ? AND inbox = ?")
                    .bind(limit)
                    .bind(inbox)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM post_delivery WHERE failed >= ?")
                    .bind(limit)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    async fn delete_orphan_targets(&self, inbox: Option<&str>) -> StoreResult<u64> {
        let result = match inbox {
            Some(inbox) => {
                sqlx::query(
                    r#"
                    DELETE FROM delivery_target
                    WHERE inbox = ?
                      AND NOT EXISTS (SELECT 1 FROM post_delivery p WHERE p.inbox = delivery_target.inbox)
                    "#,
                )
                .bind(inbox)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    DELETE t FROM delivery_target t
                    LEFT JOIN post_delivery p ON p.inbox = t.inbox
                    WHERE p.inbox IS NULL
                    "#,
                )
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected())
    }

    async fn server_for_inbox(&self, inbox: &str) -> StoreResult<Option<i64>> {
        let server: Option<Option<i64>> =
            sqlx::query_scalar("SELECT server_id FROM delivery_target WHERE inbox = ?")
                .bind(inbox)
                .fetch_optional(&self.pool)
                .await?;
        Ok(server.flatten())
    }

    async fn inboxes_for_server(&self, server_id: i64) -> StoreResult<Vec<String>> {
        let inboxes = sqlx::query_scalar(
            r#"
            SELECT DISTINCT p.inbox
            FROM post_delivery p
            JOIN delivery_target t ON t.inbox = p.inbox
            WHERE t.server_id = ?
            ORDER BY p.inbox
            "#,
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(inboxes)
    }
}
