use crate::error::PersistenceError;
use crate::tracker::ReachabilityOracle;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::mysql::MySqlPool;
use tracing::debug;

/// Reachability read from the `remote_server` table.
///
/// A server is reachable when it is known, not blocked and not marked
/// failed.
#[derive(Clone)]
pub struct MySqlReachability {
    pool: MySqlPool,
}

impl MySqlReachability {
    #[must_use]
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Record a successful contact.
    pub async fn mark_reachable(&self, server_id: i64) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE remote_server SET failed = 0, last_contact = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(server_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a failed contact.
    pub async fn mark_unreachable(&self, server_id: i64) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE remote_server SET failed = 1, last_failure = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(server_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ReachabilityOracle for MySqlReachability {
    async fn is_reachable(&self, server_id: i64) -> Result<bool, PersistenceError> {
        let row: Option<(bool, bool)> =
            sqlx::query_as("SELECT failed, blocked FROM remote_server WHERE id = ?")
                .bind(server_id)
                .fetch_optional(&self.pool)
                .await?;

        let reachable = matches!(row, Some((false, false)));
        debug!(server_id, reachable, "Looked up server reachability");
        Ok(reachable)
    }

    async fn record_contact(&self, server_id: i64, reachable: bool) -> Result<(), PersistenceError> {
        if reachable {
            self.mark_reachable(server_id).await
        } else {
            self.mark_unreachable(server_id).await
        }
    }
}
