//! MySQL-backed stores.
//!
//! Schema lives in the workspace `migrations/` directory and is applied with
//! [`run_migrations`].

mod delivery_store;
mod job_store;
mod reachability;

pub use delivery_store::MySqlDeliveryStore;
pub use job_store::MySqlJobStore;
pub use reachability::MySqlReachability;

use crate::error::{JobError, JobResult, PersistenceError};
use courier_config::DatabaseConfig;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use std::time::Duration;
use tracing::{info, warn};

/// Create a MySQL connection pool and check it answers.
pub async fn create_pool(config: &DatabaseConfig) -> JobResult<MySqlPool> {
    info!("Connecting to MySQL database...");

    let pool = MySqlPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
        .connect(&config.url)
        .await
        .map_err(|e| {
            warn!("Failed to connect to database: {}", e);
            JobError::Persistence(PersistenceError::Database(e))
        })?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(PersistenceError::from)?;

    info!("MySQL connection pool established");
    Ok(pool)
}

/// Apply pending schema migrations.
pub async fn run_migrations(pool: &MySqlPool) -> Result<(), PersistenceError> {
    info!("Running database migrations...");
    sqlx::migrate!("../../migrations").run(pool).await?;
    info!("Database migrations completed");
    Ok(())
}
