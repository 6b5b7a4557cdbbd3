//! Redis-backed named locks.

mod locks;

pub use locks::RedisLocks;

use crate::error::{JobError, JobResult};
use courier_config::RedisConfig;
use deadpool_redis::{Config, Pool, Runtime};
use tracing::info;

/// Create a Redis connection pool.
pub async fn create_pool(config: &RedisConfig) -> JobResult<Pool> {
    info!("Creating Redis connection pool for named locks...");

    let cfg = Config::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size as usize)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {}", e)))?;

    // Test connection
    let mut conn = pool.get().await?;
    redis::cmd("PING")
        .query_async::<String>(&mut *conn)
        .await?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Redis key builder.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Key of a named lock.
    pub fn lock(&self, name: &str) -> String {
        format!("{}:lock:{}", self.prefix, name)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("courier")
    }
}
