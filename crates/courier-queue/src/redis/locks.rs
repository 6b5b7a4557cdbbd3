use super::RedisKeys;
use crate::error::JobResult;
use crate::locks::{LockToken, NamedLocks};
use async_trait::async_trait;
use deadpool_redis::Pool;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Delete the key only if it still holds our token.
const RELEASE_SCRIPT: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("del", KEYS[1])
    else
        return 0
    end
"#;

/// Named locks shared by every host using the same Redis.
pub struct RedisLocks {
    pool: Pool,
    keys: RedisKeys,
}

impl RedisLocks {
    pub fn new(pool: Pool, keys: RedisKeys) -> Self {
        Self { pool, keys }
    }
}

#[async_trait]
impl NamedLocks for RedisLocks {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> JobResult<Option<LockToken>> {
        let mut conn = self.pool.get().await?;
        let token = Uuid::new_v4().to_string();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        // Try to set lock with NX (only if not exists)
        let result: Option<String> = redis::cmd("SET")
            .arg(self.keys.lock(name))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut *conn)
            .await?;

        if result.is_none() {
            debug!(lock = name, "Lock busy");
            return Ok(None);
        }

        Ok(Some(LockToken {
            name: name.to_string(),
            token,
        }))
    }

    async fn release(&self, token: &LockToken) -> JobResult<()> {
        let mut conn = self.pool.get().await?;

        let released: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.keys.lock(&token.name))
            .arg(&token.token)
            .invoke_async(&mut *conn)
            .await?;

        if released == 0 {
            debug!(lock = %token.name, "Lock already expired or taken over");
        }
        Ok(())
    }
}
