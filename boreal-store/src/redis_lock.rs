use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::debug;

use boreal_core::lock::{LockError, LockManager, LockToken};

// Delete only while the key still holds our token, in one atomic step.
const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

/// Redis-backed `LockManager`. A lease is one volatile key holding the
/// acquirer's token, written with SET NX PX so exactly one contender wins
/// and the server expires the key if the holder crashes.
pub struct RedisLockManager {
    client: redis::Client,
    retry_interval: Duration,
    release: redis::Script,
}

impl RedisLockManager {
    pub fn new(url: &str, retry_interval: Duration) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            retry_interval,
            release: redis::Script::new(RELEASE_SCRIPT),
        })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, LockError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(LockError::backend)
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(
        &self,
        key: &str,
        lease: Duration,
        timeout: Duration,
    ) -> Result<LockToken, LockError> {
        let token = LockToken::generate();
        let mut conn = self.conn().await?;
        let started = Instant::now();
        loop {
            let won: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(token.value())
                .arg("NX")
                .arg("PX")
                .arg(lease.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .map_err(LockError::backend)?;
            if won.is_some() {
                debug!(key, "lease acquired");
                return Ok(token);
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited_ms: waited.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.retry_interval.min(timeout - waited)).await;
        }
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool, LockError> {
        let mut conn = self.conn().await?;
        let deleted: i64 = self
            .release
            .key(key)
            .arg(token.value())
            .invoke_async(&mut conn)
            .await
            .map_err(LockError::backend)?;
        Ok(deleted == 1)
    }
}
