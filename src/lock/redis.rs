use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;

use super::{DistributedLock, Lease};

const KEY_PREFIX: &str = "lock:";

// All keys must be free (or already ours) before any is written.
const ACQUIRE_SCRIPT: &str = r#"
for i, key in ipairs(KEYS) do
    local holder = redis.call("GET", key)
    if holder and holder ~= ARGV[1] then
        return 0
    end
end
for i, key in ipairs(KEYS) do
    redis.call("SET", key, ARGV[1], "PX", ARGV[2])
end
return 1
"#;

const RENEW_SCRIPT: &str = r#"
for i, key in ipairs(KEYS) do
    if redis.call("GET", key) ~= ARGV[1] then
        return 0
    end
end
for i, key in ipairs(KEYS) do
    redis.call("PEXPIRE", key, ARGV[2])
end
return 1
"#;

const RELEASE_SCRIPT: &str = r#"
local released = 0
for i, key in ipairs(KEYS) do
    if redis.call("GET", key) == ARGV[1] then
        redis.call("DEL", key)
        released = released + 1
    end
end
return released
"#;

/// Lease lock over Redis keys (`SET PX` with a token value).
#[derive(Clone)]
pub struct RedisLock {
    redis: ConnectionManager,
}

impl RedisLock {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    fn keys(resources: &[String]) -> Vec<String> {
        resources
            .iter()
            .map(|r| format!("{}{}", KEY_PREFIX, r))
            .collect()
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_acquire(
        &self,
        resources: &[String],
        ttl: Duration,
        token: &str,
    ) -> anyhow::Result<bool> {
        let mut conn = self.redis.clone();
        let script = redis::Script::new(ACQUIRE_SCRIPT);
        let acquired: i64 = script
            .key(Self::keys(resources))
            .arg(token)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(acquired == 1)
    }

    async fn renew(&self, lease: &Lease) -> anyhow::Result<bool> {
        let mut conn = self.redis.clone();
        let script = redis::Script::new(RENEW_SCRIPT);
        let renewed: i64 = script
            .key(Self::keys(lease.resources()))
            .arg(lease.token())
            .arg(ttl_ms(lease.ttl()))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self, lease: &Lease) -> anyhow::Result<()> {
        let mut conn = self.redis.clone();
        let script = redis::Script::new(RELEASE_SCRIPT);
        let released: i64 = script
            .key(Self::keys(lease.resources()))
            .arg(lease.token())
            .invoke_async(&mut conn)
            .await?;
        if released < lease.resources().len() as i64 {
            tracing::debug!(
                resources = ?lease.resources(),
                "lease partially expired before release"
            );
        }
        Ok(())
    }
}
