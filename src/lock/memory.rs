use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{DistributedLock, Lease};

#[derive(Debug)]
struct Holder {
    token: String,
    expires_at: Instant,
}

/// Single-process lock with lease semantics. Expired leases are reclaimable.
#[derive(Debug, Default)]
pub struct MemoryLock {
    holders: Mutex<HashMap<String, Holder>>,
    attempts: AtomicUsize,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total `try_acquire` calls so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_held(&self, resource: &str) -> bool {
        let now = Instant::now();
        self.holders
            .lock()
            .map(|h| h.get(resource).is_some_and(|holder| holder.expires_at > now))
            .unwrap_or(false)
    }

    fn holders(&self) -> anyhow::Result<std::sync::MutexGuard<'_, HashMap<String, Holder>>> {
        self.holders
            .lock()
            .map_err(|_| anyhow::anyhow!("memory lock poisoned"))
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn try_acquire(
        &self,
        resources: &[String],
        ttl: Duration,
        token: &str,
    ) -> anyhow::Result<bool> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = Instant::now();
        let mut holders = self.holders()?;

        let busy = resources.iter().any(|r| {
            holders
                .get(r)
                .is_some_and(|h| h.expires_at > now && h.token != token)
        });
        if busy {
            return Ok(false);
        }
        for resource in resources {
            holders.insert(
                resource.clone(),
                Holder {
                    token: token.to_string(),
                    expires_at: now + ttl,
                },
            );
        }
        Ok(true)
    }

    async fn renew(&self, lease: &Lease) -> anyhow::Result<bool> {
        let now = Instant::now();
        let mut holders = self.holders()?;
        let owned = lease.resources().iter().all(|r| {
            holders
                .get(r)
                .is_some_and(|h| h.token == lease.token() && h.expires_at > now)
        });
        if !owned {
            return Ok(false);
        }
        for resource in lease.resources() {
            if let Some(holder) = holders.get_mut(resource) {
                holder.expires_at = now + lease.ttl();
            }
        }
        Ok(true)
    }

    async fn release(&self, lease: &Lease) -> anyhow::Result<()> {
        let mut holders = self.holders()?;
        for resource in lease.resources() {
            if holders
                .get(resource)
                .is_some_and(|h| h.token == lease.token())
            {
                holders.remove(resource);
            }
        }
        Ok(())
    }
}
