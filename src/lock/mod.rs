//! Cluster-wide mutual exclusion via time-bounded leases.
//!
//! A lease is owned by a random token. Only the holder of the token can renew
//! or release it, and an abandoned lease simply expires after its TTL, so a
//! crashed worker never blocks others for longer than one TTL.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::time::{Duration, Instant};

pub use memory::MemoryLock;
pub use self::redis::RedisLock;

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// One attempt to take every resource for `ttl` under `token`.
    /// All-or-nothing: either every resource is taken or none is.
    async fn try_acquire(&self, resources: &[String], ttl: Duration, token: &str)
        -> anyhow::Result<bool>;

    /// Extend the lease by its TTL. `false` means the lease was lost.
    async fn renew(&self, lease: &Lease) -> anyhow::Result<bool>;

    /// Release resources still held under the lease's token.
    async fn release(&self, lease: &Lease) -> anyhow::Result<()>;
}

/// Parameters for `acquire`.
#[derive(Debug, Clone)]
pub struct LeaseRequest {
    pub resources: Vec<String>,
    pub ttl: Duration,
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl LeaseRequest {
    pub fn new(resource: impl Into<String>, ttl: Duration) -> Self {
        Self {
            resources: vec![resource.into()],
            ttl,
            max_retries: 0,
            retry_delay: Duration::ZERO,
        }
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }
}

/// A held lease.
#[derive(Debug, Clone)]
pub struct Lease {
    resources: Vec<String>,
    token: String,
    ttl: Duration,
    acquired_at: Instant,
}

impl Lease {
    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Local estimate of remaining validity. The lock backend is authoritative.
    pub fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.acquired_at.elapsed())
    }
}

/// Acquire a lease, retrying with fixed backoff. `Ok(None)` means the
/// resources stayed busy for every attempt.
pub async fn acquire(
    lock: &dyn DistributedLock,
    request: &LeaseRequest,
) -> anyhow::Result<Option<Lease>> {
    let token = uuid::Uuid::new_v4().to_string();
    let attempts = request.max_retries + 1;

    for attempt in 1..=attempts {
        if lock
            .try_acquire(&request.resources, request.ttl, &token)
            .await?
        {
            return Ok(Some(Lease {
                resources: request.resources.clone(),
                token,
                ttl: request.ttl,
                acquired_at: Instant::now(),
            }));
        }
        if attempt < attempts {
            tracing::debug!(
                resources = ?request.resources,
                attempt = attempt,
                "lease busy, retrying"
            );
            tokio::time::sleep(request.retry_delay).await;
        }
    }
    Ok(None)
}
