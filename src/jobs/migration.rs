//! Background re-hashing of keys still stored in a legacy format.
//!
//! Validation hands the plaintext secret to `MigrationQueue::schedule` after a
//! legacy match and moves on. Workers drain the queue and call
//! `MigrationCoordinator::migrate`, which serializes writers per key through a
//! distributed lease and swaps the hash with a revision-checked write, so
//! concurrent metadata updates are never overwritten.

use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use zeroize::Zeroizing;

use crate::crypto::{HashEngine, HashVersion};
use crate::lock::{self, DistributedLock, Lease, LeaseRequest};
use crate::middleware::audit::{AuditCategory, AuditOutcome, SecurityAudit};
use crate::middleware::metrics::AuthMetrics;
use crate::store::{self, KeyStore, Modified};

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    pub lease_ttl_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub queue_capacity: usize,
    pub workers: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            queue_capacity: 1024,
            workers: 2,
        }
    }
}

impl MigrationConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// A key that matched through a legacy hash and should be re-hashed.
pub struct MigrationJob {
    pub id: String,
    pub secret: Zeroizing<String>,
    /// The stored hash the validator matched against.
    pub observed_hash: String,
}

impl std::fmt::Debug for MigrationJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationJob")
            .field("id", &self.id)
            .field("secret", &"[REDACTED]")
            .field("observed_version", &HashVersion::of(&self.observed_hash))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    Migrated,
    /// Nothing to do: the hash is current, or another writer changed it.
    AlreadyCurrent,
    /// The lease could not be taken or was lost before writing.
    Skipped,
    /// The key was deleted before the migration ran.
    Missing,
    Failed(String),
}

impl MigrationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationOutcome::Migrated => "migrated",
            MigrationOutcome::AlreadyCurrent => "already_current",
            MigrationOutcome::Skipped => "skipped",
            MigrationOutcome::Missing => "missing",
            MigrationOutcome::Failed(_) => "failed",
        }
    }
}

pub struct MigrationCoordinator {
    store: Arc<dyn KeyStore>,
    lock: Arc<dyn DistributedLock>,
    hasher: Arc<HashEngine>,
    audit: Arc<dyn SecurityAudit>,
    config: MigrationConfig,
}

impl MigrationCoordinator {
    pub fn new(
        store: Arc<dyn KeyStore>,
        lock: Arc<dyn DistributedLock>,
        hasher: Arc<HashEngine>,
        audit: Arc<dyn SecurityAudit>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            store,
            lock,
            hasher,
            audit,
            config,
        }
    }

    /// Re-hash one key. Never returns an error: failures become
    /// `MigrationOutcome::Failed`.
    pub async fn migrate(&self, job: &MigrationJob) -> MigrationOutcome {
        if HashVersion::of(&job.observed_hash).is_current() {
            return MigrationOutcome::AlreadyCurrent;
        }

        let request = LeaseRequest::new(format!("migration:{}", job.id), self.config.lease_ttl())
            .with_retries(self.config.max_retries, self.config.retry_delay());
        let lease = match lock::acquire(self.lock.as_ref(), &request).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                tracing::debug!(key_id = %job.id, "migration lease busy, skipping");
                return MigrationOutcome::Skipped;
            }
            Err(e) => return self.failed(job, e),
        };

        let result = self.migrate_under_lease(job, &lease).await;
        if let Err(e) = self.lock.release(&lease).await {
            tracing::warn!(key_id = %job.id, "failed to release migration lease: {}", e);
        }

        match result {
            Ok(outcome) => outcome,
            Err(e) => self.failed(job, e),
        }
    }

    async fn migrate_under_lease(
        &self,
        job: &MigrationJob,
        lease: &Lease,
    ) -> anyhow::Result<MigrationOutcome> {
        let Some(record) = self.store.get(&job.id).await? else {
            return Ok(MigrationOutcome::Missing);
        };
        if record.secret_hash != job.observed_hash
            || HashVersion::of(&record.secret_hash).is_current()
        {
            return Ok(MigrationOutcome::AlreadyCurrent);
        }

        let hasher = self.hasher.clone();
        let secret = job.secret.clone();
        let new_hash = tokio::task::spawn_blocking(move || hasher.hash(&secret)).await?;

        if !self.lock.renew(lease).await? {
            tracing::warn!(key_id = %job.id, "migration lease lost before write");
            return Ok(MigrationOutcome::Skipped);
        }

        // Only the hash changes; metadata written while hashing is kept.
        let observed = job.observed_hash.as_str();
        let written = store::modify(self.store.as_ref(), &job.id, Some(&new_hash), |fresh| {
            if fresh.secret_hash != observed {
                return false;
            }
            fresh.secret_hash = new_hash.clone();
            true
        })
        .await?;
        match written {
            Modified::Written(_) => {}
            Modified::Unchanged(_) => return Ok(MigrationOutcome::AlreadyCurrent),
            Modified::Missing => return Ok(MigrationOutcome::Missing),
        }

        let from = HashVersion::of(observed);
        tracing::info!(key_id = %job.id, from = ?from, "migrated key hash to current format");
        self.audit.log_event(
            AuditCategory::HashMigration,
            AuditOutcome::Success,
            json!({ "key_id": job.id, "from": from, "to": HashVersion::V2 }),
        );
        Ok(MigrationOutcome::Migrated)
    }

    fn failed(&self, job: &MigrationJob, error: anyhow::Error) -> MigrationOutcome {
        tracing::error!(key_id = %job.id, "hash migration failed: {}", error);
        self.audit.log_event(
            AuditCategory::HashMigration,
            AuditOutcome::Failure,
            json!({ "key_id": job.id, "error": error.to_string() }),
        );
        MigrationOutcome::Failed(error.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MigrationStats {
    pub scheduled: u64,
    pub migrated: u64,
    pub already_current: u64,
    pub skipped: u64,
    pub missing: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    scheduled: AtomicU64,
    migrated: AtomicU64,
    already_current: AtomicU64,
    skipped: AtomicU64,
    missing: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

struct Shared {
    pending: AtomicUsize,
    idle: Notify,
    in_flight: DashSet<String>,
    counters: Counters,
    metrics: Arc<AuthMetrics>,
}

impl Shared {
    fn finish(&self, id: &str) {
        self.in_flight.remove(id);
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn count(&self, outcome: &MigrationOutcome) {
        let counter = match outcome {
            MigrationOutcome::Migrated => &self.counters.migrated,
            MigrationOutcome::AlreadyCurrent => &self.counters.already_current,
            MigrationOutcome::Skipped => &self.counters.skipped,
            MigrationOutcome::Missing => &self.counters.missing,
            MigrationOutcome::Failed(_) => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_migration(outcome.as_str());
    }
}

/// Bounded work queue in front of a `MigrationCoordinator`.
///
/// Dropping the queue closes the channel; workers finish queued jobs and exit.
pub struct MigrationQueue {
    sender: mpsc::Sender<MigrationJob>,
    shared: Arc<Shared>,
}

impl MigrationQueue {
    /// Spawn the workers. Must be called inside a tokio runtime.
    pub fn start(
        coordinator: Arc<MigrationCoordinator>,
        config: &MigrationConfig,
        metrics: Arc<AuthMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let shared = Arc::new(Shared {
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
            in_flight: DashSet::new(),
            counters: Counters::default(),
            metrics,
        });

        for worker in 0..config.workers.max(1) {
            let receiver = receiver.clone();
            let shared = shared.clone();
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                loop {
                    let job = receiver.lock().await.recv().await;
                    let Some(job) = job else { break };
                    let outcome = coordinator.migrate(&job).await;
                    tracing::debug!(
                        worker = worker,
                        key_id = %job.id,
                        outcome = outcome.as_str(),
                        "migration job finished"
                    );
                    shared.count(&outcome);
                    shared.finish(&job.id);
                }
            });
        }

        Self { sender, shared }
    }

    /// Enqueue without waiting. Returns `false` if the key is already queued
    /// or the queue is full (the job is then dropped and counted).
    pub fn schedule(&self, job: MigrationJob) -> bool {
        if !self.shared.in_flight.insert(job.id.clone()) {
            return false;
        }
        self.shared.pending.fetch_add(1, Ordering::SeqCst);

        match self.sender.try_send(job) {
            Ok(()) => {
                self.shared.counters.scheduled.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                let job = match e {
                    mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => job,
                };
                tracing::warn!(key_id = %job.id, "migration queue full, dropping job");
                self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                self.shared.finish(&job.id);
                false
            }
        }
    }

    /// Resolves once every scheduled job has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.shared.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> MigrationStats {
        let c = &self.shared.counters;
        MigrationStats {
            scheduled: c.scheduled.load(Ordering::Relaxed),
            migrated: c.migrated.load(Ordering::Relaxed),
            already_current: c.already_current.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            missing: c.missing.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLock;
    use crate::middleware::audit::RecordingAudit;
    use crate::models::api_key::{ApiKeyRecord, KeyLimits, LegacyOwnership};
    use crate::store::MemoryKeyStore;
    use chrono::Utc;

    const SECRET: &str = "sk-legacy-secret-0001";

    struct Fixture {
        store: Arc<MemoryKeyStore>,
        lock: Arc<MemoryLock>,
        hasher: Arc<HashEngine>,
        audit: Arc<RecordingAudit>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryKeyStore::new()),
                lock: Arc::new(MemoryLock::new()),
                hasher: Arc::new(HashEngine::new("test-server-secret", 1_000).unwrap()),
                audit: Arc::new(RecordingAudit::new()),
            }
        }

        fn coordinator(&self, config: MigrationConfig) -> MigrationCoordinator {
            MigrationCoordinator::new(
                self.store.clone(),
                self.lock.clone(),
                self.hasher.clone(),
                self.audit.clone(),
                config,
            )
        }

        async fn seed_legacy(&self, id: &str) -> String {
            let hash = self.hasher.legacy_hash(SECRET);
            let now = Utc::now();
            let record = ApiKeyRecord {
                id: id.into(),
                secret_hash: hash.clone(),
                name: id.into(),
                description: String::new(),
                limits: KeyLimits::default(),
                is_active: true,
                expires_at: None,
                owner: None,
                legacy: LegacyOwnership::default(),
                tags: vec![],
                created_at: now,
                updated_at: now,
                last_used_at: None,
                revision: 0,
            };
            self.store.set(id, &record, Some(&hash)).await.unwrap();
            hash
        }
    }

    fn job(id: &str, observed: &str) -> MigrationJob {
        MigrationJob {
            id: id.into(),
            secret: Zeroizing::new(SECRET.to_string()),
            observed_hash: observed.into(),
        }
    }

    fn fast() -> MigrationConfig {
        MigrationConfig {
            lease_ttl_ms: 5_000,
            max_retries: 1,
            retry_delay_ms: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_migrates_legacy_hash() {
        let fx = Fixture::new();
        let legacy = fx.seed_legacy("k1").await;
        let outcome = fx.coordinator(fast()).migrate(&job("k1", &legacy)).await;
        assert_eq!(outcome, MigrationOutcome::Migrated);

        let record = fx.store.get("k1").await.unwrap().unwrap();
        assert!(record.secret_hash.starts_with("v2:"));
        assert!(fx.hasher.verify(SECRET, &record.secret_hash));
        assert!(fx.store.find_by_hash(&legacy).await.unwrap().is_none());
        assert_eq!(fx.store.index_len(), 1);
        assert!(!fx.lock.is_held("migration:k1"));
        assert_eq!(
            fx.audit.count(AuditCategory::HashMigration, AuditOutcome::Success),
            1
        );
    }

    #[tokio::test]
    async fn test_current_hash_is_noop() {
        let fx = Fixture::new();
        let outcome = fx
            .coordinator(fast())
            .migrate(&job("k1", "v2:aa:bb"))
            .await;
        assert_eq!(outcome, MigrationOutcome::AlreadyCurrent);
        assert_eq!(fx.lock.attempts(), 0);
    }

    #[tokio::test]
    async fn test_missing_record() {
        let fx = Fixture::new();
        let outcome = fx.coordinator(fast()).migrate(&job("gone", "abc")).await;
        assert_eq!(outcome, MigrationOutcome::Missing);
        assert!(!fx.lock.is_held("migration:gone"));
    }

    #[tokio::test]
    async fn test_changed_hash_is_not_overwritten() {
        let fx = Fixture::new();
        fx.seed_legacy("k1").await;
        let outcome = fx
            .coordinator(fast())
            .migrate(&job("k1", "some-older-hash"))
            .await;
        assert_eq!(outcome, MigrationOutcome::AlreadyCurrent);
        assert_eq!(fx.store.stats().sets, 1);
    }

    #[tokio::test]
    async fn test_busy_lease_skips() {
        let fx = Fixture::new();
        let legacy = fx.seed_legacy("k1").await;
        let _held = lock::acquire(
            fx.lock.as_ref(),
            &LeaseRequest::new("migration:k1", Duration::from_secs(30)),
        )
        .await
        .unwrap()
        .unwrap();

        let outcome = fx.coordinator(fast()).migrate(&job("k1", &legacy)).await;
        assert_eq!(outcome, MigrationOutcome::Skipped);
        // initial attempt plus one retry, after the holder's own attempt
        assert_eq!(fx.lock.attempts(), 3);
        assert!(!fx.store.get("k1").await.unwrap().unwrap().secret_hash.starts_with("v2:"));
    }

    #[tokio::test]
    async fn test_queue_drains_and_counts() {
        let fx = Fixture::new();
        let legacy = fx.seed_legacy("k1").await;
        let metrics = Arc::new(AuthMetrics::new().unwrap());
        let queue = MigrationQueue::start(
            Arc::new(fx.coordinator(fast())),
            &fast(),
            metrics.clone(),
        );

        assert!(queue.schedule(job("k1", &legacy)));
        queue.wait_idle().await;

        let stats = queue.stats();
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.migrated, 1);
        assert_eq!(queue.pending(), 0);
        assert_eq!(metrics.migrations("migrated"), 1);
    }

    #[tokio::test]
    async fn test_queue_full_drops() {
        let fx = Fixture::new();
        let legacy = fx.seed_legacy("k1").await;
        let config = MigrationConfig {
            queue_capacity: 1,
            workers: 1,
            ..fast()
        };
        // Hold the lease so the worker is busy retrying the first job.
        let _held = lock::acquire(
            fx.lock.as_ref(),
            &LeaseRequest::new("migration:k1", Duration::from_secs(30)),
        )
        .await
        .unwrap()
        .unwrap();
        let queue = MigrationQueue::start(
            Arc::new(fx.coordinator(config.clone())),
            &config,
            Arc::new(AuthMetrics::new().unwrap()),
        );

        let mut accepted = 0;
        for i in 0..10 {
            if queue.schedule(job(&format!("k{}", i + 1), &legacy)) {
                accepted += 1;
            }
        }
        queue.wait_idle().await;

        let stats = queue.stats();
        assert!(stats.dropped > 0);
        assert_eq!(stats.scheduled, accepted);
        assert_eq!(stats.scheduled + stats.dropped, 10);
    }

    #[tokio::test]
    async fn test_duplicate_schedule_is_coalesced() {
        let fx = Fixture::new();
        let legacy = fx.seed_legacy("k1").await;
        let _held = lock::acquire(
            fx.lock.as_ref(),
            &LeaseRequest::new("migration:k1", Duration::from_secs(30)),
        )
        .await
        .unwrap()
        .unwrap();
        let queue = MigrationQueue::start(
            Arc::new(fx.coordinator(fast())),
            &fast(),
            Arc::new(AuthMetrics::new().unwrap()),
        );

        assert!(queue.schedule(job("k1", &legacy)));
        assert!(!queue.schedule(job("k1", &legacy)));
        queue.wait_idle().await;
        assert_eq!(queue.stats().scheduled, 1);
        assert_eq!(queue.stats().dropped, 0);
    }
}
