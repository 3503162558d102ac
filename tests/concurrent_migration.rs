//! Concurrency checks for legacy hash migration: many writers racing on the
//! same key must produce exactly one re-hash and a consistent index, and
//! metadata written around a migration must survive it.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use zeroize::Zeroizing;

use keygate::directory::UserDirectory;
use keygate::jobs::migration::{MigrationConfig, MigrationCoordinator, MigrationJob, MigrationOutcome};
use keygate::lock::MemoryLock;
use keygate::middleware::audit::RecordingAudit;
use keygate::middleware::metrics::LookupTier;
use keygate::models::api_key::{KeyPatch, Owner, TokenCounts, UsageEvent};
use keygate::models::auth::AuthContext;
use keygate::store::{KeyStore, MemoryKeyStore};
use keygate::AuthFailure;

use common::{
    config, gated_service, hasher, record, service, service_with, Gate, GateOn, GatedDirectory,
    TestService,
};

const SECRET: &str = "sk-contended-legacy-secret";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_coordinators_migrate_once() {
    let store = Arc::new(MemoryKeyStore::new());
    let lock = Arc::new(MemoryLock::new());
    let engine = Arc::new(hasher());
    let audit = Arc::new(RecordingAudit::new());

    let legacy = engine.legacy_hash(SECRET);
    store
        .set("shared", &record("shared", legacy.clone()), Some(&legacy))
        .await
        .unwrap();

    let config = MigrationConfig {
        retry_delay_ms: 5,
        ..Default::default()
    };
    let mut handles = Vec::new();
    for _ in 0..8 {
        // Separate coordinators stand in for separate gateway instances.
        let coordinator = MigrationCoordinator::new(
            store.clone(),
            lock.clone(),
            engine.clone(),
            audit.clone(),
            config.clone(),
        );
        let job = MigrationJob {
            id: "shared".into(),
            secret: Zeroizing::new(SECRET.to_string()),
            observed_hash: legacy.clone(),
        };
        handles.push(tokio::spawn(async move { coordinator.migrate(&job).await }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    let migrated = outcomes
        .iter()
        .filter(|o| **o == MigrationOutcome::Migrated)
        .count();
    assert_eq!(migrated, 1, "outcomes: {:?}", outcomes);
    assert!(outcomes.iter().all(|o| matches!(
        o,
        MigrationOutcome::Migrated | MigrationOutcome::AlreadyCurrent | MigrationOutcome::Skipped
    )));

    let stored = store.get("shared").await.unwrap().unwrap();
    assert!(stored.secret_hash.starts_with("v2:"));
    assert!(engine.verify(SECRET, &stored.secret_hash));
    assert_eq!(store.index_len(), 1);
    assert_eq!(
        store.find_by_hash(&stored.secret_hash).await.unwrap().unwrap().id,
        "shared"
    );
    assert!(!lock.is_held("migration:shared"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_validations_schedule_one_migration() {
    let t = service();
    let legacy = hasher().legacy_hash(SECRET);
    t.store
        .set("hot", &record("hot", legacy.clone()), Some(&legacy))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let service = t.service.clone();
        handles.push(tokio::spawn(async move {
            service
                .validate(SECRET, &AuthContext::new(format!("10.9.0.{}", i)))
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_valid());
    }

    t.service.migrations().wait_idle().await;
    let stats = t.service.migrations().stats();
    assert_eq!(stats.migrated, 1, "stats: {:?}", stats);
    assert_eq!(stats.failed, 0);

    let stored = t.store.get("hot").await.unwrap().unwrap();
    assert!(stored.secret_hash.starts_with("v2:"));
    assert_eq!(t.store.index_len(), 1);
}

// ═══════════════════════════════════════════════════════════════════
//  Metadata writes interleaved with a migration
// ═══════════════════════════════════════════════════════════════════

async fn seed_legacy(t: &TestService, id: &str) -> String {
    let legacy = hasher().legacy_hash(SECRET);
    t.store
        .set(id, &record(id, legacy.clone()), Some(&legacy))
        .await
        .unwrap();
    legacy
}

/// Stored hash is current and the index holds exactly that hash for `id`.
async fn assert_migrated_and_indexed(t: &TestService, id: &str, legacy: &str) {
    let stored = t.store.get(id).await.unwrap().unwrap();
    assert!(stored.secret_hash.starts_with("v2:"), "hash: {}", stored.secret_hash);
    assert!(t.store.find_by_hash(legacy).await.unwrap().is_none());
    let indexed = t.store.find_by_hash(&stored.secret_hash).await.unwrap().unwrap();
    assert_eq!(indexed.id, id);
    assert_eq!(indexed.secret_hash, stored.secret_hash);
    assert_eq!(t.store.index_len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disable_while_migrating_stays_disabled() {
    let gate = Gate::new();
    let t = gated_service(gate.clone(), GateOn::HashWrites);
    let legacy = seed_legacy(&t, "revoked").await;

    assert!(t.service.validate(SECRET, &AuthContext::new("10.8.0.1")).await.is_valid());
    // The worker has re-hashed and read the record; its write is parked.
    gate.reached().await;

    let patch = KeyPatch {
        is_active: Some(false),
        ..Default::default()
    };
    assert!(!t.service.update("revoked", patch).await.unwrap().is_active);

    gate.open();
    t.service.migrations().wait_idle().await;
    assert_eq!(t.service.migrations().stats().migrated, 1);

    assert!(!t.store.get("revoked").await.unwrap().unwrap().is_active);
    assert_migrated_and_indexed(&t, "revoked", &legacy).await;

    let again = t.service.validate(SECRET, &AuthContext::new("10.8.0.1")).await;
    assert_eq!(again.failure(), Some(AuthFailure::Disabled));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_usage_write_does_not_revert_migration() {
    let gate = Gate::new();
    let t = gated_service(gate.clone(), GateOn::MetadataWrites);
    let legacy = seed_legacy(&t, "busy").await;

    let service = t.service.clone();
    let usage = tokio::spawn(async move {
        let event = UsageEvent {
            tokens: TokenCounts::default(),
            model: "claude-3-haiku".into(),
            account_id: None,
        };
        service.record_usage("busy", event).await
    });
    // record_usage holds a pre-migration copy of the record.
    gate.reached().await;

    assert!(t.service.validate(SECRET, &AuthContext::new("10.8.0.2")).await.is_valid());
    t.service.migrations().wait_idle().await;
    assert_eq!(t.service.migrations().stats().migrated, 1);

    gate.open();
    usage.await.unwrap().unwrap();

    assert!(t.store.get("busy").await.unwrap().unwrap().last_used_at.is_some());
    assert_migrated_and_indexed(&t, "busy", &legacy).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expiry_sweep_does_not_revert_migration() {
    let gate = Gate::new();
    let t = gated_service(gate.clone(), GateOn::MetadataWrites);
    let legacy = hasher().legacy_hash(SECRET);
    let mut stale = record("stale", legacy.clone());
    stale.expires_at = Some(Utc::now() - ChronoDuration::hours(1));
    t.store.set("stale", &stale, Some(&legacy)).await.unwrap();

    let service = t.service.clone();
    let sweep = tokio::spawn(async move { service.sweep_expired().await });
    gate.reached().await;

    // Expired keys are rejected but still queue their migration.
    let result = t.service.validate(SECRET, &AuthContext::new("10.8.0.3")).await;
    assert_eq!(result.failure(), Some(AuthFailure::Expired));
    t.service.migrations().wait_idle().await;
    assert_eq!(t.service.migrations().stats().migrated, 1);

    gate.open();
    assert_eq!(sweep.await.unwrap().unwrap(), 1);

    assert!(!t.store.get("stale").await.unwrap().unwrap().is_active);
    assert_migrated_and_indexed(&t, "stale", &legacy).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_owner_adoption_does_not_revert_migration() {
    let gate = Gate::new();
    let directory = Arc::new(GatedDirectory { gate: gate.clone() });
    let t = service_with(config(), |deps| {
        deps.directory = Some(directory as Arc<dyn UserDirectory>);
    });
    let legacy = hasher().legacy_hash(SECRET);
    let mut owned = record("owned", legacy.clone());
    owned.legacy.user_id = Some("carol".into());
    t.store.set("owned", &owned, Some(&legacy)).await.unwrap();

    let service = t.service.clone();
    let first = tokio::spawn(async move {
        service.validate(SECRET, &AuthContext::new("10.8.0.4")).await
    });
    // Validation is inside normalization with the legacy-hash copy in hand.
    gate.reached().await;
    t.service.migrations().wait_idle().await;
    assert_eq!(t.service.migrations().stats().migrated, 1);

    gate.open();
    let first = first.await.unwrap();
    assert_eq!(first.key.unwrap().owner, Some(Owner::user("carol")));

    assert_eq!(
        t.store.get("owned").await.unwrap().unwrap().owner,
        Some(Owner::user("carol"))
    );
    assert_migrated_and_indexed(&t, "owned", &legacy).await;

    // Converged: the next validation resolves through the current index.
    let scans = t.store.stats().list_alls;
    let second = t.service.validate(SECRET, &AuthContext::new("10.8.0.4")).await;
    assert!(second.is_valid());
    assert_eq!(t.store.stats().list_alls, scans);
    assert_eq!(t.service.metrics().lookups(LookupTier::Current), 1);
}
