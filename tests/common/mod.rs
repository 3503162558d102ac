#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

use keygate::clock::{Clock, ManualClock};
use keygate::config::Config;
use keygate::crypto::HashEngine;
use keygate::directory::UserDirectory;
use keygate::middleware::audit::RecordingAudit;
use keygate::models::api_key::{ApiKeyRecord, KeyLimits, LegacyOwnership};
use keygate::store::{CasOutcome, KeyStore, MemoryKeyStore};
use keygate::{ApiKeyService, ServiceDeps};

pub const SERVER_SECRET: &str = "integration-server-secret";
pub const ITERATIONS: u32 = 1_000;

pub fn config() -> Config {
    let mut config = Config::with_secret(SERVER_SECRET);
    config.kdf_iterations = ITERATIONS;
    config.migration.retry_delay_ms = 10;
    config
}

pub fn hasher() -> HashEngine {
    HashEngine::new(SERVER_SECRET, ITERATIONS).unwrap()
}

/// Service over in-memory collaborators the test can inspect.
pub struct TestService {
    pub service: Arc<ApiKeyService>,
    pub store: Arc<MemoryKeyStore>,
    pub audit: Arc<RecordingAudit>,
    pub clock: Arc<ManualClock>,
}

pub fn service_with(config: Config, customize: impl FnOnce(&mut ServiceDeps)) -> TestService {
    let store = Arc::new(MemoryKeyStore::new());
    let audit = Arc::new(RecordingAudit::new());
    let clock = Arc::new(ManualClock::new());

    let mut deps = ServiceDeps::in_memory();
    deps.store = store.clone();
    deps.audit = audit.clone();
    deps.clock = clock.clone() as Arc<dyn Clock>;
    customize(&mut deps);

    TestService {
        service: Arc::new(ApiKeyService::start(config, deps).unwrap()),
        store,
        audit,
        clock,
    }
}

pub fn service() -> TestService {
    service_with(config(), |_| {})
}

pub fn record(id: &str, secret_hash: String) -> ApiKeyRecord {
    let now = Utc::now();
    ApiKeyRecord {
        id: id.into(),
        secret_hash,
        name: format!("key {}", id),
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
    }
}

// ═══════════════════════════════════════════════════════════════════
//  Interleaving helpers
// ═══════════════════════════════════════════════════════════════════

/// Parks the first caller of `pass` until the test calls `open`.
pub struct Gate {
    armed: AtomicBool,
    arrived: Notify,
    release: Semaphore,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            armed: AtomicBool::new(true),
            arrived: Notify::new(),
            release: Semaphore::new(0),
        })
    }

    pub async fn pass(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.arrived.notify_one();
            self.release.acquire().await.unwrap().forget();
        }
    }

    /// Resolves once something is parked in `pass`.
    pub async fn reached(&self) {
        self.arrived.notified().await;
    }

    pub fn open(&self) {
        self.release.add_permits(1);
    }
}

/// Which conditional writes a `GatedStore` holds back.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum GateOn {
    /// Writes that repoint the hash index (hash migration).
    HashWrites,
    /// Writes that leave the index alone (metadata updates).
    MetadataWrites,
}

/// `KeyStore` that parks one conditional write on a `Gate`, after the
/// writer has read the record and before the write lands.
pub struct GatedStore {
    pub inner: Arc<dyn KeyStore>,
    pub gate: Arc<Gate>,
    pub on: GateOn,
}

#[async_trait]
impl KeyStore for GatedStore {
    async fn get(&self, id: &str) -> anyhow::Result<Option<ApiKeyRecord>> {
        self.inner.get(id).await
    }

    async fn set(
        &self,
        id: &str,
        record: &ApiKeyRecord,
        new_index_hash: Option<&str>,
    ) -> anyhow::Result<()> {
        self.inner.set(id, record, new_index_hash).await
    }

    async fn compare_and_set(
        &self,
        id: &str,
        record: &ApiKeyRecord,
        new_index_hash: Option<&str>,
    ) -> anyhow::Result<CasOutcome> {
        let on = if new_index_hash.is_some() {
            GateOn::HashWrites
        } else {
            GateOn::MetadataWrites
        };
        if on == self.on {
            self.gate.pass().await;
        }
        self.inner.compare_and_set(id, record, new_index_hash).await
    }

    async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        self.inner.delete(id).await
    }

    async fn find_by_hash(&self, hash: &str) -> anyhow::Result<Option<ApiKeyRecord>> {
        self.inner.find_by_hash(hash).await
    }

    async fn list_all(&self) -> anyhow::Result<Vec<ApiKeyRecord>> {
        self.inner.list_all().await
    }
}

/// Directory that answers "active" for everyone, parking the first lookup
/// on a `Gate`.
pub struct GatedDirectory {
    pub gate: Arc<Gate>,
}

#[async_trait]
impl UserDirectory for GatedDirectory {
    async fn is_user_active(&self, _user_id: &str) -> anyhow::Result<bool> {
        self.gate.pass().await;
        Ok(true)
    }
}

/// `service_with` whose store parks writes of kind `on` behind `gate`.
pub fn gated_service(gate: Arc<Gate>, on: GateOn) -> TestService {
    service_with(config(), move |deps| {
        deps.store = Arc::new(GatedStore {
            inner: deps.store.clone(),
            gate,
            on,
        });
    })
}
