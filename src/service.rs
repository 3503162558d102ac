//! `ApiKeyService`: the surface the gateway calls.
//!
//! Wires the hash engine, store, DoS guard, validator, migration queue and
//! collision detector together from a `Config` and a set of collaborators.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::crypto::secret::generate_secret;
use crate::crypto::HashEngine;
use crate::directory::UserDirectory;
use crate::errors::AuthError;
use crate::jobs::collision::{self, CollisionDetector, CollisionReport};
use crate::jobs::expiry;
use crate::jobs::migration::{MigrationCoordinator, MigrationQueue};
use crate::lock::{DistributedLock, MemoryLock, RedisLock};
use crate::middleware::audit::{AuditCategory, AuditOutcome, SecurityAudit, TracingAudit};
use crate::middleware::dos_guard::{DosGuard, DosGuardStatus};
use crate::middleware::legacy::LegacyDataAdapter;
use crate::middleware::metrics::AuthMetrics;
use crate::models::api_key::{
    ApiKeyRecord, ApiKeyView, GeneratedKey, KeyPatch, NewKeyOptions, UsageEvent,
};
use crate::models::auth::{AuthContext, AuthResult};
use crate::store::{self, KeyStore, MemoryKeyStore, RedisKeyStore};
use crate::usage::{TracingUsageRecorder, UsageRecorder};
use crate::validator::Validator;

/// External collaborators. Everything here is swappable for tests.
pub struct ServiceDeps {
    pub store: Arc<dyn KeyStore>,
    pub lock: Arc<dyn DistributedLock>,
    pub audit: Arc<dyn SecurityAudit>,
    pub directory: Option<Arc<dyn UserDirectory>>,
    pub usage: Arc<dyn UsageRecorder>,
    pub clock: Arc<dyn Clock>,
}

impl ServiceDeps {
    /// In-process store and lock. Suitable for a single instance or tests.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryKeyStore::new()),
            lock: Arc::new(MemoryLock::new()),
            audit: Arc::new(TracingAudit),
            directory: None,
            usage: Arc::new(TracingUsageRecorder),
            clock: Arc::new(SystemClock),
        }
    }

    /// Store and lock sharing one Redis connection manager.
    pub async fn redis(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        tracing::info!("connected to redis for key storage and locking");
        Ok(Self {
            store: Arc::new(RedisKeyStore::new(conn.clone())),
            lock: Arc::new(RedisLock::new(conn)),
            ..Self::in_memory()
        })
    }
}

pub struct ApiKeyService {
    config: Config,
    store: Arc<dyn KeyStore>,
    hasher: Arc<HashEngine>,
    guard: Arc<DosGuard>,
    validator: Validator,
    migrations: Arc<MigrationQueue>,
    detector: Arc<CollisionDetector>,
    metrics: Arc<AuthMetrics>,
    audit: Arc<dyn SecurityAudit>,
    usage: Arc<dyn UsageRecorder>,
}

impl ApiKeyService {
    /// Build the service and start migration workers. Must be called inside
    /// a tokio runtime.
    pub fn start(config: Config, deps: ServiceDeps) -> anyhow::Result<Self> {
        let hasher = Arc::new(HashEngine::new(&config.server_secret, config.kdf_iterations)?);
        let metrics = Arc::new(AuthMetrics::new()?);
        let guard = Arc::new(DosGuard::with_clock(config.dos.clone(), deps.clock.clone()));

        let coordinator = Arc::new(MigrationCoordinator::new(
            deps.store.clone(),
            deps.lock.clone(),
            hasher.clone(),
            deps.audit.clone(),
            config.migration.clone(),
        ));
        let migrations = Arc::new(MigrationQueue::start(
            coordinator,
            &config.migration,
            metrics.clone(),
        ));

        let validator = Validator::new(
            config.validator.clone(),
            deps.store.clone(),
            hasher.clone(),
            guard.clone(),
            LegacyDataAdapter::new(deps.audit.clone(), deps.directory.clone()),
            migrations.clone(),
            metrics.clone(),
            deps.audit.clone(),
        );
        let detector = Arc::new(CollisionDetector::new(
            deps.store.clone(),
            deps.audit.clone(),
        ));

        tracing::info!(
            kdf_iterations = config.kdf_iterations,
            full_scan_cap = config.validator.full_scan_cap,
            migration_workers = config.migration.workers,
            "api key service started"
        );

        Ok(Self {
            config,
            store: deps.store,
            hasher,
            guard,
            validator,
            migrations,
            detector,
            metrics,
            audit: deps.audit,
            usage: deps.usage,
        })
    }

    /// `start` with backends chosen by `config.redis_url`.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let deps = match &config.redis_url {
            Some(url) => ServiceDeps::redis(url).await?,
            None => {
                tracing::warn!("REDIS_URL not set, using in-process key store and lock");
                ServiceDeps::in_memory()
            }
        };
        Self::start(config, deps)
    }

    /// Start the periodic collision scan and expiry sweep.
    pub fn spawn_jobs(&self) {
        collision::spawn(self.detector.clone(), self.config.collision_scan_interval());
        expiry::spawn(self.store.clone(), self.config.expiry_sweep_interval());
    }

    pub async fn generate_key(&self, options: NewKeyOptions) -> Result<GeneratedKey, AuthError> {
        if options.name.trim().is_empty() {
            return Err(AuthError::InvalidRequest("key name must not be empty".into()));
        }

        let secret = generate_secret(self.validator.key_prefix());
        let hasher = self.hasher.clone();
        let to_hash = secret.clone();
        let secret_hash = tokio::task::spawn_blocking(move || hasher.hash(&to_hash))
            .await
            .map_err(|e| AuthError::Internal(e.into()))?;

        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        let record = ApiKeyRecord {
            id: id.clone(),
            secret_hash: secret_hash.clone(),
            name: options.name,
            description: options.description,
            limits: options.limits,
            is_active: options.is_active,
            expires_at: options.expires_at,
            owner: options.owner,
            legacy: Default::default(),
            tags: options.tags,
            created_at: now,
            updated_at: now,
            last_used_at: None,
            revision: 0,
        };
        self.store.set(&id, &record, Some(&secret_hash)).await?;

        tracing::info!(key_id = %id, name = %record.name, "api key created");
        self.lifecycle("created", &id);
        Ok(GeneratedKey {
            id,
            plaintext_secret: secret,
            view: record.view(),
        })
    }

    pub async fn validate(&self, secret: &str, ctx: &AuthContext) -> AuthResult {
        self.validator.validate(secret, ctx).await
    }

    pub async fn update(&self, id: &str, patch: KeyPatch) -> Result<ApiKeyView, AuthError> {
        if patch.name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            return Err(AuthError::InvalidRequest("key name must not be empty".into()));
        }
        let now = Utc::now();
        let record = store::modify(self.store.as_ref(), id, None, |record| {
            patch.clone().apply(record, now);
            true
        })
        .await?
        .into_record()
        .ok_or(AuthError::NotFound)?;

        tracing::info!(key_id = %id, "api key updated");
        self.lifecycle("updated", id);
        Ok(record.view())
    }

    pub async fn delete(&self, id: &str) -> Result<(), AuthError> {
        if !self.store.delete(id).await? {
            return Err(AuthError::NotFound);
        }
        tracing::info!(key_id = %id, "api key deleted");
        self.lifecycle("deleted", id);
        Ok(())
    }

    pub async fn list_all(&self) -> Result<Vec<ApiKeyView>, AuthError> {
        let records = self.store.list_all().await?;
        Ok(records.iter().map(ApiKeyView::from).collect())
    }

    /// Touch `last_used_at` and hand the usage to the recorder.
    pub async fn record_usage(&self, id: &str, usage: UsageEvent) -> Result<(), AuthError> {
        let now = Utc::now();
        store::modify(self.store.as_ref(), id, None, |record| {
            record.last_used_at = Some(now);
            true
        })
        .await?
        .into_record()
        .ok_or(AuthError::NotFound)?;
        self.usage.record(id, &usage);
        Ok(())
    }

    pub async fn scan_collisions(&self) -> Result<CollisionReport, AuthError> {
        Ok(self.detector.scan().await?)
    }

    pub async fn sweep_expired(&self) -> Result<usize, AuthError> {
        Ok(expiry::sweep_expired(self.store.as_ref(), Utc::now()).await?)
    }

    pub fn dos_status(&self) -> DosGuardStatus {
        self.guard.status()
    }

    pub fn migrations(&self) -> &MigrationQueue {
        &self.migrations
    }

    pub fn metrics(&self) -> &AuthMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn lifecycle(&self, action: &str, id: &str) {
        self.audit.log_event(
            AuditCategory::KeyLifecycle,
            AuditOutcome::Success,
            json!({ "action": action, "key_id": id }),
        );
    }
}
