//! API key validation pipeline.
//!
//! Lookup order is cheapest first: current-format index, legacy-format index,
//! then a bounded full scan guarded by `DosGuard`. Whatever is found passes
//! through legacy ownership normalization and the status checks before a
//! read-only view is returned.

use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::crypto::secret::{has_valid_format, mask};
use crate::crypto::{HashEngine, HashVersion};
use crate::errors::AuthError;
use crate::jobs::migration::{MigrationJob, MigrationQueue};
use crate::middleware::audit::{AuditCategory, AuditOutcome, SecurityAudit};
use crate::middleware::dos_guard::DosGuard;
use crate::middleware::legacy::{LegacyDataAdapter, NormalizeOutcome};
use crate::middleware::metrics::{AuthMetrics, LookupTier};
use crate::models::api_key::{ApiKeyRecord, ApiKeyView};
use crate::models::auth::{AuthContext, AuthResult};
use crate::store::{self, KeyStore};

pub const DEFAULT_KEY_PREFIX: &str = "sk-";
pub const DEFAULT_FULL_SCAN_CAP: usize = 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorConfig {
    pub key_prefix: String,
    /// Upper bound on records examined by one full scan.
    pub full_scan_cap: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            full_scan_cap: DEFAULT_FULL_SCAN_CAP,
        }
    }
}

/// Hashes of one presented secret, computed once per validation.
struct Candidates {
    current: String,
    legacy: [String; 2],
}

pub struct Validator {
    config: ValidatorConfig,
    store: Arc<dyn KeyStore>,
    hasher: Arc<HashEngine>,
    guard: Arc<DosGuard>,
    legacy: LegacyDataAdapter,
    migrations: Arc<MigrationQueue>,
    metrics: Arc<AuthMetrics>,
    audit: Arc<dyn SecurityAudit>,
}

impl Validator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ValidatorConfig,
        store: Arc<dyn KeyStore>,
        hasher: Arc<HashEngine>,
        guard: Arc<DosGuard>,
        legacy: LegacyDataAdapter,
        migrations: Arc<MigrationQueue>,
        metrics: Arc<AuthMetrics>,
        audit: Arc<dyn SecurityAudit>,
    ) -> Self {
        Self {
            config,
            store,
            hasher,
            guard,
            legacy,
            migrations,
            metrics,
            audit,
        }
    }

    pub fn key_prefix(&self) -> &str {
        &self.config.key_prefix
    }

    pub async fn validate(&self, secret: &str, ctx: &AuthContext) -> AuthResult {
        let result = self.check(secret, ctx).await;
        match &result {
            Ok(view) => {
                self.metrics.record_validation("valid");
                tracing::debug!(key_id = %view.id, source = %ctx.source, "api key accepted");
            }
            Err(e) => {
                let failure = e.failure();
                self.metrics.record_validation(failure.as_str());
                match e {
                    AuthError::Redis(_) | AuthError::Internal(_) => tracing::error!(
                        source = %ctx.source,
                        key = %mask(secret),
                        "api key validation failed: {}",
                        e
                    ),
                    _ => tracing::debug!(
                        source = %ctx.source,
                        key = %mask(secret),
                        reason = failure.as_str(),
                        "api key rejected"
                    ),
                }
            }
        }
        AuthResult::from(result)
    }

    async fn check(&self, secret: &str, ctx: &AuthContext) -> Result<ApiKeyView, AuthError> {
        if !has_valid_format(secret, &self.config.key_prefix) {
            return Err(AuthError::FormatInvalid);
        }
        let secret = Zeroizing::new(secret.to_string());
        let candidates = self.candidates(&secret).await?;

        let mut record = match self.lookup(&secret, &candidates, ctx).await? {
            Some(record) => record,
            None => return Err(AuthError::NotFound),
        };

        if self.legacy.normalize(&mut record, ctx).await? == NormalizeOutcome::Normalized {
            record = self.persist_owner(&record).await?;
        }

        if !record.is_active {
            return Err(AuthError::Disabled);
        }
        if record.is_expired_at(chrono::Utc::now()) {
            return Err(AuthError::Expired);
        }
        Ok(record.view())
    }

    /// Write the adopted owner onto the freshest stored copy, leaving any
    /// hash migration or metadata update that landed meanwhile in place.
    async fn persist_owner(&self, normalized: &ApiKeyRecord) -> Result<ApiKeyRecord, AuthError> {
        let owner = normalized.owner.clone();
        let written = store::modify(self.store.as_ref(), &normalized.id, None, |fresh| {
            if fresh.owner.is_some() {
                return false;
            }
            fresh.owner = owner.clone();
            true
        })
        .await?;
        written.into_record().ok_or(AuthError::NotFound)
    }

    async fn candidates(&self, secret: &Zeroizing<String>) -> Result<Candidates, AuthError> {
        let hasher = self.hasher.clone();
        let secret = secret.clone();
        let candidates = tokio::task::spawn_blocking(move || Candidates {
            current: hasher.hash(&secret),
            legacy: hasher.legacy_candidates(&secret),
        })
        .await
        .map_err(|e| AuthError::Internal(e.into()))?;
        Ok(candidates)
    }

    async fn lookup(
        &self,
        secret: &Zeroizing<String>,
        candidates: &Candidates,
        ctx: &AuthContext,
    ) -> Result<Option<ApiKeyRecord>, AuthError> {
        if let Some(record) = self.find_indexed(&candidates.current).await? {
            self.metrics.record_lookup(LookupTier::Current);
            return Ok(Some(record));
        }

        for legacy in &candidates.legacy {
            if let Some(record) = self.find_indexed(legacy).await? {
                self.metrics.record_lookup(LookupTier::Legacy);
                self.schedule_migration(&record, secret);
                return Ok(Some(record));
            }
        }

        self.full_scan(secret, candidates, ctx).await
    }

    /// Index hit whose record still carries the indexed hash.
    async fn find_indexed(&self, hash: &str) -> Result<Option<ApiKeyRecord>, AuthError> {
        let found = self.store.find_by_hash(hash).await?;
        Ok(found.filter(|record| record.secret_hash == hash))
    }

    async fn full_scan(
        &self,
        secret: &Zeroizing<String>,
        candidates: &Candidates,
        ctx: &AuthContext,
    ) -> Result<Option<ApiKeyRecord>, AuthError> {
        if !self.guard.allow(&ctx.source) {
            self.metrics.set_circuit_open(self.guard.status().circuit_open);
            self.audit.log_event(
                AuditCategory::Authentication,
                AuditOutcome::Blocked,
                json!({ "reason": "full_scan_denied", "source": ctx.source }),
            );
            return Err(AuthError::ServiceUnavailable);
        }

        let mut records = self.store.list_all().await?;
        records.truncate(self.config.full_scan_cap);

        let hasher = self.hasher.clone();
        let secret_owned = secret.clone();
        let current = candidates.current.clone();
        let (found, examined) = tokio::task::spawn_blocking(move || {
            let mut examined = 0;
            for record in records {
                examined += 1;
                if hasher.verify_precomputed(&secret_owned, &current, &record.secret_hash) {
                    return (Some(record), examined);
                }
            }
            (None, examined)
        })
        .await
        .map_err(|e| AuthError::Internal(e.into()))?;

        self.metrics.observe_full_scan(examined);
        match found {
            Some(record) => {
                self.guard.record_success();
                self.metrics.record_lookup(LookupTier::FullScan);
                tracing::warn!(
                    key_id = %record.id,
                    examined = examined,
                    "api key resolved by full scan, hash index is missing an entry"
                );
                self.schedule_migration(&record, secret);
                Ok(Some(record))
            }
            None => {
                self.guard.record_failure(&ctx.source);
                self.metrics.record_lookup(LookupTier::Miss);
                self.metrics.set_circuit_open(self.guard.status().circuit_open);
                Ok(None)
            }
        }
    }

    fn schedule_migration(&self, record: &ApiKeyRecord, secret: &Zeroizing<String>) {
        if HashVersion::of(&record.secret_hash).is_current() {
            return;
        }
        self.migrations.schedule(MigrationJob {
            id: record.id.clone(),
            secret: secret.clone(),
            observed_hash: record.secret_hash.clone(),
        });
    }
}
