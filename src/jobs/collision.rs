//! Periodic check for distinct keys sharing one stored hash.
//!
//! A shared hash means one secret authenticates as several keys, which the
//! index can only resolve to one of them. The detector only flags; operators
//! decide which key to revoke.

use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use crate::crypto::HashVersion;
use crate::middleware::audit::{AuditCategory, AuditOutcome, SecurityAudit};
use crate::store::KeyStore;

const HASH_PREFIX_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashCollision {
    /// Leading characters of the shared hash. The full hash is never reported.
    pub hash_prefix: String,
    pub version: HashVersion,
    pub key_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollisionReport {
    pub scanned: usize,
    pub collisions: Vec<HashCollision>,
}

impl CollisionReport {
    pub fn is_clean(&self) -> bool {
        self.collisions.is_empty()
    }
}

pub struct CollisionDetector {
    store: Arc<dyn KeyStore>,
    audit: Arc<dyn SecurityAudit>,
}

impl CollisionDetector {
    pub fn new(store: Arc<dyn KeyStore>, audit: Arc<dyn SecurityAudit>) -> Self {
        Self { store, audit }
    }

    pub async fn scan(&self) -> anyhow::Result<CollisionReport> {
        let records = self.store.list_all().await?;
        let scanned = records.len();

        let mut by_hash: HashMap<String, Vec<String>> = HashMap::new();
        for record in records {
            by_hash.entry(record.secret_hash).or_default().push(record.id);
        }

        let mut collisions: Vec<HashCollision> = by_hash
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(hash, mut key_ids)| {
                key_ids.sort();
                HashCollision {
                    hash_prefix: hash.chars().take(HASH_PREFIX_LEN).collect(),
                    version: HashVersion::of(&hash),
                    key_ids,
                }
            })
            .collect();
        collisions.sort_by(|a, b| a.key_ids.cmp(&b.key_ids));

        for collision in &collisions {
            tracing::warn!(
                hash_prefix = %collision.hash_prefix,
                version = ?collision.version,
                key_ids = ?collision.key_ids,
                "hash collision detected"
            );
            self.audit.log_event(
                AuditCategory::HashCollision,
                AuditOutcome::Failure,
                json!(collision),
            );
        }

        Ok(CollisionReport {
            scanned,
            collisions,
        })
    }
}

/// Spawn the periodic collision scan. Call this once at startup.
pub fn spawn(detector: Arc<CollisionDetector>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        loop {
            interval.tick().await;
            match detector.scan().await {
                Ok(report) if !report.is_clean() => tracing::warn!(
                    scanned = report.scanned,
                    collisions = report.collisions.len(),
                    "collision scan finished with findings"
                ),
                Ok(report) => tracing::debug!(scanned = report.scanned, "collision scan clean"),
                Err(e) => tracing::error!("collision scan failed: {}", e),
            }
        }
    });
}
