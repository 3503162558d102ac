//! Background job: deactivate keys whose `expires_at` has passed.
//!
//! Validation already rejects expired keys on its own; the sweep keeps
//! `is_active` truthful for listings and downstream consumers.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use crate::store::{modify, KeyStore, Modified};

/// Spawn the expiry sweep. Call this once at startup.
pub fn spawn(store: Arc<dyn KeyStore>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = sweep_expired(store.as_ref(), Utc::now()).await {
                tracing::error!("expiry sweep failed: {}", e);
            }
        }
    });
}

/// Mark active keys expired at `now` as inactive. Returns how many changed.
pub async fn sweep_expired(store: &dyn KeyStore, now: DateTime<Utc>) -> anyhow::Result<usize> {
    let mut deactivated = 0;
    for listed in store.list_all().await? {
        if !listed.is_active || !listed.is_expired_at(now) {
            continue;
        }
        let written = modify(store, &listed.id, None, |record| {
            if !record.is_active || !record.is_expired_at(now) {
                return false;
            }
            record.is_active = false;
            record.updated_at = now;
            true
        })
        .await?;
        if matches!(written, Modified::Written(_)) {
            deactivated += 1;
        }
    }

    if deactivated > 0 {
        tracing::info!(keys = deactivated, "deactivated expired api keys");
    }
    Ok(deactivated)
}
