pub mod memory;
pub mod redis;

use async_trait::async_trait;

use crate::models::api_key::ApiKeyRecord;

/// Outcome of `KeyStore::compare_and_set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Written,
    /// The stored revision moved on since the caller read the record.
    Conflict,
    Missing,
}

/// Persistent key storage with a secondary `secret_hash -> id` index.
///
/// Each write must be atomic with respect to its own record and index
/// update. Writers to existing records go through `compare_and_set` (usually
/// via [`modify`]) so concurrent updates are never lost.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn get(&self, id: &str) -> anyhow::Result<Option<ApiKeyRecord>>;

    /// Unconditional upsert, used when a record is created. When
    /// `new_index_hash` is given the index is pointed at `id` for that hash
    /// and the entry for the previously stored hash is removed.
    async fn set(
        &self,
        id: &str,
        record: &ApiKeyRecord,
        new_index_hash: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Write `record` only if the stored copy still has `record.revision`.
    /// The stored copy gets `record.revision + 1`. Index handling matches
    /// `set`.
    async fn compare_and_set(
        &self,
        id: &str,
        record: &ApiKeyRecord,
        new_index_hash: Option<&str>,
    ) -> anyhow::Result<CasOutcome>;

    /// Remove the record and its index entry. Returns whether it existed.
    async fn delete(&self, id: &str) -> anyhow::Result<bool>;

    async fn find_by_hash(&self, hash: &str) -> anyhow::Result<Option<ApiKeyRecord>>;

    async fn list_all(&self) -> anyhow::Result<Vec<ApiKeyRecord>>;
}

/// Attempts `modify` makes before giving up on a contended record.
pub const MAX_WRITE_ATTEMPTS: usize = 8;

/// Result of [`modify`].
#[derive(Debug, Clone, PartialEq)]
pub enum Modified {
    /// The stored record after the write.
    Written(ApiKeyRecord),
    /// `apply` found nothing to change.
    Unchanged(ApiKeyRecord),
    Missing,
}

impl Modified {
    pub fn into_record(self) -> Option<ApiKeyRecord> {
        match self {
            Modified::Written(record) | Modified::Unchanged(record) => Some(record),
            Modified::Missing => None,
        }
    }
}

/// Optimistic read-modify-write of one record. `apply` runs against the
/// freshest stored copy on every attempt and returns whether there is
/// anything to write.
pub async fn modify<F>(
    store: &dyn KeyStore,
    id: &str,
    new_index_hash: Option<&str>,
    mut apply: F,
) -> anyhow::Result<Modified>
where
    F: FnMut(&mut ApiKeyRecord) -> bool + Send,
{
    for _ in 0..MAX_WRITE_ATTEMPTS {
        let Some(mut record) = store.get(id).await? else {
            return Ok(Modified::Missing);
        };
        if !apply(&mut record) {
            return Ok(Modified::Unchanged(record));
        }
        match store.compare_and_set(id, &record, new_index_hash).await? {
            CasOutcome::Written => {
                record.revision += 1;
                return Ok(Modified::Written(record));
            }
            CasOutcome::Conflict => {
                tracing::debug!(key_id = %id, "concurrent write to api key, retrying");
            }
            CasOutcome::Missing => return Ok(Modified::Missing),
        }
    }
    anyhow::bail!(
        "api key {} still contended after {} write attempts",
        id,
        MAX_WRITE_ATTEMPTS
    )
}

pub use memory::MemoryKeyStore;
pub use self::redis::RedisKeyStore;
