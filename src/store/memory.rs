use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use super::{CasOutcome, KeyStore};
use crate::models::api_key::ApiKeyRecord;

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<String, ApiKeyRecord>,
    index: HashMap<String, String>,
}

impl Tables {
    fn put(&mut self, id: &str, record: ApiKeyRecord, new_index_hash: Option<&str>) {
        let previous = self.records.insert(id.to_string(), record);

        if let Some(hash) = new_index_hash {
            if let Some(prev) = previous {
                if prev.secret_hash != hash
                    && self.index.get(&prev.secret_hash).map(String::as_str) == Some(id)
                {
                    self.index.remove(&prev.secret_hash);
                }
            }
            self.index.insert(hash.to_string(), id.to_string());
        }
    }
}

/// Per-operation call counts, so tests can assert which paths touched storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub gets: usize,
    pub sets: usize,
    pub hash_lookups: usize,
    pub list_alls: usize,
}

impl StoreStats {
    pub fn lookups(&self) -> usize {
        self.gets + self.hash_lookups + self.list_alls
    }
}

/// In-process `KeyStore`. Records and index share one lock so every `set`
/// is atomic.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    tables: RwLock<Tables>,
    gets: AtomicUsize,
    sets: AtomicUsize,
    hash_lookups: AtomicUsize,
    list_alls: AtomicUsize,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            gets: self.gets.load(Ordering::SeqCst),
            sets: self.sets.load(Ordering::SeqCst),
            hash_lookups: self.hash_lookups.load(Ordering::SeqCst),
            list_alls: self.list_alls.load(Ordering::SeqCst),
        }
    }

    /// Number of index entries (for consistency checks in tests).
    pub fn index_len(&self) -> usize {
        self.read().map(|t| t.index.len()).unwrap_or(0)
    }

    fn read(&self) -> anyhow::Result<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| anyhow::anyhow!("memory key store lock poisoned"))
    }

    fn write(&self) -> anyhow::Result<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| anyhow::anyhow!("memory key store lock poisoned"))
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn get(&self, id: &str) -> anyhow::Result<Option<ApiKeyRecord>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.read()?.records.get(id).cloned())
    }

    async fn set(
        &self,
        id: &str,
        record: &ApiKeyRecord,
        new_index_hash: Option<&str>,
    ) -> anyhow::Result<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.write()?;
        tables.put(id, record.clone(), new_index_hash);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        id: &str,
        record: &ApiKeyRecord,
        new_index_hash: Option<&str>,
    ) -> anyhow::Result<CasOutcome> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.write()?;
        match tables.records.get(id) {
            None => return Ok(CasOutcome::Missing),
            Some(stored) if stored.revision != record.revision => {
                return Ok(CasOutcome::Conflict)
            }
            Some(_) => {}
        }
        let mut next = record.clone();
        next.revision += 1;
        tables.put(id, next, new_index_hash);
        Ok(CasOutcome::Written)
    }

    async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let mut tables = self.write()?;
        let Some(removed) = tables.records.remove(id) else {
            return Ok(false);
        };
        if tables.index.get(&removed.secret_hash).map(String::as_str) == Some(id) {
            tables.index.remove(&removed.secret_hash);
        }
        Ok(true)
    }

    async fn find_by_hash(&self, hash: &str) -> anyhow::Result<Option<ApiKeyRecord>> {
        self.hash_lookups.fetch_add(1, Ordering::SeqCst);
        let tables = self.read()?;
        Ok(tables
            .index
            .get(hash)
            .and_then(|id| tables.records.get(id))
            .cloned())
    }

    async fn list_all(&self) -> anyhow::Result<Vec<ApiKeyRecord>> {
        self.list_alls.fetch_add(1, Ordering::SeqCst);
        let tables = self.read()?;
        let mut records: Vec<ApiKeyRecord> = tables.records.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }
}
