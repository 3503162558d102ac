//! Redis-backed `KeyStore`.
//!
//! Layout:
//! - `{prefix}:{id}`: JSON-encoded `ApiKeyRecord`
//! - `{prefix}:hash_map`: hash of `secret_hash -> id`
//! - `{prefix}:ids`: set of all ids
//!
//! Record and index writes go through Lua scripts so each call is atomic.
//! Conditional writes compare the stored `revision` inside the script.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{CasOutcome, KeyStore};
use crate::models::api_key::ApiKeyRecord;

const DEFAULT_PREFIX: &str = "apikey";

const SET_SCRIPT: &str = r#"
local old = redis.call("GET", KEYS[1])
redis.call("SET", KEYS[1], ARGV[1])
redis.call("SADD", KEYS[3], ARGV[3])
if ARGV[2] ~= "" then
    if old then
        local prev = cjson.decode(old)["secret_hash"]
        if prev and prev ~= ARGV[2] and redis.call("HGET", KEYS[2], prev) == ARGV[3] then
            redis.call("HDEL", KEYS[2], prev)
        end
    end
    redis.call("HSET", KEYS[2], ARGV[2], ARGV[3])
end
return 1
"#;

// Returns -1 when the record is gone, 0 on a revision mismatch, 1 on write.
const CAS_SCRIPT: &str = r#"
local old = redis.call("GET", KEYS[1])
if not old then
    return -1
end
local current = cjson.decode(old)
if (current["revision"] or 0) ~= tonumber(ARGV[4]) then
    return 0
end
redis.call("SET", KEYS[1], ARGV[1])
if ARGV[2] ~= "" then
    local prev = current["secret_hash"]
    if prev and prev ~= ARGV[2] and redis.call("HGET", KEYS[2], prev) == ARGV[3] then
        redis.call("HDEL", KEYS[2], prev)
    end
    redis.call("HSET", KEYS[2], ARGV[2], ARGV[3])
end
return 1
"#;

const DELETE_SCRIPT: &str = r#"
local old = redis.call("GET", KEYS[1])
if not old then
    return 0
end
local prev = cjson.decode(old)["secret_hash"]
if prev and redis.call("HGET", KEYS[2], prev) == ARGV[1] then
    redis.call("HDEL", KEYS[2], prev)
end
redis.call("DEL", KEYS[1])
redis.call("SREM", KEYS[3], ARGV[1])
return 1
"#;

#[derive(Clone)]
pub struct RedisKeyStore {
    redis: ConnectionManager,
    prefix: String,
}

impl RedisKeyStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self::with_prefix(redis, DEFAULT_PREFIX)
    }

    pub fn with_prefix(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
        }
    }

    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }

    fn record_key(&self, id: &str) -> String {
        format!("{}:{}", self.prefix, id)
    }

    fn index_key(&self) -> String {
        format!("{}:hash_map", self.prefix)
    }

    fn ids_key(&self) -> String {
        format!("{}:ids", self.prefix)
    }

    fn decode(id: &str, raw: &str) -> anyhow::Result<ApiKeyRecord> {
        serde_json::from_str(raw)
            .map_err(|e| anyhow::anyhow!("corrupt api key record {}: {}", id, e))
    }
}

#[async_trait]
impl KeyStore for RedisKeyStore {
    async fn get(&self, id: &str) -> anyhow::Result<Option<ApiKeyRecord>> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(self.record_key(id)).await?;
        raw.map(|r| Self::decode(id, &r)).transpose()
    }

    async fn set(
        &self,
        id: &str,
        record: &ApiKeyRecord,
        new_index_hash: Option<&str>,
    ) -> anyhow::Result<()> {
        let json = serde_json::to_string(record)?;
        let mut conn = self.redis.clone();
        let script = redis::Script::new(SET_SCRIPT);
        let _: i64 = script
            .key(self.record_key(id))
            .key(self.index_key())
            .key(self.ids_key())
            .arg(json)
            .arg(new_index_hash.unwrap_or(""))
            .arg(id)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        id: &str,
        record: &ApiKeyRecord,
        new_index_hash: Option<&str>,
    ) -> anyhow::Result<CasOutcome> {
        let expected = record.revision;
        let mut next = record.clone();
        next.revision = expected + 1;
        let json = serde_json::to_string(&next)?;

        let mut conn = self.redis.clone();
        let script = redis::Script::new(CAS_SCRIPT);
        let written: i64 = script
            .key(self.record_key(id))
            .key(self.index_key())
            .arg(json)
            .arg(new_index_hash.unwrap_or(""))
            .arg(id)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(match written {
            1 => CasOutcome::Written,
            0 => CasOutcome::Conflict,
            _ => CasOutcome::Missing,
        })
    }

    async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let mut conn = self.redis.clone();
        let script = redis::Script::new(DELETE_SCRIPT);
        let removed: i64 = script
            .key(self.record_key(id))
            .key(self.index_key())
            .key(self.ids_key())
            .arg(id)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn find_by_hash(&self, hash: &str) -> anyhow::Result<Option<ApiKeyRecord>> {
        let mut conn = self.redis.clone();
        let id: Option<String> = conn.hget(self.index_key(), hash).await?;
        match id {
            Some(id) => self.get(&id).await,
            None => Ok(None),
        }
    }

    async fn list_all(&self) -> anyhow::Result<Vec<ApiKeyRecord>> {
        let mut conn = self.redis.clone();
        let mut ids: Vec<String> = conn.smembers(self.ids_key()).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        ids.sort();
        let keys: Vec<String> = ids.iter().map(|id| self.record_key(id)).collect();
        let raws: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut records = Vec::with_capacity(raws.len());
        for (id, raw) in ids.iter().zip(raws) {
            match raw.map(|r| Self::decode(id, &r)) {
                Some(Ok(record)) => records.push(record),
                Some(Err(e)) => tracing::warn!("skipping unreadable record: {}", e),
                None => {}
            }
        }
        Ok(records)
    }
}
