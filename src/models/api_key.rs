use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Kind of principal that owns a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
    User,
    Admin,
    Service,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub owner: String,
    pub owner_type: OwnerType,
}

impl Owner {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            owner: id.into(),
            owner_type: OwnerType::User,
        }
    }
}

/// Ownership fields written by the pre-`owner` schema. Kept so old rows can
/// still be read; `LegacyDataAdapter` folds them into `owner` on first use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyOwnership {
    #[serde(default, alias = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, alias = "userUsername", skip_serializing_if = "Option::is_none")]
    pub user_username: Option<String>,
}

impl LegacyOwnership {
    /// The identifier the legacy schema treated as the owner.
    pub fn identifier(&self) -> Option<&str> {
        self.user_id.as_deref().or(self.user_username.as_deref())
    }
}

/// Numeric limits enforced by the gateway. Zero means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyLimits {
    #[serde(default)]
    pub token_limit: u64,
    #[serde(default)]
    pub concurrency_limit: u32,
    #[serde(default)]
    pub rate_limit_window_secs: u64,
    #[serde(default)]
    pub rate_limit_requests: u64,
    #[serde(default)]
    pub daily_cost_limit: f64,
}

/// Persisted API key. `secret_hash` is the only form of the secret kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub secret_hash: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub limits: KeyLimits,
    pub is_active: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub owner: Option<Owner>,
    #[serde(flatten)]
    pub legacy: LegacyOwnership,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every conditional write.
    #[serde(default)]
    pub revision: u64,
}

impl ApiKeyRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn view(&self) -> ApiKeyView {
        ApiKeyView::from(self)
    }
}

/// Read-only projection handed to callers. Never carries the hash.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiKeyView {
    pub id: String,
    pub name: String,
    pub description: String,
    pub limits: KeyLimits,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub owner: Option<Owner>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl From<&ApiKeyRecord> for ApiKeyView {
    fn from(record: &ApiKeyRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            limits: record.limits.clone(),
            is_active: record.is_active,
            expires_at: record.expires_at,
            owner: record.owner.clone(),
            tags: record.tags.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            last_used_at: record.last_used_at,
        }
    }
}

/// Options accepted when issuing a new key.
#[derive(Debug, Clone, Deserialize)]
pub struct NewKeyOptions {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub limits: KeyLimits,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub owner: Option<Owner>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl NewKeyOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            limits: KeyLimits::default(),
            expires_at: None,
            owner: None,
            tags: Vec::new(),
            is_active: true,
        }
    }
}

/// Partial update. `expires_at: Some(None)` clears the expiry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeyPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub limits: Option<KeyLimits>,
    pub is_active: Option<bool>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
    pub tags: Option<Vec<String>>,
}

impl KeyPatch {
    pub fn apply(self, record: &mut ApiKeyRecord, now: DateTime<Utc>) {
        if let Some(name) = self.name {
            record.name = name;
        }
        if let Some(description) = self.description {
            record.description = description;
        }
        if let Some(limits) = self.limits {
            record.limits = limits;
        }
        if let Some(active) = self.is_active {
            record.is_active = active;
        }
        if let Some(expires_at) = self.expires_at {
            record.expires_at = expires_at;
        }
        if let Some(tags) = self.tags {
            record.tags = tags;
        }
        record.updated_at = now;
    }
}

/// Result of key issuance. The plaintext secret exists only here.
pub struct GeneratedKey {
    pub id: String,
    pub plaintext_secret: Zeroizing<String>,
    pub view: ApiKeyView,
}

impl std::fmt::Debug for GeneratedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedKey")
            .field("id", &self.id)
            .field("plaintext_secret", &"[REDACTED]")
            .field("view", &self.view)
            .finish()
    }
}

/// Token counts reported by the relay after an upstream call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_create_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
}

impl TokenCounts {
    pub fn total(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.cache_create_tokens)
            .saturating_add(self.cache_read_tokens)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub tokens: TokenCounts,
    pub model: String,
    #[serde(default)]
    pub account_id: Option<String>,
}
