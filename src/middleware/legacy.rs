//! Adoption of pre-`owner` ownership fields.
//!
//! Keys issued by the old schema only carry `user_id` / `user_username`. Those
//! values were never validated, so they are treated as untrusted input: a key
//! is only granted a canonical owner after the identifier passes screening and
//! (when a directory is configured) the user is known to be active. Any failure
//! rejects the whole validation.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::sync::Arc;

use crate::directory::UserDirectory;
use crate::errors::AuthError;
use crate::middleware::audit::{AuditCategory, AuditOutcome, SecurityAudit};
use crate::models::api_key::{ApiKeyRecord, Owner};
use crate::models::auth::AuthContext;

pub const MAX_IDENTIFIER_LEN: usize = 128;

const RESERVED_NAMES: &[&str] = &["admin", "administrator", "root", "system", "superuser"];

// Markup delimiters, path traversal, scheme separators, control characters.
static FORBIDDEN_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)([<>"'`]|\.\.|[/\\]|://|javascript:|data:|[\x00-\x1f\x7f])"#)
        .expect("static pattern compiles")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeOutcome {
    /// Nothing to adopt, or the record already converged.
    Unchanged,
    /// `owner` was populated from legacy fields; the record must be persisted.
    Normalized,
}

/// Why an identifier was refused. Reported in audit details only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierRejection {
    Empty,
    TooLong,
    ForbiddenCharacters,
    Reserved,
}

impl IdentifierRejection {
    fn as_str(&self) -> &'static str {
        match self {
            IdentifierRejection::Empty => "empty",
            IdentifierRejection::TooLong => "too_long",
            IdentifierRejection::ForbiddenCharacters => "forbidden_characters",
            IdentifierRejection::Reserved => "reserved_name",
        }
    }
}

/// Screen a legacy identifier before it is trusted as an owner.
pub fn check_identifier(identifier: &str) -> Result<(), IdentifierRejection> {
    if identifier.trim().is_empty() {
        return Err(IdentifierRejection::Empty);
    }
    if identifier.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(IdentifierRejection::TooLong);
    }
    if FORBIDDEN_PATTERN.is_match(identifier) || identifier.chars().any(char::is_control) {
        return Err(IdentifierRejection::ForbiddenCharacters);
    }
    let lowered = identifier.trim().to_ascii_lowercase();
    if RESERVED_NAMES.contains(&lowered.as_str()) {
        return Err(IdentifierRejection::Reserved);
    }
    Ok(())
}

pub struct LegacyDataAdapter {
    audit: Arc<dyn SecurityAudit>,
    directory: Option<Arc<dyn UserDirectory>>,
}

impl LegacyDataAdapter {
    pub fn new(audit: Arc<dyn SecurityAudit>, directory: Option<Arc<dyn UserDirectory>>) -> Self {
        Self { audit, directory }
    }

    /// Fold legacy ownership into `owner`, or reject the key.
    pub async fn normalize(
        &self,
        record: &mut ApiKeyRecord,
        ctx: &AuthContext,
    ) -> Result<NormalizeOutcome, AuthError> {
        let Some(identifier) = record.legacy.identifier().map(str::to_owned) else {
            return Ok(NormalizeOutcome::Unchanged);
        };

        if let Some(owner) = &record.owner {
            let matches_legacy = [&record.legacy.user_id, &record.legacy.user_username]
                .into_iter()
                .flatten()
                .any(|legacy| legacy == &owner.owner);
            if matches_legacy {
                return Ok(NormalizeOutcome::Unchanged);
            }
            self.reject(record, ctx, "owner_conflict");
            return Err(AuthError::AuthorizationFailed(
                "legacy owner conflicts with canonical owner".into(),
            ));
        }

        if let Err(rejection) = check_identifier(&identifier) {
            self.reject(record, ctx, rejection.as_str());
            return Err(AuthError::AuthorizationFailed(format!(
                "legacy owner rejected: {}",
                rejection.as_str()
            )));
        }

        if let Some(directory) = &self.directory {
            match directory.is_user_active(&identifier).await {
                Ok(true) => {}
                Ok(false) => {
                    self.reject(record, ctx, "user_inactive");
                    return Err(AuthError::AuthorizationFailed(
                        "legacy owner is not an active user".into(),
                    ));
                }
                Err(e) => {
                    tracing::error!(key_id = %record.id, "user directory lookup failed: {}", e);
                    self.reject(record, ctx, "directory_unavailable");
                    return Err(AuthError::AuthorizationFailed(
                        "user directory unavailable".into(),
                    ));
                }
            }
        }

        record.owner = Some(Owner::user(identifier.clone()));
        self.audit.log_event(
            AuditCategory::LegacyOwnership,
            AuditOutcome::Success,
            json!({
                "key_id": record.id,
                "owner": identifier,
                "source": ctx.source,
            }),
        );
        tracing::info!(key_id = %record.id, "adopted legacy ownership");
        Ok(NormalizeOutcome::Normalized)
    }

    fn reject(&self, record: &ApiKeyRecord, ctx: &AuthContext, reason: &str) {
        tracing::warn!(key_id = %record.id, reason = reason, "legacy ownership rejected");
        self.audit.log_event(
            AuditCategory::LegacyOwnership,
            AuditOutcome::Blocked,
            json!({
                "key_id": record.id,
                "reason": reason,
                "source": ctx.source,
            }),
        );
    }
}
