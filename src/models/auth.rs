use serde::Serialize;

use crate::errors::{AuthError, AuthFailure};
use crate::models::api_key::ApiKeyView;

/// Per-request facts the validator needs besides the secret itself.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Caller identity used for full-scan rate limiting (client IP, etc).
    pub source: String,
}

impl AuthContext {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new("unknown")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum AuthOutcome {
    Valid,
    Invalid(AuthFailure),
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthResult {
    pub outcome: AuthOutcome,
    pub key: Option<ApiKeyView>,
}

impl AuthResult {
    pub fn valid(view: ApiKeyView) -> Self {
        Self {
            outcome: AuthOutcome::Valid,
            key: Some(view),
        }
    }

    pub fn invalid(failure: AuthFailure) -> Self {
        Self {
            outcome: AuthOutcome::Invalid(failure),
            key: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.outcome == AuthOutcome::Valid
    }

    pub fn failure(&self) -> Option<AuthFailure> {
        match self.outcome {
            AuthOutcome::Valid => None,
            AuthOutcome::Invalid(f) => Some(f),
        }
    }

    /// Convert into a `Result`, for callers that want `?` at an HTTP boundary.
    pub fn into_result(self) -> Result<ApiKeyView, AuthError> {
        match (self.outcome, self.key) {
            (AuthOutcome::Valid, Some(view)) => Ok(view),
            (AuthOutcome::Valid, None) => Err(AuthError::Internal(anyhow::anyhow!(
                "valid outcome without key view"
            ))),
            (AuthOutcome::Invalid(failure), _) => Err(AuthError::from_failure(failure)),
        }
    }
}

impl From<Result<ApiKeyView, AuthError>> for AuthResult {
    fn from(result: Result<ApiKeyView, AuthError>) -> Self {
        match result {
            Ok(view) => AuthResult::valid(view),
            Err(e) => AuthResult::invalid(e.failure()),
        }
    }
}
