use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("secret format invalid")]
    FormatInvalid,

    #[error("api key not found")]
    NotFound,

    #[error("api key disabled")]
    Disabled,

    #[error("api key expired")]
    Expired,

    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("service unavailable")]
    ServiceUnavailable,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Why a credential was rejected. Everything except `Valid` is a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailure {
    FormatInvalid,
    NotFound,
    Disabled,
    Expired,
    AuthorizationFailed,
    ServiceUnavailable,
    InternalError,
}

impl AuthFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthFailure::FormatInvalid => "format_invalid",
            AuthFailure::NotFound => "not_found",
            AuthFailure::Disabled => "disabled",
            AuthFailure::Expired => "expired",
            AuthFailure::AuthorizationFailed => "authorization_failed",
            AuthFailure::ServiceUnavailable => "service_unavailable",
            AuthFailure::InternalError => "internal_error",
        }
    }
}

impl AuthError {
    /// Collapse the error into the rejection reason reported to callers.
    /// Store and crypto failures become `InternalError`, which still denies.
    pub fn failure(&self) -> AuthFailure {
        match self {
            AuthError::FormatInvalid | AuthError::InvalidRequest(_) => AuthFailure::FormatInvalid,
            AuthError::NotFound => AuthFailure::NotFound,
            AuthError::Disabled => AuthFailure::Disabled,
            AuthError::Expired => AuthFailure::Expired,
            AuthError::AuthorizationFailed(_) => AuthFailure::AuthorizationFailed,
            AuthError::ServiceUnavailable => AuthFailure::ServiceUnavailable,
            AuthError::Redis(_) | AuthError::Internal(_) => AuthFailure::InternalError,
        }
    }

    pub fn from_failure(failure: AuthFailure) -> Self {
        match failure {
            AuthFailure::FormatInvalid => AuthError::FormatInvalid,
            AuthFailure::NotFound => AuthError::NotFound,
            AuthFailure::Disabled => AuthError::Disabled,
            AuthFailure::Expired => AuthError::Expired,
            AuthFailure::AuthorizationFailed => {
                AuthError::AuthorizationFailed("authorization failed".into())
            }
            AuthFailure::ServiceUnavailable => AuthError::ServiceUnavailable,
            AuthFailure::InternalError => {
                AuthError::Internal(anyhow::anyhow!("credential validation failed"))
            }
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AuthError::FormatInvalid | AuthError::NotFound => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "invalid_api_key",
                "invalid or missing api key".to_string(),
            ),
            AuthError::Disabled => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "api_key_disabled",
                "api key is disabled".to_string(),
            ),
            AuthError::Expired => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "api_key_expired",
                "api key has expired".to_string(),
            ),
            AuthError::AuthorizationFailed(reason) => {
                tracing::warn!("authorization failed: {}", reason);
                (
                    StatusCode::FORBIDDEN,
                    "permission_error",
                    "authorization_failed",
                    "api key ownership could not be verified".to_string(),
                )
            }
            AuthError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "overloaded_error",
                "auth_unavailable",
                "authentication temporarily unavailable".to_string(),
            ),
            AuthError::InvalidRequest(reason) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "invalid_request",
                reason.clone(),
            ),
            AuthError::Redis(e) => {
                tracing::error!("Redis error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
            AuthError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        let mut response = (status, body).into_response();

        // Tell clients when the full-scan guard will re-evaluate.
        if matches!(self, AuthError::ServiceUnavailable) {
            response.headers_mut().insert(
                "retry-after",
                axum::http::HeaderValue::from_static("60"),
            );
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_failures_are_internal() {
        let err = AuthError::Internal(anyhow::anyhow!("connection reset"));
        assert_eq!(err.failure(), AuthFailure::InternalError);
    }

    #[test]
    fn test_failure_roundtrip_keeps_reason() {
        for failure in [
            AuthFailure::FormatInvalid,
            AuthFailure::NotFound,
            AuthFailure::Disabled,
            AuthFailure::Expired,
            AuthFailure::AuthorizationFailed,
            AuthFailure::ServiceUnavailable,
            AuthFailure::InternalError,
        ] {
            assert_eq!(AuthError::from_failure(failure).failure(), failure);
        }
    }

    #[test]
    fn test_service_unavailable_sets_retry_after() {
        let response = AuthError::ServiceUnavailable.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("retry-after").unwrap(), "60");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AuthError::NotFound.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::AuthorizationFailed("owner conflict".into())
                .into_response()
                .status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AuthError::Internal(anyhow::anyhow!("boom")).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
