//! Axum middleware that authenticates a request by API key.
//!
//! Install with `axum::middleware::from_fn_with_state(service, require_api_key)`.
//! On success the key's `ApiKeyView` is available to handlers through
//! `Extension<ApiKeyView>`.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::crypto::secret::mask;
use crate::errors::AuthError;
use crate::models::auth::AuthContext;
use crate::service::ApiKeyService;

pub async fn require_api_key(
    State(service): State<Arc<ApiKeyService>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let Some(secret) = extract_secret(req.headers()) else {
        tracing::warn!("request without api key");
        return Err(AuthError::FormatInvalid);
    };
    let ctx = AuthContext::new(client_source(req.headers()));

    let view = match service.validate(&secret, &ctx).await.into_result() {
        Ok(view) => view,
        Err(e) => {
            // SECURITY: never log the full secret
            tracing::warn!(
                source = %ctx.source,
                key = %mask(&secret),
                "api key rejected: {}",
                e
            );
            return Err(e);
        }
    };

    req.extensions_mut().insert(view);
    Ok(next.run(req).await)
}

/// `x-api-key`, falling back to `Authorization: Bearer`.
pub fn extract_secret(headers: &HeaderMap) -> Option<Zeroizing<String>> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Zeroizing::new(s.to_string()))
}

/// First hop of `x-forwarded-for`, else `unknown`.
pub fn client_source(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_prefers_x_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-from-header"));
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-from-bearer"));
        assert_eq!(extract_secret(&headers).unwrap().as_str(), "sk-from-header");
    }

    #[test]
    fn test_extract_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer  sk-abc "));
        assert_eq!(extract_secret(&headers).unwrap().as_str(), "sk-abc");

        headers.insert("authorization", HeaderValue::from_static("Basic dXNlcg=="));
        assert!(extract_secret(&headers).is_none());
    }

    #[test]
    fn test_client_source() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_source(&headers), "unknown");
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(client_source(&headers), "203.0.113.7");
    }
}
