//! Bearer-key authentication

use super::ApiError;
use crate::storage::keys::KeyStore;
use axum::http::{header, HeaderMap};
use std::sync::Arc;

/// Extract the credential from `Authorization: Bearer <key>`
pub fn bearer_token(headers: &HeaderMap) -> Result<String, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(ApiError::Unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| ApiError::Unauthorized("Invalid Authorization header"))?;

    let (scheme, token) = value.split_once(' ').unwrap_or((value, ""));
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(ApiError::Unauthorized("Invalid Authorization header"));
    }
    Ok(token.to_string())
}

/// Id of the active key presenting the request
pub async fn authorize(keys: &Arc<dyn KeyStore>, headers: &HeaderMap) -> Result<i64, ApiError> {
    let token = bearer_token(headers)?;
    let keys = keys.clone();
    let found = tokio::task::spawn_blocking(move || keys.validate(&token))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    found.ok_or(ApiError::Forbidden)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        map
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token(&headers("Bearer llm-abc")).unwrap(), "llm-abc");
        assert_eq!(bearer_token(&headers("bearer   llm-abc ")).unwrap(), "llm-abc");

        assert!(matches!(bearer_token(&HeaderMap::new()), Err(ApiError::Unauthorized(_))));
        assert!(matches!(bearer_token(&headers("Basic xyz")), Err(ApiError::Unauthorized(_))));
        assert!(matches!(bearer_token(&headers("Bearer")), Err(ApiError::Unauthorized(_))));
    }
}
