//! Request authentication
//!
//! API callers authenticate with a bearer API key; only the SHA-256 hash of
//! the key is stored, so lookup hashes the presented key and matches on the
//! digest. Admin endpoints use a separate shared token compared in constant
//! time.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use promptmeter_shared::User;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Hash an API key for storage or lookup.
pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
}

/// Resolve the caller from the `Authorization: Bearer` header.
pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> ApiResult<User> {
    let key = bearer_token(headers)
        .ok_or_else(|| ApiError::Unauthorized("Missing API key".to_string()))?;

    let user = state
        .billing
        .store
        .find_user_by_api_key_hash(&hash_api_key(key))
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Invalid API key".to_string()))?;

    Ok(user)
}

/// Require the shared admin token on the `x-admin-token` header.
pub fn require_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let presented = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("Missing admin token".to_string()))?;

    let expected = state.config.admin_token.as_bytes();
    if presented.as_bytes().ct_eq(expected).into() {
        Ok(())
    } else {
        Err(ApiError::Unauthorized("Invalid admin token".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_and_hex() {
        let a = hash_api_key("pm_live_abc123");
        let b = hash_api_key("pm_live_abc123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_distinct_keys_distinct_hashes() {
        assert_ne!(hash_api_key("key-a"), hash_api_key("key-b"));
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer pm_live_xyz".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers), Some("pm_live_xyz"));

        headers.insert(axum::http::header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(bearer_token(&headers).is_none());

        headers.insert(axum::http::header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
    }
}
