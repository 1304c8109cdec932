//! Caller identity resolution.
//!
//! Identity issuance proper (OAuth, device flow) happens out-of-band; the
//! orchestrator consumes either a bearer refresh token it minted earlier or
//! a trusted `x-user-id` header from the fronting proxy. Tokens are stored
//! hashed and compared in constant time.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::store::StateStore;
use crate::util::{generate_token, now_ts};

/// Resolved caller of one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: String,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub user_id: String,
    pub expires_at: i64,
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Mint a refresh token for `user_id`. The clear token is returned exactly
/// once; only its hash is persisted.
pub async fn issue_token(store: &StateStore, user_id: &str) -> Result<IssuedToken> {
    store.ensure_user(user_id, user_id).await?;
    let token = generate_token();
    let expires_at = now_ts() + OrchestratorConfig::load().token_ttl_secs;
    store
        .insert_refresh_token(
            &uuid::Uuid::new_v4().to_string(),
            user_id,
            &hash_token(&token),
            expires_at,
        )
        .await?;
    Ok(IssuedToken {
        token,
        user_id: user_id.to_string(),
        expires_at,
    })
}

/// Resolve a bearer token to its user.
pub async fn resolve_bearer(store: &StateStore, token: &str) -> Result<CallerIdentity> {
    let hash = hash_token(token);
    let row = store
        .live_token_by_hash(&hash)
        .await?
        .ok_or_else(|| OrchestratorError::Auth("invalid or expired token".into()))?;
    // The row was fetched by hash; verify the match in constant time anyway
    // so lookups and comparisons cannot drift apart.
    if !bool::from(row.token_hash.as_bytes().ct_eq(hash.as_bytes())) {
        return Err(OrchestratorError::Auth("invalid or expired token".into()));
    }
    Ok(CallerIdentity {
        user_id: row.user_id,
    })
}

/// Resolve a trusted identity header (`x-user-id`) from the fronting proxy.
pub async fn resolve_header(store: &StateStore, user_id: &str) -> Result<CallerIdentity> {
    if user_id.trim().is_empty() {
        return Err(OrchestratorError::Auth("empty user id".into()));
    }
    store.ensure_user(user_id, user_id).await?;
    Ok(CallerIdentity {
        user_id: user_id.to_string(),
    })
}

/// Extract a Bearer token from an Authorization header value.
pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .map(|t| t.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    #[test]
    fn extract_bearer() {
        assert_eq!(extract_bearer_token("Bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer_token("bearer xyz"), Some("xyz"));
        assert_eq!(extract_bearer_token("Basic abc"), None);
    }

    #[test]
    fn hashes_are_stable_and_hex() {
        let h = hash_token("tok");
        assert_eq!(h, hash_token("tok"));
        assert_eq!(h.len(), 64);
    }

    #[tokio::test]
    async fn issue_and_resolve_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path()).await;

        let issued = issue_token(&store, "user-7").await.unwrap();
        let caller = resolve_bearer(&store, &issued.token).await.unwrap();
        assert_eq!(caller.user_id, "user-7");
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path()).await;

        let err = resolve_bearer(&store, "nope").await.unwrap_err();
        assert_eq!(err.kind(), "auth");
    }

    #[tokio::test]
    async fn header_identity_creates_user() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path()).await;

        let caller = resolve_header(&store, "user-9").await.unwrap();
        assert_eq!(caller.user_id, "user-9");
        assert!(store.user_by_id("user-9").await.unwrap().is_some());
        assert!(resolve_header(&store, "  ").await.is_err());
    }
}
