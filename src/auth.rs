use std::sync::Arc;
use std::time::Duration;

use hyper::header::{AUTHORIZATION, COOKIE};
use hyper::HeaderMap;
use moka::future::Cache;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::storage::{Storage, StorageError};

/// Hash a bearer token to its SHA-256 hex digest.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Pull the raw session token out of a request: `Authorization: Bearer ...`
/// first, then an `x-token` cookie.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    let cookies = headers.get(COOKIE).and_then(|v| v.to_str().ok())?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == "x-token" && !value.is_empty()).then(|| value.to_string())
    })
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid or expired token")]
    InvalidToken,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// TTL-based token resolution cache. Only successful resolutions are cached;
/// a token revoked mid-window keeps working until its entry expires.
#[derive(Clone)]
pub struct TokenAuthenticator {
    storage: Arc<dyn Storage>,
    cache: Cache<String, Uuid>,
}

impl TokenAuthenticator {
    pub fn new(storage: Arc<dyn Storage>, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(ttl)
            .build();
        Self { storage, cache }
    }

    /// Resolve a raw bearer token to the paying account.
    pub async fn authenticate(&self, token: &str) -> Result<Uuid, AuthError> {
        let token_hash = hash_token(token);
        if let Some(account_id) = self.cache.get(&token_hash).await {
            return Ok(account_id);
        }

        match self.storage.account_for_token(&token_hash).await? {
            Some(account_id) => {
                self.cache.insert(token_hash, account_id).await;
                Ok(account_id)
            }
            None => Err(AuthError::InvalidToken),
        }
    }
}
