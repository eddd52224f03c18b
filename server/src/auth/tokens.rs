//! Session authority: the access/refresh token pair and the
//! single-active-session check against the cached token identifier.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::cache::{CacheError, TokenIdentityStore};

/// Subject tag carried in the `kind` claim.
pub const KIND_ACCESS: &str = "access";
pub const KIND_REFRESH: &str = "refresh";

/// JWT claims for both token kinds. Refresh tokens additionally carry the
/// unique identifier mirrored in the presence cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    pub sub: String,
    /// "access" or "refresh"
    pub kind: String,
    /// Token identifier (refresh tokens only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
}

#[derive(Debug, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token invalid")]
    Invalid,
    #[error("token expired")]
    Expired,
    #[error("signed in on another device or session expired")]
    Superseded,
    #[error("token store unavailable: {0}")]
    Store(#[from] CacheError),
    #[error("token encoding failed: {0}")]
    Encoding(jsonwebtoken::errors::Error),
}

/// Load or generate the JWT signing key (256-bit random secret).
/// Key is stored as raw bytes in data_dir/jwt_secret.
pub fn load_or_generate_secret(data_dir: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(data_dir)?;
    let key_path = Path::new(data_dir).join("jwt_secret");

    if key_path.exists() {
        let key = std::fs::read(&key_path)?;
        if key.len() == 32 {
            tracing::info!("JWT signing key loaded from {}", key_path.display());
            return Ok(key);
        }
        // Invalid key file — regenerate
        tracing::warn!("JWT key file has wrong size ({}), regenerating", key.len());
    }

    let key: [u8; 32] = rand::rng().random();
    std::fs::write(&key_path, key)?;
    tracing::info!("JWT signing key generated at {}", key_path.display());
    Ok(key.to_vec())
}

/// Issues and validates the token pair, and arbitrates single-active-session
/// by comparing a refresh token's identifier against the cached one.
pub struct SessionAuthority {
    secret: Vec<u8>,
    access_ttl: Duration,
    refresh_ttl: Duration,
    identities: Arc<dyn TokenIdentityStore>,
}

impl SessionAuthority {
    pub fn new(
        secret: Vec<u8>,
        access_ttl_secs: i64,
        refresh_ttl_secs: i64,
        identities: Arc<dyn TokenIdentityStore>,
    ) -> Self {
        Self {
            secret,
            access_ttl: Duration::seconds(access_ttl_secs),
            refresh_ttl: Duration::seconds(refresh_ttl_secs),
            identities,
        }
    }

    fn mint(
        &self,
        user_id: &str,
        kind: &str,
        jti: Option<String>,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            kind: kind.to_string(),
            jti,
            iat: now,
            exp: now + ttl.num_seconds(),
        };

        encode(
            &Header::default(), // HS256
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(AuthError::Encoding)
    }

    /// Issue a fresh pair for a login. The new token identifier overwrites
    /// whatever the cache held, which is what revokes other devices' refresh
    /// capability; their live sockets stay up until they are displaced or
    /// their access token runs out.
    pub async fn issue_tokens(&self, user_id: &str) -> Result<TokenPair, AuthError> {
        let token_id = Uuid::new_v4().to_string();
        let ttl = StdDuration::from_secs(self.refresh_ttl.num_seconds().max(0) as u64);
        self.identities.put_identity(user_id, &token_id, ttl).await?;

        let access_token = self.mint(user_id, KIND_ACCESS, None, self.access_ttl)?;
        let refresh_token = self.mint(user_id, KIND_REFRESH, Some(token_id), self.refresh_ttl)?;

        Ok(TokenPair {
            access_token,
            refresh_token,
        })
    }

    /// Decode and verify a token of the expected kind.
    pub fn decode_claims(&self, token: &str, expected_kind: &str) -> Result<Claims, AuthError> {
        let validation = Validation::new(jsonwebtoken::Algorithm::HS256);
        let data = decode::<Claims>(token, &DecodingKey::from_secret(&self.secret), &validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid,
            })?;

        if data.claims.kind != expected_kind {
            return Err(AuthError::Invalid);
        }
        Ok(data.claims)
    }

    /// Mint a new access token for a well-formed refresh token whose
    /// identifier still matches the cached one. A missing or mismatched
    /// cache entry fails closed: the token was superseded by a newer login
    /// or the session expired. The refresh token and its cached identifier
    /// are left untouched.
    pub async fn refresh(&self, refresh_token: &str) -> Result<String, AuthError> {
        let claims = self.decode_claims(refresh_token, KIND_REFRESH)?;
        let presented = claims.jti.ok_or(AuthError::Invalid)?;

        match self.identities.identity(&claims.sub).await? {
            Some(current) if current == presented => {
                self.mint(&claims.sub, KIND_ACCESS, None, self.access_ttl)
            }
            _ => Err(AuthError::Superseded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory stand-in for the Redis identity store.
    #[derive(Default)]
    struct MemoryIdentities {
        map: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl TokenIdentityStore for MemoryIdentities {
        async fn put_identity(
            &self,
            user_id: &str,
            token_id: &str,
            _ttl: StdDuration,
        ) -> Result<(), CacheError> {
            self.map
                .lock()
                .unwrap()
                .insert(user_id.to_string(), token_id.to_string());
            Ok(())
        }

        async fn identity(&self, user_id: &str) -> Result<Option<String>, CacheError> {
            Ok(self.map.lock().unwrap().get(user_id).cloned())
        }
    }

    fn authority(identities: Arc<MemoryIdentities>) -> SessionAuthority {
        SessionAuthority::new(vec![7u8; 32], 900, 604_800, identities)
    }

    #[tokio::test]
    async fn issue_then_refresh_succeeds() {
        let identities = Arc::new(MemoryIdentities::default());
        let authority = authority(identities);

        let pair = authority.issue_tokens("U001").await.unwrap();
        let access = authority.refresh(&pair.refresh_token).await.unwrap();

        let claims = authority.decode_claims(&access, KIND_ACCESS).unwrap();
        assert_eq!(claims.sub, "U001");
        assert!(claims.jti.is_none());
    }

    #[tokio::test]
    async fn second_login_supersedes_first_refresh_token() {
        let identities = Arc::new(MemoryIdentities::default());
        let authority = authority(identities);

        let device1 = authority.issue_tokens("U001").await.unwrap();
        let device2 = authority.issue_tokens("U001").await.unwrap();

        // The superseded token is well-formed and unexpired but must fail
        // with the specific reason, never an ambiguous rejection.
        let err = authority.refresh(&device1.refresh_token).await.unwrap_err();
        assert!(matches!(err, AuthError::Superseded));

        assert!(authority.refresh(&device2.refresh_token).await.is_ok());
    }

    #[tokio::test]
    async fn refresh_rejects_access_token() {
        let identities = Arc::new(MemoryIdentities::default());
        let authority = authority(identities);

        let pair = authority.issue_tokens("U001").await.unwrap();
        let err = authority.refresh(&pair.access_token).await.unwrap_err();
        assert!(matches!(err, AuthError::Invalid));
    }

    #[tokio::test]
    async fn missing_cache_entry_fails_closed() {
        let identities = Arc::new(MemoryIdentities::default());
        let authority = authority(identities.clone());

        let pair = authority.issue_tokens("U001").await.unwrap();
        identities.map.lock().unwrap().clear();

        let err = authority.refresh(&pair.refresh_token).await.unwrap_err();
        assert!(matches!(err, AuthError::Superseded));
    }

    #[tokio::test]
    async fn refresh_does_not_rotate_identity() {
        let identities = Arc::new(MemoryIdentities::default());
        let authority = authority(identities);

        let pair = authority.issue_tokens("U001").await.unwrap();
        authority.refresh(&pair.refresh_token).await.unwrap();
        // An access-token refresh leaves the refresh token valid.
        assert!(authority.refresh(&pair.refresh_token).await.is_ok());
    }
}
