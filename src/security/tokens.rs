//! Access/refresh token issuance.
//!
//! Access tokens are HS256 JWTs with a short TTL and are never stored.
//! Refresh tokens are opaque random values persisted through a
//! [`RefreshTokenStore`]; issuing one for a principal replaces the previous
//! one, so a principal has a single live session. A second login from
//! another device invalidates the first device's refresh token.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::security::refresh_store::{RefreshTokenStore, StoredRefreshToken};

pub const ACCESS_KIND: &str = "access";

/// Why an access token was refused. Callers refresh only on `Expired`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("access token expired")]
    Expired,
    #[error("invalid access token: {0}")]
    Invalid(String),
}

impl TokenError {
    /// Machine-readable code returned to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            TokenError::Expired => "TOKEN_EXPIRED",
            TokenError::Invalid(_) => "TOKEN_INVALID",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessClaims {
    pub sub: String,
    pub kind: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Refresh token expiry.
    pub expiry: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
    store: Arc<dyn RefreshTokenStore>,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    pub fn new(
        signing_secret: &[u8],
        access_ttl: Duration,
        refresh_ttl: Duration,
        store: Arc<dyn RefreshTokenStore>,
    ) -> Self {
        Self {
            encoding: EncodingKey::from_secret(signing_secret),
            decoding: DecodingKey::from_secret(signing_secret),
            access_ttl,
            refresh_ttl,
            store,
        }
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn issue_access(&self, principal_id: &str) -> anyhow::Result<String> {
        self.issue_access_at(principal_id, Utc::now())
    }

    fn issue_access_at(&self, principal_id: &str, now: DateTime<Utc>) -> anyhow::Result<String> {
        let exp = expiry_after(now, self.access_ttl)?;
        let claims = AccessClaims {
            sub: principal_id.to_string(),
            kind: ACCESS_KIND.to_string(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    pub fn verify_access(&self, token: &str) -> Result<AccessClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.algorithms = vec![Algorithm::HS256];
        let data = decode::<AccessClaims>(token, &self.decoding, &validation)
            .map_err(map_jwt_error)?;
        if data.claims.kind != ACCESS_KIND {
            return Err(TokenError::Invalid("wrong token kind".to_string()));
        }
        Ok(data.claims)
    }

    pub async fn issue_refresh(
        &self,
        principal_id: &str,
    ) -> anyhow::Result<(String, DateTime<Utc>)> {
        let token = random_token();
        let expires_at = expiry_after(Utc::now(), self.refresh_ttl)?;
        self.store
            .upsert(StoredRefreshToken {
                principal_id: principal_id.to_string(),
                token: token.clone(),
                expires_at,
            })
            .await?;
        debug!(principal_id, "refresh token stored");
        Ok((token, expires_at))
    }

    /// Access + refresh pair, as returned by login and refresh.
    pub async fn issue_pair(&self, principal_id: &str) -> anyhow::Result<TokenPair> {
        let access_token = self.issue_access(principal_id)?;
        let (refresh_token, expiry) = self.issue_refresh(principal_id).await?;
        Ok(TokenPair {
            access_token,
            refresh_token,
            expiry,
        })
    }

    /// Principal owning `token` if it is stored and unexpired.
    pub async fn validate_refresh(&self, token: &str) -> anyhow::Result<Option<String>> {
        if token.is_empty() {
            return Ok(None);
        }
        let record = self.store.find_by_token(token).await?;
        Ok(record
            .filter(|r| r.expires_at > Utc::now())
            .map(|r| r.principal_id))
    }

    /// Validate and rotate in one step. `None` means the caller must log in again.
    pub async fn rotate(&self, refresh_token: &str) -> anyhow::Result<Option<(String, TokenPair)>> {
        match self.validate_refresh(refresh_token).await? {
            Some(principal) => {
                let pair = self.issue_pair(&principal).await?;
                Ok(Some((principal, pair)))
            }
            None => Ok(None),
        }
    }

    pub async fn revoke(&self, principal_id: &str) -> anyhow::Result<bool> {
        self.store.delete(principal_id).await
    }
}

fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> anyhow::Result<DateTime<Utc>> {
    ChronoDuration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| anyhow::anyhow!("token ttl of {}s is out of range", ttl.as_secs()))
}

fn random_token() -> String {
    let mut bytes = [0u8; 48];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> TokenError {
    use jsonwebtoken::errors::ErrorKind;

    match err.kind() {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        ErrorKind::InvalidSignature => TokenError::Invalid("bad signature".to_string()),
        ErrorKind::InvalidAlgorithm => TokenError::Invalid("unsupported algorithm".to_string()),
        ErrorKind::InvalidToken => TokenError::Invalid("malformed token".to_string()),
        ErrorKind::Base64(_) => TokenError::Invalid("invalid base64 encoding".to_string()),
        ErrorKind::Json(_) => TokenError::Invalid("invalid claims".to_string()),
        _ => TokenError::Invalid(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::refresh_store::InMemoryRefreshStore;

    fn issuer_with(store: InMemoryRefreshStore) -> TokenIssuer {
        TokenIssuer::new(
            b"test-signing-secret",
            Duration::from_secs(900),
            Duration::from_secs(7 * 24 * 3600),
            Arc::new(store),
        )
    }

    fn issuer() -> TokenIssuer {
        issuer_with(InMemoryRefreshStore::new())
    }

    #[test]
    fn access_token_round_trip() {
        let issuer = issuer();
        let token = issuer.issue_access("user-7").unwrap();
        let claims = issuer.verify_access(&token).unwrap();
        assert_eq!(claims.sub, "user-7");
        assert_eq!(claims.kind, ACCESS_KIND);
        assert_eq!(claims.exp - claims.iat, 900);
    }

    #[test]
    fn expired_access_token_is_distinguished() {
        let issuer = issuer();
        let long_ago = Utc::now() - ChronoDuration::hours(1);
        let token = issuer.issue_access_at("user-7", long_ago).unwrap();
        assert_eq!(issuer.verify_access(&token), Err(TokenError::Expired));
        assert_eq!(TokenError::Expired.code(), "TOKEN_EXPIRED");
    }

    #[test]
    fn malformed_and_foreign_tokens_are_invalid() {
        let issuer = issuer();
        let err = issuer.verify_access("not-a-jwt").unwrap_err();
        assert!(matches!(err, TokenError::Invalid(_)));
        assert_eq!(err.code(), "TOKEN_INVALID");

        let other = TokenIssuer::new(
            b"another-secret",
            Duration::from_secs(900),
            Duration::from_secs(60),
            Arc::new(InMemoryRefreshStore::new()),
        );
        let foreign = other.issue_access("user-7").unwrap();
        assert!(matches!(
            issuer.verify_access(&foreign),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn wrong_kind_is_invalid() {
        let issuer = issuer();
        let claims = AccessClaims {
            sub: "user-7".to_string(),
            kind: "refresh".to_string(),
            iat: Utc::now().timestamp(),
            exp: Utc::now().timestamp() + 600,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &issuer.encoding).unwrap();
        assert!(matches!(
            issuer.verify_access(&token),
            Err(TokenError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn refresh_tokens_are_single_per_principal() {
        let issuer = issuer();
        let (first, _) = issuer.issue_refresh("user-1").await.unwrap();
        let (second, expiry) = issuer.issue_refresh("user-1").await.unwrap();

        assert_ne!(first, second);
        assert_eq!(second.len(), 96);
        assert!(expiry > Utc::now() + ChronoDuration::days(6));
        assert_eq!(issuer.validate_refresh(&first).await.unwrap(), None);
        assert_eq!(
            issuer.validate_refresh(&second).await.unwrap().as_deref(),
            Some("user-1")
        );
    }

    #[tokio::test]
    async fn expired_refresh_token_is_rejected() {
        let store = InMemoryRefreshStore::new();
        store
            .upsert(StoredRefreshToken {
                principal_id: "user-1".to_string(),
                token: "stale".to_string(),
                expires_at: Utc::now() - ChronoDuration::seconds(1),
            })
            .await
            .unwrap();
        let issuer = issuer_with(store);
        assert_eq!(issuer.validate_refresh("stale").await.unwrap(), None);
        assert_eq!(issuer.validate_refresh("").await.unwrap(), None);
    }

    #[tokio::test]
    async fn rotate_invalidates_presented_token() {
        let issuer = issuer();
        let pair = issuer.issue_pair("user-3").await.unwrap();
        let (principal, rotated) = issuer.rotate(&pair.refresh_token).await.unwrap().unwrap();
        assert_eq!(principal, "user-3");
        assert_ne!(rotated.refresh_token, pair.refresh_token);
        assert!(issuer.rotate(&pair.refresh_token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn revoke_ends_session() {
        let issuer = issuer();
        let pair = issuer.issue_pair("user-4").await.unwrap();
        assert!(issuer.revoke("user-4").await.unwrap());
        assert_eq!(issuer.validate_refresh(&pair.refresh_token).await.unwrap(), None);
        assert!(!issuer.revoke("user-4").await.unwrap());
    }

    #[tokio::test]
    async fn out_of_range_ttl_is_an_error_not_a_panic() {
        let huge = Duration::from_secs(10_000_000_000_000);
        let issuer = TokenIssuer::new(
            b"test-signing-secret",
            huge,
            huge,
            Arc::new(InMemoryRefreshStore::new()),
        );
        assert!(issuer.issue_refresh("user-5").await.is_err());
        assert!(issuer.issue_access("user-5").is_err());
        assert!(issuer.issue_pair("user-5").await.is_err());
    }
}
