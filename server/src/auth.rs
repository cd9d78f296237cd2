use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::state::{current_unix_millis, ServerState};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds until the access token expires
    pub expires_in: u64,
    pub user: UserProfile,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("access token invalid or expired")]
    InvalidAccessToken,
    #[error("refresh token invalid or already used")]
    InvalidRefreshToken,
}

#[derive(Debug, Clone)]
struct AccessGrant {
    user: UserProfile,
    expires_at_ms: u64,
}

/// Issues guest sessions and rotates refresh tokens.
///
/// Only SHA-256 digests of tokens are kept, never the tokens themselves.
#[derive(Clone)]
pub struct TokenIssuer {
    access: Arc<DashMap<String, AccessGrant>>,
    refresh: Arc<DashMap<String, UserProfile>>,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(ttl: Duration) -> Self {
        Self {
            access: Arc::new(DashMap::new()),
            refresh: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn issue_guest(&self, display_name: Option<&str>) -> TokenResponse {
        let user_id = Uuid::new_v4();
        let display_name = display_name
            .and_then(ServerState::sanitize_display_name)
            .unwrap_or_else(|| format!("Guest {}", &user_id.to_string()[..8]));
        let user = UserProfile {
            user_id,
            display_name,
        };
        tracing::info!("Issued guest session for {}", user.user_id);
        self.issue(user, current_unix_millis())
    }

    /// Exchange a refresh token for a new pair; the old refresh token stops working.
    pub fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        self.refresh_at(refresh_token, current_unix_millis())
    }

    fn refresh_at(&self, refresh_token: &str, now_ms: u64) -> Result<TokenResponse, AuthError> {
        let (_, user) = self
            .refresh
            .remove(&hash_token(refresh_token))
            .ok_or(AuthError::InvalidRefreshToken)?;
        tracing::debug!("Rotated refresh token for {}", user.user_id);
        Ok(self.issue(user, now_ms))
    }

    pub fn verify(&self, access_token: &str) -> Result<UserProfile, AuthError> {
        self.verify_at(access_token, current_unix_millis())
    }

    fn verify_at(&self, access_token: &str, now_ms: u64) -> Result<UserProfile, AuthError> {
        let key = hash_token(access_token);
        let grant = self
            .access
            .get(&key)
            .map(|grant| grant.clone())
            .ok_or(AuthError::InvalidAccessToken)?;
        if grant.expires_at_ms <= now_ms {
            self.access.remove(&key);
            return Err(AuthError::InvalidAccessToken);
        }
        Ok(grant.user)
    }

    fn issue(&self, user: UserProfile, now_ms: u64) -> TokenResponse {
        let access_token = Uuid::new_v4().simple().to_string();
        let refresh_token = Uuid::new_v4().simple().to_string();
        let expires_at_ms = now_ms + self.ttl.as_millis() as u64;

        self.access.retain(|_, grant| grant.expires_at_ms > now_ms);
        self.access.insert(
            hash_token(&access_token),
            AccessGrant {
                user: user.clone(),
                expires_at_ms,
            },
        );
        self.refresh.insert(hash_token(&refresh_token), user.clone());

        TokenResponse {
            access_token,
            refresh_token,
            expires_in: self.ttl.as_secs(),
            user,
        }
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header value
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    header
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MissingToken)
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_token_expires() {
        let issuer = TokenIssuer::new(Duration::from_secs(60));
        let pair = issuer.issue(
            UserProfile {
                user_id: Uuid::new_v4(),
                display_name: "Ana".into(),
            },
            1_000,
        );
        assert_eq!(pair.expires_in, 60);
        assert!(issuer.verify_at(&pair.access_token, 30_000).is_ok());
        assert_eq!(
            issuer.verify_at(&pair.access_token, 61_000),
            Err(AuthError::InvalidAccessToken)
        );
    }

    #[test]
    fn refresh_rotates_tokens() {
        let issuer = TokenIssuer::new(Duration::from_secs(60));
        let first = issuer.issue_guest(Some("Bea"));
        let second = issuer.refresh(&first.refresh_token).unwrap();
        assert_eq!(second.user, first.user);
        assert_ne!(second.access_token, first.access_token);
        assert_eq!(
            issuer.refresh(&first.refresh_token).unwrap_err(),
            AuthError::InvalidRefreshToken
        );
        assert!(issuer.refresh(&second.refresh_token).is_ok());
    }

    #[test]
    fn guest_names_fall_back() {
        let issuer = TokenIssuer::new(Duration::from_secs(60));
        let pair = issuer.issue_guest(Some("  "));
        assert!(pair.user.display_name.starts_with("Guest "));
    }

    #[test]
    fn parses_bearer_header() {
        assert_eq!(bearer_token(Some("Bearer abc")), Ok("abc"));
        assert_eq!(bearer_token(Some("Basic abc")), Err(AuthError::MissingToken));
        assert_eq!(bearer_token(None), Err(AuthError::MissingToken));
    }
}
